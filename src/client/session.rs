// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use log::error;
use ssh_encoding::Encode;
use tokio::sync::oneshot;

use crate::client::Session;
use crate::session::{push_one, EncryptedState, GlobalRequestResponse};
use crate::{msg, ChannelId, Disconnect, Error, Sig};

impl Session {
    fn channel_open_generic<F>(&mut self, kind: &str, write_suffix: F) -> Result<ChannelId, Error>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
    {
        let result = if let Some(ref mut enc) = self.common.encrypted {
            match enc.state {
                EncryptedState::Authenticated => {
                    let sender_channel = enc.new_channel(
                        self.common.config.window_size,
                        self.common.config.maximum_packet_size,
                    );
                    let window_size = self.common.config.window_size;
                    let maximum_packet_size = self.common.config.maximum_packet_size;
                    push_one(&mut enc.write, |w| {
                        msg::CHANNEL_OPEN.encode(w)?;
                        kind.encode(w)?;
                        sender_channel.encode(w)?; // our channel id
                        window_size.encode(w)?;
                        maximum_packet_size.encode(w)?;
                        write_suffix(w)
                    })?;
                    sender_channel
                }
                _ => return Err(Error::NotAuthenticated),
            }
        } else {
            return Err(Error::Inconsistent);
        };
        Ok(result)
    }

    pub fn channel_open_session(&mut self) -> Result<ChannelId, Error> {
        self.channel_open_generic("session", |_| Ok(()))
    }

    pub fn channel_open_direct_tcpip(
        &mut self,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<ChannelId, Error> {
        self.channel_open_generic("direct-tcpip", |w| {
            host_to_connect.encode(w)?;
            port_to_connect.encode(w)?;
            originator_address.encode(w)?;
            originator_port.encode(w)?;
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn request_pty(
        &mut self,
        channel: ChannelId,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            if let Some(channel) = enc.channels.get(&channel) {
                let recipient = channel.recipient_channel;
                push_one(&mut enc.write, |w| {
                    msg::CHANNEL_REQUEST.encode(w)?;
                    recipient.encode(w)?;
                    "pty-req".encode(w)?;
                    (want_reply as u8).encode(w)?;
                    term.encode(w)?;
                    col_width.encode(w)?;
                    row_height.encode(w)?;
                    pix_width.encode(w)?;
                    pix_height.encode(w)?;
                    // Empty terminal modes: a single TTY_OP_END byte.
                    1u32.encode(w)?;
                    0u8.encode(w)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    pub fn set_env(
        &mut self,
        channel: ChannelId,
        want_reply: bool,
        variable_name: &str,
        variable_value: &str,
    ) -> Result<(), Error> {
        self.channel_request(channel, "env", want_reply, |w| {
            variable_name.encode(w)?;
            variable_value.encode(w)?;
            Ok(())
        })
    }

    pub fn request_shell(&mut self, want_reply: bool, channel: ChannelId) -> Result<(), Error> {
        self.channel_request(channel, "shell", want_reply, |_| Ok(()))
    }

    pub fn exec(
        &mut self,
        channel: ChannelId,
        want_reply: bool,
        command: &[u8],
    ) -> Result<(), Error> {
        self.channel_request(channel, "exec", want_reply, |w| {
            command.encode(w)?;
            Ok(())
        })
    }

    pub fn signal(&mut self, channel: ChannelId, signal: Sig) -> Result<(), Error> {
        self.channel_request(channel, "signal", false, |w| {
            signal.name().encode(w)?;
            Ok(())
        })
    }

    pub fn request_subsystem(
        &mut self,
        want_reply: bool,
        channel: ChannelId,
        name: &str,
    ) -> Result<(), Error> {
        self.channel_request(channel, "subsystem", want_reply, |w| {
            name.encode(w)?;
            Ok(())
        })
    }

    pub fn window_change(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.channel_request(channel, "window-change", false, |w| {
            col_width.encode(w)?;
            row_height.encode(w)?;
            pix_width.encode(w)?;
            pix_height.encode(w)?;
            Ok(())
        })
    }

    fn channel_request<F>(
        &mut self,
        channel: ChannelId,
        name: &str,
        want_reply: bool,
        write_suffix: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
    {
        if let Some(ref mut enc) = self.common.encrypted {
            if let Some(channel) = enc.channels.get(&channel) {
                let recipient = channel.recipient_channel;
                push_one(&mut enc.write, |w| {
                    msg::CHANNEL_REQUEST.encode(w)?;
                    recipient.encode(w)?;
                    name.encode(w)?;
                    (want_reply as u8).encode(w)?;
                    write_suffix(w)
                })?;
            } else {
                error!("channel request on unknown channel {channel}");
            }
        }
        Ok(())
    }

    /// Requests a TCP/IP forwarding from the server.
    ///
    /// If `reply` is not None, want_reply is set and the server's answer
    /// arrives through it: `Some(port)` on success, `None` on failure.
    pub fn tcpip_forward(
        &mut self,
        reply: Option<oneshot::Sender<Option<u32>>>,
        address: &str,
        port: u32,
    ) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            let want_reply = reply.is_some();
            if let Some(reply) = reply {
                self.open_global_requests
                    .push_back(GlobalRequestResponse::TcpIpForward(reply));
            }
            push_one(&mut enc.write, |w| {
                msg::GLOBAL_REQUEST.encode(w)?;
                "tcpip-forward".encode(w)?;
                (want_reply as u8).encode(w)?;
                address.encode(w)?;
                port.encode(w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Requests cancellation of a TCP/IP forwarding from the server.
    pub fn cancel_tcpip_forward(
        &mut self,
        reply: Option<oneshot::Sender<bool>>,
        address: &str,
        port: u32,
    ) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            let want_reply = reply.is_some();
            if let Some(reply) = reply {
                self.open_global_requests
                    .push_back(GlobalRequestResponse::CancelTcpIpForward(reply));
            }
            push_one(&mut enc.write, |w| {
                msg::GLOBAL_REQUEST.encode(w)?;
                "cancel-tcpip-forward".encode(w)?;
                (want_reply as u8).encode(w)?;
                address.encode(w)?;
                port.encode(w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub(crate) fn send_keepalive(&mut self, want_reply: bool) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            if want_reply {
                self.open_global_requests
                    .push_back(GlobalRequestResponse::Keepalive);
            }
            push_one(&mut enc.write, |w| {
                msg::GLOBAL_REQUEST.encode(w)?;
                "keepalive@openssh.com".encode(w)?;
                (want_reply as u8).encode(w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub(crate) fn send_ping(&mut self, reply: oneshot::Sender<()>) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            self.open_global_requests
                .push_back(GlobalRequestResponse::Ping(reply));
            push_one(&mut enc.write, |w| {
                msg::GLOBAL_REQUEST.encode(w)?;
                "keepalive@openssh.com".encode(w)?;
                1u8.encode(w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn data(&mut self, channel: ChannelId, data: Vec<u8>) {
        if let Some(ref mut enc) = self.common.encrypted {
            enc.data(channel, data)
        }
    }

    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: Vec<u8>) {
        if let Some(ref mut enc) = self.common.encrypted {
            enc.extended_data(channel, ext, data)
        }
    }

    pub fn eof(&mut self, channel: ChannelId) {
        if let Some(ref mut enc) = self.common.encrypted {
            enc.eof(channel)
        }
    }

    pub fn close(&mut self, channel: ChannelId) {
        if let Some(ref mut enc) = self.common.encrypted {
            enc.close(channel)
        }
    }

    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        self.common.disconnect(reason, description, language_tag);
    }

    /// The SSH id (protocol version + software version) the server sent
    /// when connecting. Per RFC 4253 §4.2 this is printable US-ASCII, so
    /// `String::from_utf8_lossy` is usually fine on it.
    pub fn remote_sshid(&self) -> &[u8] {
        &self.common.remote_sshid
    }
}

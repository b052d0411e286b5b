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

//! # Implementing clients
//!
//! A client connects with [`connect`] (or [`connect_stream`] for
//! non-socket transports), which spawns the session event loop and
//! returns a [`Handle`]. The handle authenticates and opens channels;
//! a [`Handler`] implemented by the consumer receives the host-key check
//! and unsolicited events. The event loop owns the socket: it reads,
//! decrypts and dispatches incoming packets, serializes every outgoing
//! packet, and drives key re-exchanges behind the scenes.

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::Either as EitherFuture;
use log::{debug, error, info, trace, warn};
use ssh_encoding::Decode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::pin;
use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use tokio::sync::oneshot;

use crate::auth::AuthResult;
use crate::channels::{Channel, ChannelMsg};
use crate::cipher::{self, clear, CipherPair, OpeningKey};
use crate::key::PrivateKeyWithHashAlg;
use crate::session::{
    CommonSession, EncryptedState, Exchange, GlobalRequestResponse, Kex, KexInit,
};
use crate::ssh_read::SshRead;
use crate::sshbuffer::{SSHBuffer, SshId};
use crate::{
    auth, msg, negotiation, ChannelId, ChannelOpenFailure, Disconnect, Error, Limits, Sig,
};

mod encrypted;
mod kex;
mod session;

/// Actual client session state: everything the event-loop task owns.
///
/// It multiplexes the channels opened during the session's lifetime and
/// serializes every byte that goes out on the wire.
pub struct Session {
    common: CommonSession<Arc<Config>>,
    receiver: Receiver<Msg>,
    sender: UnboundedSender<Reply>,
    channels: HashMap<ChannelId, UnboundedSender<ChannelMsg>>,
    target_window_size: u32,
    pending_reads: Vec<Vec<u8>>,
    pending_len: u32,
    inbound_channel_sender: Sender<Msg>,
    inbound_channel_receiver: Receiver<Msg>,
    open_global_requests: VecDeque<GlobalRequestResponse>,
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("drop session")
    }
}

#[derive(Debug)]
enum Reply {
    AuthSuccess,
    AuthFailure {
        remaining_methods: auth::MethodSet,
        partial_success: bool,
    },
    ChangePassword {
        prompt: String,
    },
    SignRequest {
        key: ssh_key::PublicKey,
        data: Vec<u8>,
    },
    AuthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
    ChannelOpenFailure,
}

#[derive(Debug)]
pub enum Msg {
    Authenticate {
        user: String,
        method: auth::Method,
    },
    AuthInfoResponse {
        responses: Vec<String>,
    },
    Signed {
        data: Vec<u8>,
    },
    ChannelOpenSession {
        sender: UnboundedSender<ChannelMsg>,
    },
    ChannelOpenDirectTcpIp {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
        sender: UnboundedSender<ChannelMsg>,
    },
    TcpIpForward {
        reply: Option<oneshot::Sender<Option<u32>>>,
        address: String,
        port: u32,
    },
    CancelTcpIpForward {
        reply: Option<oneshot::Sender<bool>>,
        address: String,
        port: u32,
    },
    Ping {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    Channel(ChannelId, ChannelMsg),
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg::Channel(id, msg)
    }
}

/// One prompt of a keyboard-interactive INFO_REQUEST.
#[derive(Debug)]
pub struct Prompt {
    pub prompt: String,
    pub echo: bool,
}

#[derive(Debug)]
pub enum KeyboardInteractiveAuthResponse {
    Success,
    Failure {
        remaining_methods: auth::MethodSet,
        partial_success: bool,
    },
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

/// Handle to a session, used to send messages to the event loop from
/// outside of the request/response cycle.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    join: tokio::task::JoinHandle<Result<(), H::Error>>,
    config: Arc<Config>,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Perform no authentication. Most servers allow this only to learn
    /// which methods may continue, reported in the failure result.
    pub async fn authenticate_none<U: Into<String>>(
        &mut self,
        user: U,
    ) -> Result<AuthResult, Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.into(),
                method: auth::Method::None,
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_reply().await
    }

    /// Perform password-based SSH authentication.
    pub async fn authenticate_password<U: Into<String>, P: Into<String>>(
        &mut self,
        user: U,
        password: P,
    ) -> Result<AuthResult, Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.into(),
                method: auth::Method::Password {
                    password: password.into(),
                },
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_reply().await
    }

    /// Perform public key-based SSH authentication.
    pub async fn authenticate_publickey<U: Into<String>>(
        &mut self,
        user: U,
        key: PrivateKeyWithHashAlg,
    ) -> Result<AuthResult, Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.into(),
                method: auth::Method::PublicKey { key },
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_reply().await
    }

    /// Authenticate with a public key whose signatures are produced
    /// elsewhere (an SSH agent, a hardware token) through the
    /// [`Signer`][auth::Signer] trait.
    pub async fn authenticate_publickey_with<U: Into<String>, S: auth::Signer>(
        &mut self,
        user: U,
        key: ssh_key::PublicKey,
        signer: &mut S,
    ) -> Result<AuthResult, S::Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.into(),
                method: auth::Method::FuturePublicKey { key },
            })
            .await
            .map_err(|_| crate::Error::SendError)?;
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(AuthResult::Success),
                Some(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                }) => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                Some(Reply::SignRequest { key, data }) => {
                    let data = signer.auth_publickey_sign(&key, data).await?;
                    self.sender
                        .send(Msg::Signed { data })
                        .await
                        .map_err(|_| crate::Error::SendError)?;
                }
                None => return Err(crate::Error::RecvError.into()),
                _ => {}
            }
        }
    }

    /// Initiate keyboard-interactive based SSH authentication.
    ///
    /// * `submethods` - Hints to the server the preferred methods to be
    ///   used for authentication.
    pub async fn authenticate_keyboard_interactive_start<
        U: Into<String>,
        S: Into<Option<String>>,
    >(
        &mut self,
        user: U,
        submethods: S,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.into(),
                method: auth::Method::KeyboardInteractive {
                    submethods: submethods.into().unwrap_or_default(),
                },
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    /// Respond to AuthInfoRequests from the server. A server can send
    /// any number of these, including empty ones; this may need to be
    /// called repeatedly until Success or Failure.
    pub async fn authenticate_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        self.sender
            .send(Msg::AuthInfoResponse { responses })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    async fn wait_recv_keyboard_interactive_reply(
        &mut self,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        let timeout = self.config.auth_timeout;
        let fut = async {
            loop {
                match self.receiver.recv().await {
                    Some(Reply::AuthSuccess) => return Ok(KeyboardInteractiveAuthResponse::Success),
                    Some(Reply::AuthFailure {
                        remaining_methods,
                        partial_success,
                    }) => {
                        return Ok(KeyboardInteractiveAuthResponse::Failure {
                            remaining_methods,
                            partial_success,
                        })
                    }
                    Some(Reply::AuthInfoRequest {
                        name,
                        instructions,
                        prompts,
                    }) => {
                        return Ok(KeyboardInteractiveAuthResponse::InfoRequest {
                            name,
                            instructions,
                            prompts,
                        });
                    }
                    None => return Err(Error::RecvError),
                    _ => {}
                }
            }
        };
        with_timeout(timeout, fut).await?
    }

    async fn wait_recv_reply(&mut self) -> Result<AuthResult, Error> {
        let timeout = self.config.auth_timeout;
        let fut = async {
            loop {
                match self.receiver.recv().await {
                    Some(Reply::AuthSuccess) => return Ok(AuthResult::Success),
                    Some(Reply::AuthFailure {
                        remaining_methods,
                        partial_success,
                    }) => {
                        return Ok(AuthResult::Failure {
                            remaining_methods,
                            partial_success,
                        })
                    }
                    Some(Reply::ChangePassword { prompt }) => {
                        return Ok(AuthResult::ChangePassword { prompt })
                    }
                    None => return Err(Error::RecvError),
                    _ => {}
                }
            }
        };
        with_timeout(timeout, fut).await?
    }

    /// Wait for confirmation that a channel is open
    async fn wait_channel_confirmation(
        &self,
        mut receiver: UnboundedReceiver<ChannelMsg>,
    ) -> Result<Channel<Msg>, Error> {
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open {
                    id,
                    max_packet_size,
                    window_size,
                }) => {
                    return Ok(Channel {
                        id,
                        sender: self.sender.clone(),
                        receiver,
                        max_packet_size,
                        window_size,
                    });
                }
                Some(ChannelMsg::OpenFailure(reason)) => {
                    return Err(Error::ChannelOpenFailure(reason));
                }
                None => {
                    return Err(Error::Disconnect);
                }
                msg => {
                    debug!("msg = {:?}", msg);
                }
            }
        }
    }

    /// Request a session channel (the most basic type of channel). The
    /// returned channel becomes usable once the server confirms it.
    pub async fn channel_open_session(&self) -> Result<Channel<Msg>, Error> {
        let (sender, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenSession { sender })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Open a TCP/IP forwarding channel. This is usually done when a
    /// connection comes to a locally forwarded TCP/IP port. See
    /// [RFC 4254](https://tools.ietf.org/html/rfc4254#section-7).
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel<Msg>, Error> {
        let (sender, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenDirectTcpIp {
                host_to_connect: host_to_connect.into(),
                port_to_connect,
                originator_address: originator_address.into(),
                originator_port,
                sender,
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Ask the server to start forwarding a remote port to us. On
    /// success the server reports the bound port (useful when 0 was
    /// requested).
    pub async fn tcpip_forward<A: Into<String>>(
        &mut self,
        address: A,
        port: u32,
    ) -> Result<Option<u32>, Error> {
        let (reply, reply_recv) = oneshot::channel();
        self.sender
            .send(Msg::TcpIpForward {
                reply: Some(reply),
                address: address.into(),
                port,
            })
            .await
            .map_err(|_| Error::SendError)?;
        reply_recv.await.map_err(|_| Error::RecvError)
    }

    pub async fn cancel_tcpip_forward<A: Into<String>>(
        &self,
        address: A,
        port: u32,
    ) -> Result<bool, Error> {
        let (reply, reply_recv) = oneshot::channel();
        self.sender
            .send(Msg::CancelTcpIpForward {
                reply: Some(reply),
                address: address.into(),
                port,
            })
            .await
            .map_err(|_| Error::SendError)?;
        reply_recv.await.map_err(|_| Error::RecvError)
    }

    /// Send a keepalive probe and wait for the server's answer.
    pub async fn ping(&self) -> Result<(), Error> {
        let (reply, reply_recv) = oneshot::channel();
        self.sender
            .send(Msg::Ping { reply })
            .await
            .map_err(|_| Error::SendError)?;
        reply_recv.await.map_err(|_| Error::RecvError)
    }

    /// Send a disconnect message.
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description: description.into(),
                language_tag: language_tag.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Send data to an open channel by id; for channels created by this
    /// handle, prefer the methods on [`Channel`].
    pub async fn data(&self, id: ChannelId, data: Vec<u8>) -> Result<(), Error> {
        self.sender
            .send(Msg::Channel(id, ChannelMsg::Data { data }))
            .await
            .map_err(|_| Error::SendError)
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Connect to the address specified, using the [`Handler`] and [`Config`]
/// given. The returned [`Handle`] is then used to authenticate and to
/// open channels, which in turn tunnel TCP connections, run commands,
/// etc.
pub async fn connect<H: Handler + Send + 'static, A: ToSocketAddrs>(
    config: Arc<Config>,
    addrs: A,
    handler: H,
) -> Result<Handle<H>, H::Error> {
    let timeout = config.connection_timeout;
    let fut = async {
        let socket = TcpStream::connect(addrs)
            .await
            .map_err(crate::Error::from)?;
        connect_stream(config, socket, handler).await
    };
    match with_timeout(timeout, fut).await {
        Ok(r) => r,
        Err(e) => Err(H::Error::from(e)),
    }
}

/// Connect a stream to a server. The stream must implement
/// [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`], as well as
/// [`Unpin`] and [`Send`]; typically [`connect`] is what you want.
pub async fn connect_stream<H, R>(
    config: Arc<Config>,
    mut stream: R,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Writing SSH id.
    let mut write_buffer = SSHBuffer::new();
    write_buffer.send_ssh_id(&config.as_ref().client_id);
    stream
        .write_all(&write_buffer.buffer)
        .await
        .map_err(crate::Error::from)?;
    write_buffer.buffer.clear();

    // Reading SSH id and allocating a session if correct.
    let mut stream = SshRead::new(stream);
    let sshid = stream.read_ssh_id().await?;
    let (handle_sender, session_receiver) = channel(10);
    let (session_sender, handle_receiver) = unbounded_channel();
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not be larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }
    let mut session = Session::new(
        config.window_size,
        CommonSession {
            write_buffer,
            kex: None,
            auth_user: String::new(),
            auth_method: None,
            remote_sshid: sshid.clone(),
            cipher: CipherPair {
                local_to_remote: Box::new(clear::Key),
                remote_to_local: Box::new(clear::Key),
            },
            encrypted: None,
            config: config.clone(),
            disconnected: false,
            buffer: Vec::new(),
            alive_timeouts: 0,
        },
        session_receiver,
        session_sender,
    );
    session.begin_kex(&sshid)?;
    let (encrypted_signal, encrypted_recv) = oneshot::channel();
    let join = tokio::spawn(session.run(stream, handler, Some(encrypted_signal)));

    if encrypted_recv.await.is_err() {
        join.await.map_err(crate::Error::from)??;
        return Err(H::Error::from(crate::Error::Disconnect));
    }

    Ok(Handle {
        sender: handle_sender,
        receiver: handle_receiver,
        join,
        config,
    })
}

async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: Box<dyn OpeningKey + Send>,
) -> Result<(usize, R, SSHBuffer, Box<dyn OpeningKey + Send>), Error> {
    let n = cipher::read(&mut stream_read, &mut buffer, &mut *cipher).await?;
    Ok((n, stream_read, buffer, cipher))
}

impl Session {
    fn new(
        target_window_size: u32,
        common: CommonSession<Arc<Config>>,
        receiver: Receiver<Msg>,
        sender: UnboundedSender<Reply>,
    ) -> Self {
        let (inbound_channel_sender, inbound_channel_receiver) = channel(10);
        Self {
            common,
            receiver,
            sender,
            target_window_size,
            inbound_channel_sender,
            inbound_channel_receiver,
            channels: HashMap::new(),
            pending_reads: Vec::new(),
            pending_len: 0,
            open_global_requests: VecDeque::new(),
        }
    }

    /// Send our KEXINIT as soon as the version lines have been exchanged.
    fn begin_kex(&mut self, server_sshid: &[u8]) -> Result<(), Error> {
        let exchange = Exchange::new(
            self.common.config.client_id.as_kex_hash_bytes(),
            server_sshid,
        );
        let mut kexinit = KexInit {
            exchange,
            algo: None,
            sent: false,
            session_id: None,
        };
        kexinit.client_write(
            self.common.config.as_ref(),
            &mut *self.common.cipher.local_to_remote,
            &mut self.common.write_buffer,
        )?;
        self.common.kex = Some(Kex::Init(kexinit));
        Ok(())
    }

    async fn run<H: Handler + Send, R: AsyncRead + AsyncWrite + Unpin + Send>(
        mut self,
        stream: SshRead<R>,
        mut handler: H,
        mut encrypted_signal: Option<oneshot::Sender<()>>,
    ) -> Result<(), H::Error> {
        if !self.common.write_buffer.buffer.is_empty() {
            debug!("writing {:?} bytes", self.common.write_buffer.buffer.len());
        }
        let (stream_read, mut stream_write) = tokio::io::split(stream);
        stream_write
            .write_all(&self.common.write_buffer.buffer)
            .await
            .map_err(crate::Error::from)?;
        stream_write.flush().await.map_err(crate::Error::from)?;
        self.common.write_buffer.buffer.clear();

        let mut decomp = Vec::new();
        let buffer = SSHBuffer::new();

        // Hand the opening cipher to the reading future, swapping it back
        // in whenever a packet has arrived.
        let mut opening_cipher = Box::new(clear::Key) as Box<dyn OpeningKey + Send>;
        std::mem::swap(&mut opening_cipher, &mut self.common.cipher.remote_to_local);

        let keepalive_interval = self.common.config.keepalive_interval;
        let inactivity_timeout = self.common.config.inactivity_timeout;
        let keepalive_timer = future_or_pending(keepalive_interval, tokio::time::sleep);
        pin!(keepalive_timer);
        let inactivity_timer = future_or_pending(inactivity_timeout, tokio::time::sleep);
        pin!(inactivity_timer);

        let reading = start_reading(stream_read, buffer, opening_cipher);
        pin!(reading);

        let result: Result<(), H::Error> = loop {
            if self.common.disconnected {
                break Ok(());
            }
            tokio::select! {
                r = &mut reading => {
                    let (n, stream_read, mut buffer, mut opening_cipher) = match r {
                        Ok(x) => x,
                        Err(e) => {
                            let e = match e {
                                crate::Error::IO(ref io)
                                    if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                                {
                                    crate::Error::HUP
                                }
                                e => e,
                            };
                            // A broken packet is fatal; tell the peer why
                            // before tearing down (best effort).
                            match e {
                                crate::Error::PacketAuth | crate::Error::DecryptionError => {
                                    self.common.disconnect(
                                        Disconnect::MACError,
                                        "Packet authentication failed",
                                        "",
                                    );
                                }
                                crate::Error::PacketSize(_) => {
                                    self.common.disconnect(
                                        Disconnect::ProtocolError,
                                        "Bad packet length",
                                        "",
                                    );
                                }
                                _ => {}
                            }
                            break Err(e.into());
                        }
                    };
                    std::mem::swap(&mut opening_cipher, &mut self.common.cipher.remote_to_local);

                    if n == 0 {
                        break Err(crate::Error::HUP.into());
                    }

                    self.common.alive_timeouts = 0;
                    if inactivity_timeout.is_some() {
                        inactivity_timer.set(future_or_pending(inactivity_timeout, tokio::time::sleep));
                    }

                    // The sequence number of the packet we just read.
                    let seqn = buffer.seqn.0.wrapping_sub(1);

                    if let Err(e) = self.handle_packet(&mut handler, &mut encrypted_signal, &buffer.buffer, seqn, &mut decomp).await {
                        break Err(e);
                    }

                    std::mem::swap(&mut opening_cipher, &mut self.common.cipher.remote_to_local);
                    buffer.buffer.clear();
                    buffer.len = 0;
                    reading.set(start_reading(stream_read, buffer, opening_cipher));
                }
                () = &mut keepalive_timer => {
                    if self.common.config.keepalive_max != 0
                        && self.common.alive_timeouts > self.common.config.keepalive_max {
                        break Err(crate::Error::KeepaliveTimeout.into());
                    }
                    self.common.alive_timeouts = self.common.alive_timeouts.saturating_add(1);
                    if let Err(e) = self.send_keepalive(true) {
                        break Err(e.into());
                    }
                    keepalive_timer.set(future_or_pending(keepalive_interval, tokio::time::sleep));
                }
                () = &mut inactivity_timer => {
                    break Err(crate::Error::InactivityTimeout.into());
                }
                msg = self.receiver.recv(), if !self.is_rekeying() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_msg(msg) {
                                break Err(e.into());
                            }
                        }
                        None => {
                            self.common.disconnected = true;
                            break Ok(());
                        }
                    };

                    // Eagerly take all outgoing messages so writes are batched.
                    while !self.is_rekeying() {
                        match self.receiver.try_recv() {
                            Ok(next) => {
                                if self.handle_msg(next).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break
                        }
                    }
                }
                msg = self.inbound_channel_receiver.recv(), if !self.is_rekeying() => {
                    if let Some(msg) = msg {
                        if let Err(e) = self.handle_msg(msg) {
                            break Err(e.into());
                        }
                    }

                    while !self.is_rekeying() {
                        match self.inbound_channel_receiver.try_recv() {
                            Ok(next) => {
                                if self.handle_msg(next).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break
                        }
                    }
                }
            }

            if let Err(e) = self.flush() {
                break Err(e.into());
            }
            if !self.common.write_buffer.buffer.is_empty() {
                trace!(
                    "writing to stream: {:?} bytes",
                    self.common.write_buffer.buffer.len()
                );
                if let Err(e) = stream_write.write_all(&self.common.write_buffer.buffer).await {
                    break Err(crate::Error::from(e).into());
                }
                if let Err(e) = stream_write.flush().await {
                    break Err(crate::Error::from(e).into());
                }
            }
            self.common.write_buffer.buffer.clear();
            if let Some(ref mut enc) = self.common.encrypted {
                if let EncryptedState::InitCompression = enc.state {
                    enc.client_compression.init_compress(&mut enc.compress);
                    enc.state = EncryptedState::Authenticated;
                }
            }
        };

        // Best effort: drain the write buffer (it may hold a DISCONNECT)
        // and shut the stream down.
        let _ = self.flush();
        if !self.common.write_buffer.buffer.is_empty() {
            let _ = stream_write.write_all(&self.common.write_buffer.buffer).await;
            let _ = stream_write.flush().await;
        }
        let _ = stream_write.shutdown().await;
        debug!("disconnected");
        result
    }

    /// Dispatch a just-read cleartext packet (`buffer` holds
    /// `length | padding_length | payload`).
    async fn handle_packet<H: Handler + Send>(
        &mut self,
        handler: &mut H,
        encrypted_signal: &mut Option<oneshot::Sender<()>>,
        buffer: &[u8],
        seqn: u32,
        decomp: &mut Vec<u8>,
    ) -> Result<(), H::Error> {
        if buffer.len() < 5 {
            return Err(crate::Error::Inconsistent.into());
        }
        #[allow(clippy::indexing_slicing)] // length checked
        let raw = &buffer[5..];
        let buf: &[u8] = if let Some(ref mut enc) = self.common.encrypted {
            enc.decompress.decompress(raw, decomp)?
        } else {
            raw
        };
        if buf.is_empty() {
            return Ok(());
        }
        match buf.first() {
            Some(&msg::DISCONNECT) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let reason_code = u32::decode(r).map_err(crate::Error::from)?;
                let description = String::decode(r).unwrap_or_default();
                let reason = Disconnect::try_from(reason_code)
                    .unwrap_or(Disconnect::ProtocolError);
                debug!("peer disconnected: {reason:?} {description:?}");
                self.common.disconnected = true;
                if reason == Disconnect::ByApplication {
                    Ok(())
                } else {
                    Err(crate::Error::Disconnected {
                        reason,
                        description,
                    }
                    .into())
                }
            }
            Some(&msg::IGNORE) => Ok(()),
            Some(&msg::DEBUG) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let _always_display = u8::decode(r).unwrap_or(0);
                let message = String::decode(r).unwrap_or_default();
                debug!("debug message from peer: {message:?}");
                Ok(())
            }
            Some(&msg::UNIMPLEMENTED) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let rejected = u32::decode(&mut r).unwrap_or(0);
                warn!("peer rejected our packet #{rejected}");
                Err(crate::Error::Unimplemented(rejected).into())
            }
            _ => self.reply(handler, encrypted_signal, buf, seqn).await,
        }
    }

    /// Drive the initial key exchange, then hand everything else to the
    /// encrypted dispatch.
    async fn reply<H: Handler + Send>(
        &mut self,
        handler: &mut H,
        encrypted_signal: &mut Option<oneshot::Sender<()>>,
        buf: &[u8],
        seqn: u32,
    ) -> Result<(), H::Error> {
        match self.common.kex.take() {
            Some(Kex::Init(kexinit)) => {
                if kexinit.algo.is_some()
                    || buf.first() == Some(&msg::KEXINIT)
                    || self.common.encrypted.is_none()
                {
                    let next = kexinit.client_parse(
                        self.common.config.as_ref(),
                        &mut *self.common.cipher.local_to_remote,
                        buf,
                        &mut self.common.write_buffer,
                    )?;
                    self.common.kex = Some(next);
                    self.flush()?;
                }
                Ok(())
            }
            Some(Kex::GexGroup(gex)) => {
                let next = gex.client_gex_group(
                    self.common.config.as_ref(),
                    &mut *self.common.cipher.local_to_remote,
                    buf,
                    &mut self.common.write_buffer,
                )?;
                self.common.kex = Some(next);
                Ok(())
            }
            Some(Kex::DhDone(mut kexdhdone)) => {
                if kexdhdone.names.ignore_guessed {
                    // The first-kex-packet-follows guess was wrong;
                    // this packet is the bad guess, drop it.
                    kexdhdone.names.ignore_guessed = false;
                    self.common.kex = Some(Kex::DhDone(kexdhdone));
                    Ok(())
                } else if buf.first() == Some(&kexdhdone.expected_reply()) {
                    let newkeys = kexdhdone.server_key_check(false, handler, buf).await?;
                    self.common.kex = Some(Kex::Keys(newkeys));
                    self.common
                        .cipher
                        .local_to_remote
                        .write(&[msg::NEWKEYS], &mut self.common.write_buffer);
                    self.flush()?;
                    Ok(())
                } else {
                    error!("Wrong packet received");
                    Err(crate::Error::Inconsistent.into())
                }
            }
            Some(Kex::Keys(newkeys)) => {
                debug!("newkeys received");
                if buf.first() != Some(&msg::NEWKEYS) {
                    return Err(crate::Error::Kex.into());
                }
                if let Some(sender) = encrypted_signal.take() {
                    sender.send(()).unwrap_or(());
                }
                self.common.write_buffer.bytes = 0;
                self.common.write_buffer.packets = 0;
                self.common.encrypted(
                    EncryptedState::WaitingAuthServiceRequest {
                        accepted: false,
                        sent: false,
                    },
                    newkeys,
                );
                Ok(())
            }
            None => self.client_read_encrypted(handler, buf, seqn).await,
        }
    }

    fn handle_msg(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::Authenticate { user, method } => {
                self.write_auth_request_if_needed(&user, method)?;
            }
            Msg::Signed { .. } => {}
            Msg::AuthInfoResponse { .. } => {}
            Msg::ChannelOpenSession { sender } => {
                let id = self.channel_open_session()?;
                self.channels.insert(id, sender);
            }
            Msg::ChannelOpenDirectTcpIp {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
                sender,
            } => {
                let id = self.channel_open_direct_tcpip(
                    &host_to_connect,
                    port_to_connect,
                    &originator_address,
                    originator_port,
                )?;
                self.channels.insert(id, sender);
            }
            Msg::TcpIpForward {
                reply,
                address,
                port,
            } => self.tcpip_forward(reply, &address, port)?,
            Msg::CancelTcpIpForward {
                reply,
                address,
                port,
            } => self.cancel_tcpip_forward(reply, &address, port)?,
            Msg::Ping { reply } => self.send_ping(reply)?,
            Msg::Disconnect {
                reason,
                description,
                language_tag,
            } => self.disconnect(reason, &description, &language_tag),
            Msg::Channel(id, ChannelMsg::Data { data }) => self.data(id, data),
            Msg::Channel(id, ChannelMsg::ExtendedData { data, ext }) => {
                self.extended_data(id, ext, data)
            }
            Msg::Channel(id, ChannelMsg::Eof) => self.eof(id),
            Msg::Channel(id, ChannelMsg::Close) => self.close(id),
            Msg::Channel(
                id,
                ChannelMsg::RequestPty {
                    want_reply,
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
            ) => self.request_pty(
                id, want_reply, &term, col_width, row_height, pix_width, pix_height,
            )?,
            Msg::Channel(
                id,
                ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
            ) => self.window_change(id, col_width, row_height, pix_width, pix_height)?,
            Msg::Channel(
                id,
                ChannelMsg::SetEnv {
                    want_reply,
                    variable_name,
                    variable_value,
                },
            ) => self.set_env(id, want_reply, &variable_name, &variable_value)?,
            Msg::Channel(id, ChannelMsg::RequestShell { want_reply }) => {
                self.request_shell(want_reply, id)?
            }
            Msg::Channel(id, ChannelMsg::Exec {
                want_reply,
                command,
            }) => self.exec(id, want_reply, &command)?,
            Msg::Channel(id, ChannelMsg::Signal { signal }) => self.signal(id, signal)?,
            Msg::Channel(id, ChannelMsg::RequestSubsystem { want_reply, name }) => {
                self.request_subsystem(want_reply, id, &name)?
            }
            msg => {
                // The receiver only gets messages from methods
                // implemented within this crate.
                warn!("unhandled message in the event loop: {:?}", msg);
            }
        }
        Ok(())
    }

    fn is_rekeying(&self) -> bool {
        if let Some(ref enc) = self.common.encrypted {
            enc.rekey.is_some()
        } else {
            true
        }
    }

    /// Flush the temporary cleartext buffer into the encryption buffer,
    /// initiating a rekey when a limit was crossed. This does *not*
    /// flush to the socket.
    fn flush(&mut self) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            if enc.flush(
                &self.common.config.as_ref().limits,
                &mut *self.common.cipher.local_to_remote,
                &mut self.common.write_buffer,
            )? && enc.rekey.is_none()
            {
                info!("re-exchanging keys");
                if let Some(exchange) = enc.exchange.take() {
                    let mut kexinit = KexInit::initiate_rekey(exchange, &enc.session_id);
                    kexinit.client_write(
                        self.common.config.as_ref(),
                        &mut *self.common.cipher.local_to_remote,
                        &mut self.common.write_buffer,
                    )?;
                    enc.rekey = Some(Kex::Init(kexinit))
                }
            }
        }
        Ok(())
    }

    /// Send a `ChannelMsg` to the consumer-facing channel handle.
    pub(crate) fn send_channel_msg(&self, channel: ChannelId, msg: ChannelMsg) -> bool {
        if let Some(chan) = self.channels.get(&channel) {
            chan.send(msg).unwrap_or(());
            true
        } else {
            false
        }
    }
}

/// Returns `f(val)` if `val` is [Some], or a forever-pending future.
fn future_or_pending<R, F: Future<Output = R>, T>(
    val: Option<T>,
    f: impl FnOnce(T) -> F,
) -> EitherFuture<std::future::Pending<R>, F> {
    match val {
        None => EitherFuture::Left(std::future::pending()),
        Some(x) => EitherFuture::Right(f(x)),
    }
}

async fn with_timeout<R>(
    duration: Option<std::time::Duration>,
    fut: impl Future<Output = R>,
) -> Result<R, Error> {
    match duration {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| Error::ConnectionTimeout),
        None => Ok(fut.await),
    }
}

/// The configuration of clients.
#[derive(Debug, Clone)]
pub struct Config {
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: SshId,
    /// The bytes, packets and time limits before key re-exchange.
    pub limits: Limits,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Lists of preferred algorithms.
    pub preferred: negotiation::Preferred,
    /// Time after which an unestablished connection is abandoned.
    pub connection_timeout: Option<std::time::Duration>,
    /// Time an authentication round-trip may take.
    pub auth_timeout: Option<std::time::Duration>,
    /// Interval between keepalive probes.
    pub keepalive_interval: Option<std::time::Duration>,
    /// How many unanswered keepalives before giving up (0 = never).
    pub keepalive_max: usize,
    /// Time without any received data after which the session is torn
    /// down.
    pub inactivity_timeout: Option<std::time::Duration>,
    /// Group size bounds for diffie-hellman-group-exchange.
    pub gex: GexParams,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            limits: Limits::default(),
            window_size: 2 * 1024 * 1024,
            maximum_packet_size: 32768,
            preferred: Default::default(),
            connection_timeout: None,
            auth_timeout: None,
            keepalive_interval: None,
            keepalive_max: 3,
            inactivity_timeout: None,
            gex: GexParams::default(),
        }
    }
}

/// Group size bounds for RFC 4419 group exchange.
#[derive(Debug, Clone)]
pub struct GexParams {
    min_group_size: usize,
    preferred_group_size: usize,
    max_group_size: usize,
}

impl GexParams {
    pub fn new(
        min_group_size: usize,
        preferred_group_size: usize,
        max_group_size: usize,
    ) -> Result<Self, Error> {
        if min_group_size < 1024
            || min_group_size > preferred_group_size
            || preferred_group_size > max_group_size
        {
            return Err(Error::BadDhParameters);
        }
        Ok(Self {
            min_group_size,
            preferred_group_size,
            max_group_size,
        })
    }

    pub fn min_group_size(&self) -> usize {
        self.min_group_size
    }

    pub fn preferred_group_size(&self) -> usize {
        self.preferred_group_size
    }

    pub fn max_group_size(&self) -> usize {
        self.max_group_size
    }
}

impl Default for GexParams {
    fn default() -> Self {
        Self {
            min_group_size: 2048,
            preferred_group_size: 3072,
            max_group_size: 8192,
        }
    }
}

/// A client handler. Note that messages can be received from the server
/// at any time during a session.
///
/// Note: this is an `async_trait`. Click `[source]` on the right to see
/// the actual async function definitions.
#[async_trait]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send;

    /// Called to check the server's public key. This is a very important
    /// step to help prevent man-in-the-middle attacks. The default
    /// implementation rejects all keys.
    #[allow(unused_variables)]
    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Called when the server sends us an authentication banner. This is
    /// usually meant to be shown to the user, see
    /// [RFC 4252](https://tools.ietf.org/html/rfc4252#section-5.4).
    #[allow(unused_variables)]
    async fn auth_banner(
        &mut self,
        banner: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server confirmed our request to open a channel.
    /// A channel can only be written to after receiving this message.
    #[allow(unused_variables)]
    async fn channel_open_confirmation(
        &mut self,
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server signals success on a channel request.
    #[allow(unused_variables)]
    async fn channel_success(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server signals failure on a channel request.
    #[allow(unused_variables)]
    async fn channel_failure(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server closes a channel.
    #[allow(unused_variables)]
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends EOF to a channel.
    #[allow(unused_variables)]
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server rejected our request to open a channel.
    #[allow(unused_variables)]
    async fn channel_open_failure(
        &mut self,
        channel: ChannelId,
        reason: ChannelOpenFailure,
        description: &str,
        language: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens a channel for a new remote port
    /// forwarding connection.
    #[allow(unused_variables)]
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens an X11 forwarding channel.
    #[allow(unused_variables)]
    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends us data. The `extended_code`
    /// parameter is a stream identifier: `None` is the standard output,
    /// `Some(1)` the standard error. See
    /// [RFC 4254](https://tools.ietf.org/html/rfc4254#section-5.2).
    #[allow(unused_variables)]
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends us extended data.
    #[allow(unused_variables)]
    async fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the network window is adjusted, meaning that we can
    /// send more bytes.
    #[allow(unused_variables)]
    async fn window_adjusted(
        &mut self,
        channel: ChannelId,
        new_size: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The remote process has exited with the given exit status.
    #[allow(unused_variables)]
    async fn exit_status(
        &mut self,
        channel: ChannelId,
        exit_status: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The remote process exited upon receiving a signal.
    #[allow(unused_variables)]
    async fn exit_signal(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

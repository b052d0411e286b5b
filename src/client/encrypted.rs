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

use log::{debug, error, info, trace, warn};
use ssh_encoding::{Decode, Encode};

use crate::auth;
use crate::channels::{Channel, ChannelMsg};
use crate::client::{Handler, Msg, Prompt, Reply, Session};
use crate::key::best_rsa_hash;
use crate::parsing::{ChannelOpenConfirmation, ChannelType, OpenChannelMessage};
use crate::session::{
    push_one, ChannelParams, Encrypted, EncryptedState, GlobalRequestResponse, Kex, KexInit,
};
use crate::{msg, negotiation, ChannelId, ChannelOpenFailure, Error, Sig};

impl Session {
    /// Dispatch one packet received after the first NEWKEYS. Key
    /// re-exchanges are handled here; everything else moves on to
    /// [`Session::process_packet`].
    pub(crate) async fn client_read_encrypted<H: Handler>(
        &mut self,
        client: &mut H,
        buf: &[u8],
        seqn: u32,
    ) -> Result<(), H::Error> {
        #[allow(clippy::indexing_slicing)] // length checked
        {
            trace!(
                "client_read_encrypted, buf = {:?}",
                &buf[..buf.len().min(20)]
            );
        }
        // Either this packet is a KEXINIT, in which case we start a key
        // re-exchange.
        if buf.first() == Some(&msg::KEXINIT) {
            debug!("received KEXINIT");
            if let Some(ref mut enc) = self.common.encrypted {
                // Either we initiated (rekey is Init and our KEXINIT is
                // already out), or the server did and we follow along.
                let kexinit = if let Some(Kex::Init(kexinit)) = enc.rekey.take() {
                    Some(kexinit)
                } else if let Some(exchange) = enc.exchange.take() {
                    Some(KexInit::received_rekey(
                        exchange,
                        negotiation::read_kex(buf, &self.common.config.as_ref().preferred)?,
                        &enc.session_id,
                    ))
                } else {
                    None
                };

                if let Some(mut kexinit) = kexinit {
                    if kexinit.algo.is_none() {
                        kexinit.exchange.server_kex_init = buf.to_vec();
                        kexinit.algo = Some(negotiation::read_kex(
                            buf,
                            &self.common.config.as_ref().preferred,
                        )?);
                    } else {
                        kexinit.exchange.server_kex_init = buf.to_vec();
                    }

                    enc.rekey = Some(kexinit.client_parse(
                        self.common.config.as_ref(),
                        &mut *self.common.cipher.local_to_remote,
                        buf,
                        &mut self.common.write_buffer,
                    )?);
                }
            } else {
                return Err(Error::Inconsistent.into());
            }
            self.flush()?;
            return Ok(());
        }

        if let Some(ref mut enc) = self.common.encrypted {
            match enc.rekey.take() {
                Some(Kex::GexGroup(gex)) => {
                    enc.rekey = Some(gex.client_gex_group(
                        self.common.config.as_ref(),
                        &mut *self.common.cipher.local_to_remote,
                        buf,
                        &mut self.common.write_buffer,
                    )?);
                    return Ok(());
                }
                Some(Kex::DhDone(mut kexdhdone)) => {
                    return if kexdhdone.names.ignore_guessed {
                        kexdhdone.names.ignore_guessed = false;
                        enc.rekey = Some(Kex::DhDone(kexdhdone));
                        Ok(())
                    } else if buf.first() == Some(&kexdhdone.expected_reply()) {
                        // Rekeys trust the already-verified host key; only
                        // the signature over the new exchange hash counts.
                        let newkeys = kexdhdone.server_key_check(true, client, buf).await?;
                        if let Some(ref mut enc) = self.common.encrypted {
                            enc.rekey = Some(Kex::Keys(newkeys));
                        }
                        self.common
                            .cipher
                            .local_to_remote
                            .write(&[msg::NEWKEYS], &mut self.common.write_buffer);
                        self.flush()?;
                        Ok(())
                    } else {
                        error!("wrong packet received during rekey");
                        Err(Error::Inconsistent.into())
                    };
                }
                Some(Kex::Keys(newkeys)) => {
                    if buf.first() != Some(&msg::NEWKEYS) {
                        return Err(Error::Kex.into());
                    }
                    // Keys swap at this boundary; rekey counters restart.
                    self.common.write_buffer.bytes = 0;
                    self.common.write_buffer.packets = 0;
                    enc.last_rekey = std::time::Instant::now();

                    enc.flush_all_pending();
                    let mut pending = std::mem::take(&mut self.pending_reads);
                    self.common.newkeys(newkeys);
                    for p in pending.drain(..) {
                        self.process_packet(client, &p, seqn).await?;
                    }
                    self.pending_reads = pending;
                    self.pending_len = 0;
                    self.flush()?;
                    return Ok(());
                }
                Some(Kex::Init(k)) => {
                    // Our KEXINIT is out but the server's hasn't arrived;
                    // queue whatever else comes in until it has.
                    enc.rekey = Some(Kex::Init(k));
                    self.pending_len += buf.len() as u32;
                    if self.pending_len > 2 * self.target_window_size {
                        return Err(Error::Pending.into());
                    }
                    self.pending_reads.push(buf.to_vec());
                    return Ok(());
                }
                rek => enc.rekey = rek,
            }
        }
        self.process_packet(client, buf, seqn).await
    }

    async fn process_packet<H: Handler>(
        &mut self,
        client: &mut H,
        buf: &[u8],
        seqn: u32,
    ) -> Result<(), H::Error> {
        trace!("process_packet, {:?} bytes", buf.len());
        let mut is_authenticated = false;
        if let Some(ref mut enc) = self.common.encrypted {
            match enc.state {
                EncryptedState::WaitingAuthServiceRequest {
                    ref mut accepted, ..
                } => {
                    if buf.first() == Some(&msg::SERVICE_ACCEPT) {
                        let mut r = buf.get(1..).unwrap_or_default();
                        if String::decode(&mut r).map_err(Error::from)? == "ssh-userauth" {
                            *accepted = true;
                            if let Some(ref meth) = self.common.auth_method {
                                let auth_request = auth::AuthRequest {
                                    methods: auth::MethodSet::all(),
                                    partial_success: false,
                                    current: match meth {
                                        auth::Method::KeyboardInteractive { submethods } => {
                                            Some(auth::CurrentRequest::KeyboardInteractive {
                                                submethods: submethods.to_string(),
                                            })
                                        }
                                        _ => None,
                                    },
                                };
                                let auth_user = self.common.auth_user.clone();
                                if enc.write_auth_request(&auth_user, meth)? {
                                    enc.state = EncryptedState::WaitingAuthRequest(auth_request)
                                }
                            } else {
                                debug!("no auth method yet")
                            }
                        }
                    } else if buf.first() == Some(&msg::EXT_INFO) {
                        return self.handle_ext_info(buf);
                    } else {
                        debug!("unexpected message: {:?}", buf.first());
                        return Err(Error::Inconsistent.into());
                    }
                }
                EncryptedState::WaitingAuthRequest(ref mut auth_request) => {
                    if buf.first() == Some(&msg::USERAUTH_SUCCESS) {
                        debug!("userauth_success");
                        self.sender
                            .send(Reply::AuthSuccess)
                            .map_err(|_| Error::SendError)?;
                        enc.state = EncryptedState::InitCompression;
                        enc.server_compression.init_decompress(&mut enc.decompress);
                        return Ok(());
                    } else if buf.first() == Some(&msg::USERAUTH_BANNER) {
                        let mut r = buf.get(1..).unwrap_or_default();
                        let banner = String::decode(&mut r).map_err(Error::from)?;
                        return client.auth_banner(&banner, self).await;
                    } else if buf.first() == Some(&msg::USERAUTH_FAILURE) {
                        debug!("userauth_failure");
                        let (remaining_methods, partial_success) =
                            auth::parse_userauth_failure(buf.get(1..).unwrap_or_default())
                                .map_err(Error::from)?;
                        auth_request.methods = remaining_methods;
                        auth_request.partial_success = partial_success;
                        self.common.auth_method = None;
                        self.sender
                            .send(Reply::AuthFailure {
                                remaining_methods,
                                partial_success,
                            })
                            .map_err(|_| Error::SendError)?;
                        // If no methods are left, this can never succeed.
                        if auth_request.methods.is_empty() && !auth_request.partial_success {
                            return Err(Error::NoAuthMethod.into());
                        }
                    } else if buf.first() == Some(&msg::USERAUTH_PK_OK) {
                        // Depending on the method in flight, message 60 is
                        // PK_OK, PASSWD_CHANGEREQ or INFO_REQUEST.
                        match auth_request.current {
                            Some(auth::CurrentRequest::KeyboardInteractive { .. }) => {
                                return self.read_auth_info_request(buf).await;
                            }
                            _ => match self.common.auth_method.take() {
                                Some(auth::Method::Password { .. }) => {
                                    let mut r = buf.get(1..).unwrap_or_default();
                                    let prompt = String::decode(&mut r).map_err(Error::from)?;
                                    let _lang = String::decode(&mut r).map_err(Error::from)?;
                                    self.sender
                                        .send(Reply::ChangePassword { prompt })
                                        .map_err(|_| Error::SendError)?;
                                }
                                Some(method @ auth::Method::PublicKey { .. }) => {
                                    debug!("userauth_pk_ok");
                                    if let Some(auth::CurrentRequest::PublicKey {
                                        ref mut sent_pk_ok,
                                    }) = auth_request.current
                                    {
                                        // A second PK_OK for the same probe
                                        // makes no sense.
                                        if *sent_pk_ok {
                                            return Err(Error::Inconsistent.into());
                                        }
                                        *sent_pk_ok = true;
                                    }
                                    self.common.buffer.clear();
                                    let auth_user = self.common.auth_user.clone();
                                    enc.client_send_signature(
                                        &auth_user,
                                        &method,
                                        &mut self.common.buffer,
                                    )?;
                                }
                                Some(auth::Method::FuturePublicKey { key }) => {
                                    debug!("userauth_pk_ok, remote signer");
                                    return self.ask_remote_signature(key).await;
                                }
                                _ => return Err(Error::Inconsistent.into()),
                            },
                        }
                    } else if buf.first() == Some(&msg::EXT_INFO) {
                        return self.handle_ext_info(buf);
                    } else {
                        debug!("unexpected message: {:?}", buf.first());
                        return Err(Error::Inconsistent.into());
                    }
                }
                EncryptedState::InitCompression => {
                    // The compressor is armed by the event loop right
                    // after the auth success reply goes out.
                    return Ok(());
                }
                EncryptedState::Authenticated => is_authenticated = true,
            }
        }
        if is_authenticated {
            self.client_read_authenticated(client, buf, seqn).await
        } else {
            Ok(())
        }
    }

    fn handle_ext_info<E: From<Error>>(&mut self, buf: &[u8]) -> Result<(), E> {
        // https://tools.ietf.org/html/rfc8308#section-2.3
        let mut r = buf.get(1..).unwrap_or_default();
        let r = &mut r;
        let count = u32::decode(r).map_err(Error::from)?;
        for _ in 0..count {
            let name = String::decode(r).map_err(Error::from)?;
            let value = Vec::<u8>::decode(r).map_err(Error::from)?;
            if name == "server-sig-algs" {
                let value = String::from_utf8_lossy(&value);
                let algs: Vec<String> = value.split(',').map(|x| x.to_string()).collect();
                debug!("server-sig-algs: {algs:?}");
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.server_sig_algs = Some(algs);
                }
            }
        }
        Ok(())
    }

    /// Keyboard-interactive INFO_REQUEST: surface the prompts, wait for
    /// the consumer's responses, send them back.
    async fn read_auth_info_request<E: From<Error>>(&mut self, buf: &[u8]) -> Result<(), E> {
        let mut r = buf.get(1..).unwrap_or_default();
        let r = &mut r;
        let name = String::decode(r).map_err(Error::from)?;
        let instructions = String::decode(r).map_err(Error::from)?;
        let _lang = String::decode(r).map_err(Error::from)?;
        let n_prompts = u32::decode(r).map_err(Error::from)?;

        let mut prompts = Vec::with_capacity(n_prompts.min(64) as usize);
        for _ in 0..n_prompts {
            let prompt = String::decode(r).map_err(Error::from)?;
            let echo = u8::decode(r).map_err(Error::from)? != 0;
            prompts.push(Prompt { prompt, echo });
        }

        self.sender
            .send(Reply::AuthInfoRequest {
                name,
                instructions,
                prompts,
            })
            .map_err(|_| Error::SendError)?;

        // Wait for the consumer's responses.
        let responses = loop {
            match self.receiver.recv().await {
                Some(Msg::AuthInfoResponse { responses }) => break responses,
                None => return Err(Error::RecvError.into()),
                _ => {}
            }
        };
        if let Some(ref mut enc) = self.common.encrypted {
            enc.client_send_auth_response(&responses)?;
        }
        Ok(())
    }

    /// publickey with an external signer: hand the to-sign blob out, wait
    /// for the signature, complete the USERAUTH_REQUEST.
    async fn ask_remote_signature<E: From<Error>>(
        &mut self,
        key: ssh_key::PublicKey,
    ) -> Result<(), E> {
        let algo = key.algorithm();
        let pubkey_blob = key.to_bytes().map_err(Error::from)?;

        let mut to_sign = Vec::new();
        let i0 = match self.common.encrypted {
            Some(ref mut enc) => enc
                .client_make_to_sign(
                    &self.common.auth_user,
                    algo.as_str(),
                    &pubkey_blob,
                    &mut to_sign,
                )
                .map_err(Error::from)?,
            None => return Err(Error::Inconsistent.into()),
        };

        self.sender
            .send(Reply::SignRequest {
                key,
                data: to_sign.clone(),
            })
            .map_err(|_| Error::SendError)?;
        let signature = loop {
            match self.receiver.recv().await {
                Some(Msg::Signed { data }) => break data,
                None => return Err(Error::RecvError.into()),
                _ => {}
            }
        };
        if let Some(ref mut enc) = self.common.encrypted {
            push_one(&mut enc.write, |w| {
                w.extend_from_slice(to_sign.get(i0..).ok_or(Error::IndexOutOfBounds)?);
                signature.as_slice().encode(w)?;
                Ok(())
            })
            .map_err(Error::from)?;
        }
        Ok(())
    }

    async fn client_read_authenticated<H: Handler>(
        &mut self,
        client: &mut H,
        buf: &[u8],
        seqn: u32,
    ) -> Result<(), H::Error> {
        match buf.first() {
            Some(&msg::CHANNEL_OPEN_CONFIRMATION) => {
                debug!("channel_open_confirmation");
                let mut reader = buf.get(1..).unwrap_or_default();
                let parsed =
                    ChannelOpenConfirmation::parse(&mut reader).map_err(Error::from)?;
                let local_id = ChannelId(parsed.recipient_channel);

                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(parameters) = enc.channels.get_mut(&local_id) {
                        parameters.confirm(&parsed);
                    } else {
                        // We've not requested this channel, close the connection.
                        return Err(Error::Inconsistent.into());
                    }
                } else {
                    return Err(Error::Inconsistent.into());
                }

                self.send_channel_msg(
                    local_id,
                    ChannelMsg::Open {
                        id: local_id,
                        max_packet_size: parsed.maximum_packet_size,
                        window_size: parsed.initial_window_size,
                    },
                );
                client
                    .channel_open_confirmation(
                        local_id,
                        parsed.maximum_packet_size,
                        parsed.initial_window_size,
                        self,
                    )
                    .await
            }
            Some(&msg::CHANNEL_OPEN_FAILURE) => {
                debug!("channel_open_failure");
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let channel_num = ChannelId(u32::decode(r).map_err(Error::from)?);
                let reason_code = ChannelOpenFailure::from_u32(u32::decode(r).map_err(Error::from)?)
                    .unwrap_or(ChannelOpenFailure::Unknown);
                let description = String::decode(r).map_err(Error::from)?;
                let language = String::decode(r).map_err(Error::from)?;
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.channels.remove(&channel_num);
                }
                if let Some(sender) = self.channels.remove(&channel_num) {
                    let _ = sender.send(ChannelMsg::OpenFailure(reason_code));
                }
                let _ = self.sender.send(Reply::ChannelOpenFailure);
                client
                    .channel_open_failure(channel_num, reason_code, &description, &language, self)
                    .await
            }
            Some(&msg::CHANNEL_CLOSE) => {
                debug!("channel_close");
                let mut r = buf.get(1..).unwrap_or_default();
                let channel_num = ChannelId(u32::decode(&mut r).map_err(Error::from)?);
                if let Some(ref mut enc) = self.common.encrypted {
                    // Answer with our own CLOSE if it hasn't gone out yet;
                    // only then is the id reclaimable.
                    enc.remote_close(channel_num);
                }
                self.send_channel_msg(channel_num, ChannelMsg::Close);
                self.channels.remove(&channel_num);
                client.channel_close(channel_num, self).await
            }
            Some(&msg::CHANNEL_EOF) => {
                debug!("channel_eof");
                let mut r = buf.get(1..).unwrap_or_default();
                let channel_num = ChannelId(u32::decode(&mut r).map_err(Error::from)?);
                self.send_channel_msg(channel_num, ChannelMsg::Eof);
                client.channel_eof(channel_num, self).await
            }
            Some(&msg::CHANNEL_DATA) => {
                trace!("channel_data");
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let channel_num = ChannelId(u32::decode(r).map_err(Error::from)?);
                let data = Vec::<u8>::decode(r).map_err(Error::from)?;
                let target = self.target_window_size;
                if let Some(ref mut enc) = self.common.encrypted {
                    if !enc.channels.contains_key(&channel_num) {
                        return Err(Error::WrongChannel.into());
                    }
                    enc.adjust_window_size(channel_num, &data, target);
                }
                self.send_channel_msg(channel_num, ChannelMsg::Data { data: data.clone() });
                client.data(channel_num, &data, self).await
            }
            Some(&msg::CHANNEL_EXTENDED_DATA) => {
                trace!("channel_extended_data");
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let channel_num = ChannelId(u32::decode(r).map_err(Error::from)?);
                let extended_code = u32::decode(r).map_err(Error::from)?;
                let data = Vec::<u8>::decode(r).map_err(Error::from)?;
                let target = self.target_window_size;
                if let Some(ref mut enc) = self.common.encrypted {
                    if !enc.channels.contains_key(&channel_num) {
                        return Err(Error::WrongChannel.into());
                    }
                    enc.adjust_window_size(channel_num, &data, target);
                }
                self.send_channel_msg(
                    channel_num,
                    ChannelMsg::ExtendedData {
                        ext: extended_code,
                        data: data.clone(),
                    },
                );
                client
                    .extended_data(channel_num, extended_code, &data, self)
                    .await
            }
            Some(&msg::CHANNEL_WINDOW_ADJUST) => {
                debug!("channel_window_adjust");
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let channel_num = ChannelId(u32::decode(r).map_err(Error::from)?);
                let amount = u32::decode(r).map_err(Error::from)?;
                let mut new_size = 0;
                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(channel) = enc.channels.get_mut(&channel_num) {
                        channel.recipient_window_size =
                            channel.recipient_window_size.saturating_add(amount);
                        new_size = channel.recipient_window_size;
                    } else {
                        return Err(Error::WrongChannel.into());
                    }
                    new_size -= enc.flush_pending(channel_num) as u32;
                }
                self.send_channel_msg(channel_num, ChannelMsg::WindowAdjusted { new_size });
                client.window_adjusted(channel_num, new_size, self).await
            }
            Some(&msg::CHANNEL_REQUEST) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let channel_num = ChannelId(u32::decode(r).map_err(Error::from)?);
                let req = String::decode(r).map_err(Error::from)?;
                debug!("channel_request: {:?} {:?}", channel_num, req);
                match req.as_str() {
                    "exit-status" => {
                        let _wants_reply = u8::decode(r).map_err(Error::from)?; // always 0
                        let exit_status = u32::decode(r).map_err(Error::from)?;
                        self.send_channel_msg(channel_num, ChannelMsg::ExitStatus { exit_status });
                        client.exit_status(channel_num, exit_status, self).await
                    }
                    "exit-signal" => {
                        let _wants_reply = u8::decode(r).map_err(Error::from)?; // always 0
                        let signal_name =
                            Sig::from_name(&String::decode(r).map_err(Error::from)?);
                        let core_dumped = u8::decode(r).map_err(Error::from)? != 0;
                        let error_message = String::decode(r).map_err(Error::from)?;
                        let lang_tag = String::decode(r).map_err(Error::from)?;
                        self.send_channel_msg(
                            channel_num,
                            ChannelMsg::ExitSignal {
                                signal_name: signal_name.clone(),
                                core_dumped,
                                error_message: error_message.clone(),
                                lang_tag: lang_tag.clone(),
                            },
                        );
                        client
                            .exit_signal(
                                channel_num,
                                signal_name,
                                core_dumped,
                                &error_message,
                                &lang_tag,
                                self,
                            )
                            .await
                    }
                    "xon-xoff" => {
                        u8::decode(r).map_err(Error::from)?; // should be 0.
                        let client_can_do = u8::decode(r).map_err(Error::from)? != 0;
                        self.send_channel_msg(channel_num, ChannelMsg::XonXoff { client_can_do });
                        Ok(())
                    }
                    "keepalive@openssh.com" => {
                        let wants_reply = u8::decode(r).map_err(Error::from)?;
                        if wants_reply == 1 {
                            if let Some(ref mut enc) = self.common.encrypted {
                                enc.byte(channel_num, msg::CHANNEL_SUCCESS);
                            }
                        } else {
                            warn!("received keepalive without reply request");
                        }
                        Ok(())
                    }
                    _ => {
                        let wants_reply = u8::decode(r).map_err(Error::from)?;
                        info!("unknown channel request {:?} {:?}", req, wants_reply);
                        if wants_reply == 1 {
                            if let Some(ref mut enc) = self.common.encrypted {
                                enc.byte(channel_num, msg::CHANNEL_FAILURE);
                            }
                        }
                        Ok(())
                    }
                }
            }
            Some(&msg::CHANNEL_SUCCESS) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let channel_num = ChannelId(u32::decode(&mut r).map_err(Error::from)?);
                self.send_channel_msg(channel_num, ChannelMsg::Success);
                client.channel_success(channel_num, self).await
            }
            Some(&msg::CHANNEL_FAILURE) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let channel_num = ChannelId(u32::decode(&mut r).map_err(Error::from)?);
                self.send_channel_msg(channel_num, ChannelMsg::Failure);
                client.channel_failure(channel_num, self).await
            }
            Some(&msg::CHANNEL_OPEN) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let open = OpenChannelMessage::parse(&mut r).map_err(Error::from)?;
                self.server_initiated_channel_open(client, open).await
            }
            Some(&msg::GLOBAL_REQUEST) => {
                let mut r = buf.get(1..).unwrap_or_default();
                let r = &mut r;
                let req = String::decode(r).map_err(Error::from)?;
                let wants_reply = u8::decode(r).map_err(Error::from)?;
                debug!("global_request: {:?} {:?}", req, wants_reply);
                if let Some(ref mut enc) = self.common.encrypted {
                    if wants_reply == 1 {
                        // We implement no server-initiated global requests.
                        push_one(&mut enc.write, |w| {
                            msg::REQUEST_FAILURE.encode(w)?;
                            Ok(())
                        })
                        .map_err(Error::from)?;
                    }
                }
                Ok(())
            }
            Some(&msg::REQUEST_SUCCESS) => {
                trace!("global request success");
                match self.open_global_requests.pop_front() {
                    Some(GlobalRequestResponse::Keepalive) => {}
                    Some(GlobalRequestResponse::Ping(return_channel)) => {
                        let _ = return_channel.send(());
                    }
                    Some(GlobalRequestResponse::TcpIpForward(return_channel)) => {
                        let result = if buf.len() == 1 {
                            // A specific port was requested, the reply has no data.
                            Some(0)
                        } else {
                            let mut r = buf.get(1..).unwrap_or_default();
                            u32::decode(&mut r).ok()
                        };
                        let _ = return_channel.send(result);
                    }
                    Some(GlobalRequestResponse::CancelTcpIpForward(return_channel)) => {
                        let _ = return_channel.send(true);
                    }
                    None => {
                        error!("received global request response with no request pending");
                    }
                }
                Ok(())
            }
            Some(&msg::REQUEST_FAILURE) => {
                trace!("global request failure");
                match self.open_global_requests.pop_front() {
                    Some(GlobalRequestResponse::Keepalive) => {}
                    Some(GlobalRequestResponse::Ping(return_channel)) => {
                        let _ = return_channel.send(());
                    }
                    Some(GlobalRequestResponse::TcpIpForward(return_channel)) => {
                        let _ = return_channel.send(None);
                    }
                    Some(GlobalRequestResponse::CancelTcpIpForward(return_channel)) => {
                        let _ = return_channel.send(false);
                    }
                    None => {
                        error!("received global request response with no request pending");
                    }
                }
                Ok(())
            }
            Some(&msg::EXT_INFO) => self.handle_ext_info(buf),
            m => {
                debug!("unknown message received: {:?}", m);
                // https://tools.ietf.org/html/rfc4253#section-11.4
                if let Some(ref mut enc) = self.common.encrypted {
                    push_one(&mut enc.write, |w| {
                        msg::UNIMPLEMENTED.encode(w)?;
                        seqn.encode(w)?;
                        Ok(())
                    })
                    .map_err(Error::from)?;
                }
                Ok(())
            }
        }
    }

    async fn server_initiated_channel_open<H: Handler>(
        &mut self,
        client: &mut H,
        open: OpenChannelMessage,
    ) -> Result<(), H::Error> {
        let Some(ref mut enc) = self.common.encrypted else {
            return Err(Error::Inconsistent.into());
        };
        match &open.typ {
            ChannelType::ForwardedTcpIp(info) => {
                let id = enc.new_channel_id();
                let window_size = self.common.config.window_size;
                let maximum_packet_size = self.common.config.maximum_packet_size;
                enc.channels.insert(
                    id,
                    ChannelParams {
                        recipient_channel: open.recipient_channel,
                        sender_channel: id,
                        recipient_window_size: open.recipient_window_size,
                        sender_window_size: window_size,
                        recipient_maximum_packet_size: open.recipient_maximum_packet_size,
                        sender_maximum_packet_size: maximum_packet_size,
                        confirmed: true,
                        pending_data: Default::default(),
                        pending_eof: false,
                        pending_close: false,
                        local_close: false,
                        remote_close: false,
                    },
                );
                open.confirm(&mut enc.write, id.0, window_size, maximum_packet_size)
                    .map_err(Error::from)?;
                let channel = self.accept_server_initiated_channel(id, &open);
                client
                    .server_channel_open_forwarded_tcpip(
                        channel,
                        &info.host_to_connect,
                        info.port_to_connect,
                        &info.originator_address,
                        info.originator_port,
                        self,
                    )
                    .await
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                let id = enc.new_channel_id();
                let window_size = self.common.config.window_size;
                let maximum_packet_size = self.common.config.maximum_packet_size;
                enc.channels.insert(
                    id,
                    ChannelParams {
                        recipient_channel: open.recipient_channel,
                        sender_channel: id,
                        recipient_window_size: open.recipient_window_size,
                        sender_window_size: window_size,
                        recipient_maximum_packet_size: open.recipient_maximum_packet_size,
                        sender_maximum_packet_size: maximum_packet_size,
                        confirmed: true,
                        pending_data: Default::default(),
                        pending_eof: false,
                        pending_close: false,
                        local_close: false,
                        remote_close: false,
                    },
                );
                open.confirm(&mut enc.write, id.0, window_size, maximum_packet_size)
                    .map_err(Error::from)?;
                let address = originator_address.clone();
                let port = *originator_port;
                let channel = self.accept_server_initiated_channel(id, &open);
                client
                    .server_channel_open_x11(channel, &address, port, self)
                    .await
            }
            ChannelType::Session | ChannelType::Unknown { .. } => {
                debug!("refusing channel open: {:?}", open.typ);
                open.unknown_type(&mut enc.write).map_err(Error::from)?;
                Ok(())
            }
        }
    }

    fn accept_server_initiated_channel(
        &mut self,
        id: ChannelId,
        msg: &OpenChannelMessage,
    ) -> Channel<Msg> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.channels.insert(id, tx);
        Channel {
            id,
            sender: self.inbound_channel_sender.clone(),
            receiver: rx,
            max_packet_size: msg.recipient_maximum_packet_size,
            window_size: msg.recipient_window_size,
        }
    }

    /// Entry point for `Msg::Authenticate`: if the userauth service
    /// hasn't been requested yet, do that first; the request itself goes
    /// out once SERVICE_ACCEPT comes back.
    pub(crate) fn write_auth_request_if_needed(
        &mut self,
        user: &str,
        mut meth: auth::Method,
    ) -> Result<bool, Error> {
        let mut is_waiting = false;
        if let Some(ref mut enc) = self.common.encrypted {
            // RSA keys sign with the hash negotiated via server-sig-algs.
            if let auth::Method::PublicKey { ref mut key } = meth {
                if matches!(key.algorithm(), ssh_key::Algorithm::Rsa { .. })
                    && key.hash_alg().is_none()
                {
                    key.set_hash_alg(best_rsa_hash(enc.server_sig_algs.as_deref()));
                }
            }
            is_waiting = match enc.state {
                EncryptedState::WaitingAuthRequest(_) => true,
                EncryptedState::WaitingAuthServiceRequest {
                    accepted,
                    ref mut sent,
                } => {
                    debug!("requesting the ssh-userauth service");
                    if !*sent {
                        push_one(&mut enc.write, |w| {
                            msg::SERVICE_REQUEST.encode(w)?;
                            "ssh-userauth".encode(w)?;
                            Ok(())
                        })?;
                        *sent = true
                    }
                    accepted
                }
                EncryptedState::InitCompression | EncryptedState::Authenticated => false,
            };
            if is_waiting {
                let auth_request = auth::AuthRequest {
                    methods: auth::MethodSet::all(),
                    partial_success: false,
                    current: match &meth {
                        auth::Method::KeyboardInteractive { submethods } => {
                            Some(auth::CurrentRequest::KeyboardInteractive {
                                submethods: submethods.clone(),
                            })
                        }
                        auth::Method::PublicKey { .. } | auth::Method::FuturePublicKey { .. } => {
                            Some(auth::CurrentRequest::PublicKey { sent_pk_ok: false })
                        }
                        _ => None,
                    },
                };
                enc.write_auth_request(user, &meth)?;
                enc.state = EncryptedState::WaitingAuthRequest(auth_request);
            }
        }
        self.common.auth_user.clear();
        self.common.auth_user.push_str(user);
        self.common.auth_method = Some(meth);
        Ok(is_waiting)
    }
}

impl Encrypted {
    /// Returns true if a request was actually written.
    fn write_auth_request(
        &mut self,
        user: &str,
        auth_method: &auth::Method,
    ) -> Result<bool, Error> {
        push_one(&mut self.write, |w| {
            msg::USERAUTH_REQUEST.encode(w)?;
            match *auth_method {
                auth::Method::None => {
                    user.encode(w)?;
                    "ssh-connection".encode(w)?;
                    "none".encode(w)?;
                }
                auth::Method::Password { ref password } => {
                    user.encode(w)?;
                    "ssh-connection".encode(w)?;
                    "password".encode(w)?;
                    0u8.encode(w)?;
                    password.encode(w)?;
                }
                auth::Method::PublicKey { ref key } => {
                    user.encode(w)?;
                    "ssh-connection".encode(w)?;
                    "publickey".encode(w)?;
                    0u8.encode(w)?; // This is a probe.
                    key.algorithm().as_str().encode(w)?;
                    key.public_key().to_bytes()?.encode(w)?;
                }
                auth::Method::FuturePublicKey { ref key } => {
                    user.encode(w)?;
                    "ssh-connection".encode(w)?;
                    "publickey".encode(w)?;
                    0u8.encode(w)?; // This is a probe.
                    key.algorithm().as_str().encode(w)?;
                    key.to_bytes()?.encode(w)?;
                }
                auth::Method::KeyboardInteractive { ref submethods } => {
                    user.encode(w)?;
                    "ssh-connection".encode(w)?;
                    "keyboard-interactive".encode(w)?;
                    "".encode(w)?; // lang tag is deprecated, must be empty
                    submethods.encode(w)?;
                }
            }
            Ok(())
        })?;
        Ok(true)
    }

    /// The blob that gets signed for publickey auth:
    /// `string(session_id)` followed by the USERAUTH_REQUEST body with
    /// `has_sig = true`. Returns the offset where the request itself
    /// starts.
    fn client_make_to_sign(
        &mut self,
        user: &str,
        algo_name: &str,
        pubkey_blob: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        buffer.clear();
        self.session_id.as_slice().encode(buffer)?;

        let i0 = buffer.len();
        msg::USERAUTH_REQUEST.encode(buffer)?;
        user.encode(buffer)?;
        "ssh-connection".encode(buffer)?;
        "publickey".encode(buffer)?;
        1u8.encode(buffer)?;
        algo_name.encode(buffer)?;
        pubkey_blob.encode(buffer)?;
        Ok(i0)
    }

    fn client_send_signature(
        &mut self,
        user: &str,
        method: &auth::Method,
        buffer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if let auth::Method::PublicKey { ref key } = method {
            let algo = key.algorithm();
            let pubkey_blob = key.public_key().to_bytes()?;
            let i0 = self.client_make_to_sign(user, algo.as_str(), &pubkey_blob, buffer)?;

            let signature = key.sign(buffer)?;
            let mut sig_bytes = Vec::new();
            signature.encode(&mut sig_bytes)?;

            let request = buffer.get(i0..).ok_or(Error::IndexOutOfBounds)?;
            push_one(&mut self.write, |w| {
                w.extend_from_slice(request);
                sig_bytes.as_slice().encode(w)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn client_send_auth_response(&mut self, responses: &[String]) -> Result<(), Error> {
        push_one(&mut self.write, |w| {
            msg::USERAUTH_INFO_RESPONSE.encode(w)?;
            (responses.len() as u32).encode(w)?;
            for r in responses {
                r.encode(w)?;
            }
            Ok(())
        })
    }
}

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

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::num::Wrapping;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use ssh_encoding::Encode;
use tokio::sync::oneshot;

use crate::cipher::SealingKey;
use crate::client::GexParams;
use crate::kex::dh::groups::DhGroup;
use crate::kex::KexAlgorithm;
use crate::sshbuffer::SSHBuffer;
use crate::{auth, cipher, msg, negotiation, ChannelId, Disconnect, Error, Limits};

/// Everything a kex round hashes: both version strings, both KEXINIT
/// payloads, both ephemerals, and the group-exchange parameters if any.
#[derive(Debug, Default, Clone)]
pub(crate) struct Exchange {
    pub client_id: Vec<u8>,
    pub server_id: Vec<u8>,
    pub client_kex_init: Vec<u8>,
    pub server_kex_init: Vec<u8>,
    pub client_ephemeral: Vec<u8>,
    pub server_ephemeral: Vec<u8>,
    pub gex: Option<(GexParams, DhGroup)>,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        Exchange {
            client_id: client_id.to_vec(),
            server_id: server_id.to_vec(),
            ..Default::default()
        }
    }
}

/// Progress of one key exchange, initial or rekey.
#[derive(Debug)]
pub(crate) enum Kex {
    /// KEXINIT sent; `algo` is set once the server's arrived.
    Init(KexInit),

    /// Group exchange only: DH_GEX_REQUEST sent, waiting for the group.
    GexGroup(KexDhDone),

    /// Our DH init is out, waiting for the server's reply.
    DhDone(KexDhDone),

    /// NEWKEYS sent, waiting for the server's NEWKEYS.
    Keys(NewKeys),
}

#[derive(Debug)]
pub(crate) struct KexInit {
    pub exchange: Exchange,
    pub algo: Option<negotiation::Names>,
    pub session_id: Option<Vec<u8>>,
    pub sent: bool,
}

impl KexInit {
    pub fn received_rekey(ex: Exchange, algo: negotiation::Names, session_id: &[u8]) -> Self {
        let mut kexinit = KexInit {
            exchange: ex,
            algo: Some(algo),
            sent: false,
            session_id: Some(session_id.to_vec()),
        };
        kexinit.clear_exchange();
        kexinit
    }

    pub fn initiate_rekey(ex: Exchange, session_id: &[u8]) -> Self {
        let mut kexinit = KexInit {
            exchange: ex,
            algo: None,
            sent: true,
            session_id: Some(session_id.to_vec()),
        };
        kexinit.clear_exchange();
        kexinit
    }

    fn clear_exchange(&mut self) {
        self.exchange.client_kex_init.clear();
        self.exchange.server_kex_init.clear();
        self.exchange.client_ephemeral.clear();
        self.exchange.server_ephemeral.clear();
        self.exchange.gex = None;
    }
}

pub(crate) struct KexDhDone {
    pub exchange: Exchange,
    pub kex: Box<dyn KexAlgorithm + Send>,
    pub session_id: Option<Vec<u8>>,
    pub names: negotiation::Names,
}

impl Debug for KexDhDone {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KexDhDone")
    }
}

impl KexDhDone {
    pub fn compute_keys(self, hash: Vec<u8>) -> Result<NewKeys, Error> {
        let session_id = if let Some(session_id) = self.session_id {
            session_id
        } else {
            hash.clone()
        };
        // Now computing keys.
        let c = self.kex.compute_keys(
            &session_id,
            &hash,
            self.names.client_cipher,
            self.names.server_cipher,
            self.names.server_mac,
            self.names.client_mac,
        )?;
        Ok(NewKeys {
            exchange: self.exchange,
            names: self.names,
            cipher: c,
            session_id,
        })
    }
}

pub(crate) struct NewKeys {
    pub exchange: Exchange,
    pub names: negotiation::Names,
    pub cipher: cipher::CipherPair,
    pub session_id: Vec<u8>,
}

impl Debug for NewKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NewKeys")
    }
}

/// One multiplexed channel as the session tracks it. `sender_*` is our
/// side (the local window we advertise), `recipient_*` the peer's.
#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    pub recipient_window_size: u32,
    pub sender_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub confirmed: bool,
    /// (buffer, extended stream #, data offset in buffer)
    pub pending_data: VecDeque<(Vec<u8>, Option<u32>, usize)>,
    pub pending_eof: bool,
    pub pending_close: bool,
    pub local_close: bool,
    pub remote_close: bool,
}

impl ChannelParams {
    pub fn confirm(&mut self, c: &crate::parsing::ChannelOpenConfirmation) {
        trace!("channel {} confirmed", self.sender_channel);
        self.recipient_channel = c.sender_channel; // "sender" is the sender of the confirmation
        self.recipient_window_size = c.initial_window_size;
        self.recipient_maximum_packet_size = c.maximum_packet_size;
        self.confirmed = true;
    }
}

#[derive(Debug)]
pub(crate) enum EncryptedState {
    WaitingAuthServiceRequest { sent: bool, accepted: bool },
    WaitingAuthRequest(auth::AuthRequest),
    InitCompression,
    Authenticated,
}

/// Session state that only exists after the first NEWKEYS.
pub(crate) struct Encrypted {
    pub state: EncryptedState,

    // It's always Some, except when a rekey takes it temporarily.
    pub exchange: Option<Exchange>,
    pub session_id: Vec<u8>,
    pub rekey: Option<Kex>,
    pub channels: HashMap<ChannelId, ChannelParams>,
    pub last_channel_id: Wrapping<u32>,
    pub write: Vec<u8>,
    pub write_cursor: usize,
    pub last_rekey: std::time::Instant,
    pub server_compression: crate::compression::Compression,
    pub client_compression: crate::compression::Compression,
    pub compress: crate::compression::Compress,
    pub decompress: crate::compression::Decompress,
    pub compress_buffer: Vec<u8>,
    pub server_sig_algs: Option<Vec<String>>,
}

impl Debug for Encrypted {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encrypted")
            .field("state", &self.state)
            .field("channels", &self.channels.keys())
            .finish()
    }
}

pub(crate) struct CommonSession<Config> {
    pub auth_user: String,
    pub remote_sshid: Vec<u8>,
    pub config: Config,
    pub encrypted: Option<Encrypted>,
    pub auth_method: Option<auth::Method>,
    pub write_buffer: SSHBuffer,
    pub kex: Option<Kex>,
    pub cipher: cipher::CipherPair,
    pub disconnected: bool,
    pub buffer: Vec<u8>,
    pub alive_timeouts: usize,
}

impl<C> CommonSession<C> {
    /// Install fresh keys at the NEWKEYS boundary of a rekey.
    pub fn newkeys(&mut self, newkeys: NewKeys) {
        if let Some(ref mut enc) = self.encrypted {
            enc.exchange = Some(newkeys.exchange);
            self.cipher = newkeys.cipher;
        }
    }

    /// Install the very first keys and enter the encrypted state.
    pub fn encrypted(&mut self, state: EncryptedState, newkeys: NewKeys) {
        self.encrypted = Some(Encrypted {
            exchange: Some(newkeys.exchange),
            session_id: newkeys.session_id,
            state,
            rekey: None,
            channels: HashMap::new(),
            last_channel_id: Wrapping(1),
            write: Vec::new(),
            write_cursor: 0,
            last_rekey: std::time::Instant::now(),
            server_compression: newkeys.names.server_compression,
            client_compression: newkeys.names.client_compression,
            compress: crate::compression::Compress::None,
            compress_buffer: Vec::new(),
            decompress: crate::compression::Decompress::None,
            server_sig_algs: None,
        });
        self.cipher = newkeys.cipher;
    }

    /// Send a disconnect message.
    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        let disconnect = |buf: &mut Vec<u8>| -> Result<(), Error> {
            push_packet!(buf, {
                msg::DISCONNECT.encode(buf)?;
                (reason as u32).encode(buf)?;
                description.encode(buf)?;
                language_tag.encode(buf)?;
            });
            Ok(())
        };
        if !self.disconnected {
            self.disconnected = true;
            let res = if let Some(ref mut enc) = self.encrypted {
                disconnect(&mut enc.write)
            } else {
                disconnect(&mut self.write_buffer.buffer)
            };
            if res.is_err() {
                debug!("failed to encode disconnect message");
            }
        }
    }

    /// Send a single-u32 channel message.
    pub fn byte(&mut self, channel: ChannelId, msg: u8) {
        if let Some(ref mut enc) = self.encrypted {
            enc.byte(channel, msg)
        }
    }
}

impl Encrypted {
    pub fn byte(&mut self, channel: ChannelId, msg: u8) {
        if let Some(channel) = self.channels.get(&channel) {
            let _ = push_one(&mut self.write, |w| {
                msg.encode(w)?;
                channel.recipient_channel.encode(w)?;
                Ok(())
            });
        }
    }

    pub fn eof(&mut self, channel: ChannelId) {
        if let Some(channel) = self.has_pending_data_mut(channel) {
            channel.pending_eof = true;
        } else {
            self.byte(channel, msg::CHANNEL_EOF);
        }
    }

    /// Close from our side. The id stays in the table until the peer's
    /// CLOSE has also been seen.
    pub fn close(&mut self, channel: ChannelId) {
        if let Some(c) = self.has_pending_data_mut(channel) {
            c.pending_close = true;
            return;
        }
        let (send, remove) = match self.channels.get_mut(&channel) {
            Some(c) => {
                let send = !c.local_close;
                c.local_close = true;
                (send, c.remote_close)
            }
            None => (false, false),
        };
        if send {
            self.byte(channel, msg::CHANNEL_CLOSE);
        }
        if remove {
            self.channels.remove(&channel);
        }
    }

    /// The peer closed; answer with our CLOSE if still outstanding, then
    /// reclaim the id.
    pub fn remote_close(&mut self, channel: ChannelId) {
        let send = match self.channels.get_mut(&channel) {
            Some(c) => {
                c.remote_close = true;
                !c.local_close
            }
            None => false,
        };
        if send {
            if let Some(c) = self.channels.get_mut(&channel) {
                c.local_close = true;
            }
            self.byte(channel, msg::CHANNEL_CLOSE);
        }
        self.channels.remove(&channel);
    }

    pub fn sender_window_size(&self, channel: ChannelId) -> usize {
        if let Some(channel) = self.channels.get(&channel) {
            channel.sender_window_size as usize
        } else {
            0
        }
    }

    /// Account for received data against our window, and refill with a
    /// WINDOW_ADJUST once it has dropped below half the target.
    pub fn adjust_window_size(&mut self, channel: ChannelId, data: &[u8], target: u32) -> bool {
        if let Some(channel) = self.channels.get_mut(&channel) {
            // Ignore extra data.
            // https://tools.ietf.org/html/rfc4254#section-5.2
            if data.len() as u32 <= channel.sender_window_size {
                channel.sender_window_size -= data.len() as u32;
            }
            if channel.sender_window_size < target / 2 {
                trace!(
                    "sender_window_size {:?}, target {:?}",
                    channel.sender_window_size,
                    target
                );
                let increment = target - channel.sender_window_size;
                let recipient_channel = channel.recipient_channel;
                channel.sender_window_size = target;
                let _ = push_one(&mut self.write, |w| {
                    msg::CHANNEL_WINDOW_ADJUST.encode(w)?;
                    recipient_channel.encode(w)?;
                    increment.encode(w)?;
                    Ok(())
                });
                return true;
            }
        }
        false
    }

    fn flush_channel(write: &mut Vec<u8>, channel: &mut ChannelParams) -> ChannelFlushResult {
        let mut pending_size = 0;
        while let Some((buf, a, from)) = channel.pending_data.pop_front() {
            let size = Self::data_noqueue(write, channel, &buf, a, from);
            pending_size += size;
            if from + size < buf.len() {
                channel.pending_data.push_front((buf, a, from + size));
                return ChannelFlushResult::Incomplete {
                    wrote: pending_size,
                };
            }
        }
        ChannelFlushResult::complete(pending_size, channel)
    }

    fn handle_flushed_channel(&mut self, channel: ChannelId, flush_result: ChannelFlushResult) {
        if let ChannelFlushResult::Complete {
            wrote: _,
            pending_eof,
            pending_close,
        } = flush_result
        {
            if pending_eof {
                if let Some(c) = self.channels.get_mut(&channel) {
                    c.pending_eof = false;
                }
                self.byte(channel, msg::CHANNEL_EOF);
            }
            if pending_close {
                if let Some(c) = self.channels.get_mut(&channel) {
                    c.pending_close = false;
                }
                self.close(channel);
            }
        }
    }

    /// Flush what the peer's window now allows; returns the number of
    /// payload bytes written.
    pub fn flush_pending(&mut self, channel: ChannelId) -> usize {
        let mut pending_size = 0;
        let mut maybe_flush_result = Option::<ChannelFlushResult>::None;

        if let Some(channel) = self.channels.get_mut(&channel) {
            let flush_result = Self::flush_channel(&mut self.write, channel);
            pending_size += flush_result.wrote();
            maybe_flush_result = Some(flush_result);
        }
        if let Some(flush_result) = maybe_flush_result {
            self.handle_flushed_channel(channel, flush_result)
        }
        pending_size
    }

    pub fn flush_all_pending(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.flush_pending(id);
        }
    }

    fn has_pending_data_mut(&mut self, channel: ChannelId) -> Option<&mut ChannelParams> {
        self.channels
            .get_mut(&channel)
            .filter(|c| !c.pending_data.is_empty())
    }

    pub fn has_pending_data(&self, channel: ChannelId) -> bool {
        if let Some(channel) = self.channels.get(&channel) {
            !channel.pending_data.is_empty()
        } else {
            false
        }
    }

    /// Push the largest prefix of `&buf0[from..]` that fits the peer's
    /// window, dividing it into packets of at most its maximum packet
    /// size, and return the length written.
    fn data_noqueue(
        write: &mut Vec<u8>,
        channel: &mut ChannelParams,
        buf0: &[u8],
        a: Option<u32>,
        from: usize,
    ) -> usize {
        if from >= buf0.len() {
            return 0;
        }
        let window = channel.recipient_window_size as usize;
        let end = buf0.len().min(from + window);
        let mut buf = buf0.get(from..end).unwrap_or_default();
        let buf_len = buf.len();

        while !buf.is_empty() {
            // Compute the length we're allowed to send.
            let off = std::cmp::min(buf.len(), channel.recipient_maximum_packet_size as usize);
            let chunk = buf.get(..off).unwrap_or_default();
            let res = push_one(write, |w| {
                match a {
                    None => {
                        msg::CHANNEL_DATA.encode(w)?;
                        channel.recipient_channel.encode(w)?;
                        chunk.encode(w)?;
                    }
                    Some(ext) => {
                        msg::CHANNEL_EXTENDED_DATA.encode(w)?;
                        channel.recipient_channel.encode(w)?;
                        ext.encode(w)?;
                        chunk.encode(w)?;
                    }
                }
                Ok(())
            });
            if res.is_err() {
                break;
            }
            channel.recipient_window_size -= off as u32;
            buf = buf.get(off..).unwrap_or_default();
        }
        trace!("data_noqueue wrote {buf_len:?} bytes");
        buf_len
    }

    pub fn data(&mut self, channel: ChannelId, buf0: Vec<u8>) {
        if let Some(channel) = self.channels.get_mut(&channel) {
            debug_assert!(channel.confirmed);
            if !channel.pending_data.is_empty() || self.rekey.is_some() {
                channel.pending_data.push_back((buf0, None, 0));
                return;
            }
            let buf_len = Self::data_noqueue(&mut self.write, channel, &buf0, None, 0);
            if buf_len < buf0.len() {
                channel.pending_data.push_back((buf0, None, buf_len))
            }
        } else {
            debug!("{:?} not saved for this session", channel);
        }
    }

    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, buf0: Vec<u8>) {
        if let Some(channel) = self.channels.get_mut(&channel) {
            debug_assert!(channel.confirmed);
            if !channel.pending_data.is_empty() || self.rekey.is_some() {
                channel.pending_data.push_back((buf0, Some(ext), 0));
                return;
            }
            let buf_len = Self::data_noqueue(&mut self.write, channel, &buf0, Some(ext), 0);
            if buf_len < buf0.len() {
                channel.pending_data.push_back((buf0, Some(ext), buf_len))
            }
        }
    }

    /// Encrypt and stage everything in the cleartext write queue, then
    /// report whether a rekey is due.
    pub fn flush(
        &mut self,
        limits: &Limits,
        cipher: &mut dyn SealingKey,
        write_buffer: &mut SSHBuffer,
    ) -> Result<bool, Error> {
        while self.write_cursor < self.write.len() {
            // Read a single packet, encrypt and send it.
            let len = BigEndian::read_u32(
                self.write
                    .get(self.write_cursor..)
                    .ok_or(Error::IndexOutOfBounds)?,
            ) as usize;
            let to_write = self
                .write
                .get((self.write_cursor + 4)..(self.write_cursor + 4 + len))
                .ok_or(Error::IndexOutOfBounds)?;
            let packet = self.compress.compress(to_write, &mut self.compress_buffer)?;
            cipher.write(packet, write_buffer);
            self.write_cursor += 4 + len
        }
        if self.write_cursor >= self.write.len() {
            // If all packets have been written, clear.
            self.write_cursor = 0;
            self.write.clear();
        }

        let now = std::time::Instant::now();
        let dur = now.duration_since(self.last_rekey);
        Ok(write_buffer.bytes >= limits.rekey_write_limit
            || write_buffer.packets >= limits.rekey_packet_limit
            || dur >= limits.rekey_time_limit)
    }

    pub fn new_channel_id(&mut self) -> ChannelId {
        self.last_channel_id += Wrapping(1);
        while self
            .channels
            .contains_key(&ChannelId(self.last_channel_id.0))
        {
            self.last_channel_id += Wrapping(1)
        }
        ChannelId(self.last_channel_id.0)
    }

    pub fn new_channel(&mut self, window_size: u32, maxpacket: u32) -> ChannelId {
        loop {
            self.last_channel_id += Wrapping(1);
            if let std::collections::hash_map::Entry::Vacant(vacant_entry) =
                self.channels.entry(ChannelId(self.last_channel_id.0))
            {
                vacant_entry.insert(ChannelParams {
                    recipient_channel: 0,
                    sender_channel: ChannelId(self.last_channel_id.0),
                    sender_window_size: window_size,
                    recipient_window_size: 0,
                    sender_maximum_packet_size: maxpacket,
                    recipient_maximum_packet_size: 0,
                    confirmed: false,
                    pending_data: VecDeque::new(),
                    pending_eof: false,
                    pending_close: false,
                    local_close: false,
                    remote_close: false,
                });
                return ChannelId(self.last_channel_id.0);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ChannelFlushResult {
    Incomplete {
        wrote: usize,
    },
    Complete {
        wrote: usize,
        pending_eof: bool,
        pending_close: bool,
    },
}

impl ChannelFlushResult {
    pub(crate) fn wrote(&self) -> usize {
        match self {
            ChannelFlushResult::Incomplete { wrote } => *wrote,
            ChannelFlushResult::Complete { wrote, .. } => *wrote,
        }
    }
    pub(crate) fn complete(wrote: usize, channel: &ChannelParams) -> Self {
        ChannelFlushResult::Complete {
            wrote,
            pending_eof: channel.pending_eof,
            pending_close: channel.pending_close,
        }
    }
}

/// Frame one packet-to-be into the cleartext queue.
pub(crate) fn push_one<F>(write: &mut Vec<u8>, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
{
    push_packet!(write, f(write)?);
    Ok(())
}

/// Replies we are waiting for on GLOBAL_REQUESTs with want_reply, matched
/// in FIFO order.
pub(crate) enum GlobalRequestResponse {
    /// Request was a keepalive, ignore the result.
    Keepalive,
    /// Request was a ping, the reply just completes it.
    Ping(oneshot::Sender<()>),
    /// tcpip-forward: Some(port) on success, None on failure.
    TcpIpForward(oneshot::Sender<Option<u32>>),
    /// cancel-tcpip-forward: true on success.
    CancelTcpIpForward(oneshot::Sender<bool>),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;

    fn test_channel(window: u32, maxpacket: u32) -> ChannelParams {
        ChannelParams {
            recipient_channel: 7,
            sender_channel: ChannelId(1),
            recipient_window_size: window,
            sender_window_size: 2 * 1024 * 1024,
            recipient_maximum_packet_size: maxpacket,
            sender_maximum_packet_size: 32768,
            confirmed: true,
            pending_data: VecDeque::new(),
            pending_eof: false,
            pending_close: false,
            local_close: false,
            remote_close: false,
        }
    }

    /// Split the cleartext queue back into `(msg, payload_len)` pairs.
    fn parse_data_packets(write: &[u8]) -> Vec<(u8, usize)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < write.len() {
            let len = BigEndian::read_u32(&write[i..]) as usize;
            let packet = &write[i + 4..i + 4 + len];
            // CHANNEL_DATA: msg(1) | channel(4) | string payload
            let payload_len = BigEndian::read_u32(&packet[5..]) as usize;
            out.push((packet[0], payload_len));
            i += 4 + len;
        }
        out
    }

    #[test]
    fn window_bounds_data_emission() {
        // initial window 1024, max packet 256; a 2000-byte write emits
        // four 256-byte packets and queues the rest.
        let mut ch = test_channel(1024, 256);
        let mut write = Vec::new();
        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();

        let sent = Encrypted::data_noqueue(&mut write, &mut ch, &data, None, 0);
        assert_eq!(sent, 1024);
        assert_eq!(ch.recipient_window_size, 0);
        let packets = parse_data_packets(&write);
        assert_eq!(
            packets,
            vec![
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 256)
            ]
        );

        // WINDOW_ADJUST(+2048): the remaining 976 bytes flush as
        // 256+256+256+208.
        ch.pending_data.push_back((data.clone(), None, sent));
        ch.recipient_window_size += 2048;
        write.clear();
        let flushed = Encrypted::flush_channel(&mut write, &mut ch);
        assert_eq!(flushed.wrote(), 976);
        assert!(ch.pending_data.is_empty());
        let packets = parse_data_packets(&write);
        assert_eq!(
            packets,
            vec![
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 256),
                (msg::CHANNEL_DATA, 208)
            ]
        );
        assert_eq!(ch.recipient_window_size, 2048 - 976);
        // Total delivered equals what the caller wrote.
        assert_eq!(sent + flushed.wrote(), data.len());
    }

    #[test]
    fn zero_window_queues_everything() {
        let mut ch = test_channel(0, 256);
        let mut write = Vec::new();
        let sent = Encrypted::data_noqueue(&mut write, &mut ch, b"hello", None, 0);
        assert_eq!(sent, 0);
        assert!(write.is_empty());
    }
}

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

//!
//! This module exports cipher names for use with [Preferred], and owns the
//! binary packet protocol framing: `SealingKey::write` produces one wire
//! packet from a payload, [`read`] consumes one from the socket.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::marker::PhantomData;
use std::num::Wrapping;
use std::sync::LazyLock;

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use byteorder::{BigEndian, ByteOrder};
use ctr::Ctr128BE;
use delegate::delegate;
use log::trace;
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::mac::MacAlgorithm;
use crate::sshbuffer::SSHBuffer;
use crate::Error;

pub(crate) mod block;
pub(crate) mod cbc;
pub(crate) mod chacha20poly1305;
pub(crate) mod clear;
pub(crate) mod gcm;

use block::{CtrWrapper, SshBlockCipher};
use cbc::CbcWrapper;
use chacha20poly1305::OpenSshChacha20Poly1305;
use clear::Clear;
use gcm::GcmCipher;

pub(crate) trait Cipher {
    fn needs_mac(&self) -> bool {
        false
    }
    fn key_len(&self) -> usize;
    fn nonce_len(&self) -> usize {
        0
    }
    fn make_opening_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn OpeningKey + Send>, Error>;
    fn make_sealing_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn SealingKey + Send>, Error>;
}

/// `clear`
pub const CLEAR: Name = Name("clear");
/// `none`
pub const NONE: Name = Name("none");
/// `aes128-ctr`
pub const AES_128_CTR: Name = Name("aes128-ctr");
/// `aes192-ctr`
pub const AES_192_CTR: Name = Name("aes192-ctr");
/// `aes256-ctr`
pub const AES_256_CTR: Name = Name("aes256-ctr");
/// `aes128-cbc`
pub const AES_128_CBC: Name = Name("aes128-cbc");
/// `aes256-cbc`
pub const AES_256_CBC: Name = Name("aes256-cbc");
/// `aes128-gcm@openssh.com`
pub const AES_128_GCM: Name = Name("aes128-gcm@openssh.com");
/// `aes256-gcm@openssh.com`
pub const AES_256_GCM: Name = Name("aes256-gcm@openssh.com");
/// `chacha20-poly1305@openssh.com`
pub const CHACHA20_POLY1305: Name = Name("chacha20-poly1305@openssh.com");

pub(crate) static _CLEAR: Clear = Clear {};
static _AES_128_CTR: SshBlockCipher<CtrWrapper<Ctr128BE<Aes128>>> = SshBlockCipher(PhantomData);
static _AES_192_CTR: SshBlockCipher<CtrWrapper<Ctr128BE<Aes192>>> = SshBlockCipher(PhantomData);
static _AES_256_CTR: SshBlockCipher<CtrWrapper<Ctr128BE<Aes256>>> = SshBlockCipher(PhantomData);
static _AES_128_CBC: SshBlockCipher<CbcWrapper<Aes128>> = SshBlockCipher(PhantomData);
static _AES_256_CBC: SshBlockCipher<CbcWrapper<Aes256>> = SshBlockCipher(PhantomData);
static _AES_128_GCM: GcmCipher<Aes128Gcm> = GcmCipher(PhantomData);
static _AES_256_GCM: GcmCipher<Aes256Gcm> = GcmCipher(PhantomData);
static _CHACHA20_POLY1305: OpenSshChacha20Poly1305 = OpenSshChacha20Poly1305 {};

pub static ALL_CIPHERS: &[&Name] = &[
    &CLEAR,
    &NONE,
    &AES_128_CTR,
    &AES_192_CTR,
    &AES_256_CTR,
    &AES_128_CBC,
    &AES_256_CBC,
    &AES_128_GCM,
    &AES_256_GCM,
    &CHACHA20_POLY1305,
];

pub(crate) static CIPHERS: LazyLock<HashMap<&'static Name, &(dyn Cipher + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn Cipher + Send + Sync)> = HashMap::new();
        h.insert(&CLEAR, &_CLEAR);
        h.insert(&NONE, &_CLEAR);
        h.insert(&AES_128_CTR, &_AES_128_CTR);
        h.insert(&AES_192_CTR, &_AES_192_CTR);
        h.insert(&AES_256_CTR, &_AES_256_CTR);
        h.insert(&AES_128_CBC, &_AES_128_CBC);
        h.insert(&AES_256_CBC, &_AES_256_CBC);
        h.insert(&AES_128_GCM, &_AES_128_GCM);
        h.insert(&AES_256_GCM, &_AES_256_GCM);
        h.insert(&CHACHA20_POLY1305, &_CHACHA20_POLY1305);
        assert_eq!(h.len(), ALL_CIPHERS.len());
        h
    });

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    delegate! { to self.as_ref() {
        fn encoded_len(&self) -> Result<usize, ssh_encoding::Error>;
        fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error>;
    }}
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        CIPHERS.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

/// One direction's keys, installed together at the NEWKEYS boundary.
pub(crate) struct CipherPair {
    pub local_to_remote: Box<dyn SealingKey + Send>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub(crate) trait OpeningKey {
    /// How many bytes must be read before the packet length can be
    /// recovered (the cipher block for classic block modes, 4 otherwise).
    fn packet_length_to_read_for_block_length(&self) -> usize {
        4
    }

    /// Recover the cleartext packet length without advancing cipher state.
    fn decrypt_packet_length(
        &self,
        seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error>;

    fn tag_len(&self) -> usize;

    /// Authenticate and decrypt one packet in place. `buffer` holds the
    /// four length bytes followed by the body; the returned slice starts
    /// at the padding-length byte.
    fn open<'a>(
        &mut self,
        seqn: u32,
        buffer: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    /// Frame `payload` into the write buffer:
    /// `packet_length | padding_length | payload | padding | tag`.
    fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer) {
        // https://tools.ietf.org/html/rfc4253#section-6
        trace!("writing, seqn = {:?}", buffer.seqn.0);

        let padding_length = self.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let offset = buffer.buffer.len();

        debug_assert!(packet_length <= u32::MAX as usize);
        buffer
            .buffer
            .extend_from_slice(&(packet_length as u32).to_be_bytes());
        debug_assert!(padding_length <= u8::MAX as usize);
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend_from_slice(payload);

        let pad_start = buffer.buffer.len();
        buffer.buffer.resize(pad_start + padding_length, 0);
        #[allow(clippy::indexing_slicing)] // room was just reserved
        self.fill_padding(&mut buffer.buffer[pad_start..]);

        let tag_start = buffer.buffer.len();
        buffer.buffer.resize(tag_start + self.tag_len(), 0);

        #[allow(clippy::indexing_slicing)] // length checked
        let (packet, tag) = buffer.buffer[offset..].split_at_mut(tag_start - offset);
        self.seal(buffer.seqn.0, packet, tag);

        buffer.bytes += payload.len();
        buffer.packets = buffer.packets.wrapping_add(1);
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
    }
}

/// Read, authenticate and decrypt one packet. On return the buffer holds
/// `length | padding_length | payload` with padding and tag removed; the
/// payload starts at offset 5.
pub(crate) async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut (dyn OpeningKey + Send),
) -> Result<usize, Error> {
    if buffer.len == 0 {
        let l = cipher.packet_length_to_read_for_block_length();
        buffer.buffer.clear();
        buffer.buffer.resize(l, 0);
        stream.read_exact(&mut buffer.buffer).await?;

        let seqn = buffer.seqn.0;
        trace!("reading, seqn = {seqn:?}");
        let len = cipher.decrypt_packet_length(seqn, &buffer.buffer)?;
        let len = BigEndian::read_u32(&len) as usize;

        if len > MAXIMUM_PACKET_LEN || len < PADDING_LENGTH_LEN {
            return Err(Error::PacketSize(len));
        }

        buffer.len = len + cipher.tag_len();
        trace!("reading, clear len = {:?}", buffer.len);
    }

    let l = cipher.packet_length_to_read_for_block_length();
    buffer.buffer.resize(buffer.len + PACKET_LENGTH_LEN, 0);
    if buffer.buffer.len() < l {
        return Err(Error::PacketSize(buffer.len));
    }

    #[allow(clippy::indexing_slicing)] // length checked
    stream.read_exact(&mut buffer.buffer[l..]).await?;

    let seqn = buffer.seqn.0;
    let tag_len = cipher.tag_len();
    let packet_end = buffer
        .buffer
        .len()
        .checked_sub(tag_len)
        .ok_or(Error::IndexOutOfBounds)?;

    #[allow(clippy::indexing_slicing)] // length checked
    let plaintext = {
        let (packet, tag) = buffer.buffer.split_at_mut(packet_end);
        cipher.open(seqn, packet, tag)?
    };

    let padding_length = *plaintext.first().unwrap_or(&0) as usize;
    trace!("reading, padding_length {padding_length:?}");
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .ok_or(Error::IndexOutOfBounds)?;

    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    buffer.seqn += Wrapping(1);
    buffer.len = 0;

    // Strip the padding and the tag.
    buffer.buffer.truncate(plaintext_end + PACKET_LENGTH_LEN);

    Ok(plaintext_end + PACKET_LENGTH_LEN)
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;

pub(crate) const MINIMUM_PACKET_LEN: usize = 16;
const MAXIMUM_PACKET_LEN: usize = 256 * 1024;

pub(crate) const PADDING_LENGTH_LEN: usize = 1;

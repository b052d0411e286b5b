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

//! `chacha20-poly1305@openssh.com`.
//!
//! http://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/PROTOCOL.chacha20poly1305?annotate=HEAD
//!
//! Takes 64 bytes of key material: the first 32 key the payload instance
//! (which also yields the per-packet Poly1305 key at block 0), the second
//! 32 key a separate instance that encrypts the 4-byte packet length. The
//! nonce of both is the packet sequence number, so no IV is derived.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20Legacy;
use digest::KeyInit;
use generic_array::GenericArray;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;

use super::{Error, MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::MacAlgorithm;

pub(crate) struct OpenSshChacha20Poly1305 {}

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

impl super::Cipher for OpenSshChacha20Poly1305 {
    fn key_len(&self) -> usize {
        2 * KEY_LEN
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(Key::split(k)?))
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(Key::split(k)?))
    }
}

pub(crate) struct Key {
    payload_key: [u8; KEY_LEN],
    length_key: [u8; KEY_LEN],
}

impl Key {
    fn split(k: &[u8]) -> Result<Key, Error> {
        let mut key = Key {
            payload_key: [0; KEY_LEN],
            length_key: [0; KEY_LEN],
        };
        key.payload_key
            .copy_from_slice(k.get(..KEY_LEN).ok_or(Error::KexInit)?);
        key.length_key
            .copy_from_slice(k.get(KEY_LEN..2 * KEY_LEN).ok_or(Error::KexInit)?);
        Ok(key)
    }

    fn length_cipher(&self, seqn: u32) -> ChaCha20Legacy {
        ChaCha20Legacy::new(
            GenericArray::from_slice(&self.length_key),
            GenericArray::from_slice(&(seqn as u64).to_be_bytes()),
        )
    }

    /// The payload instance: block 0 yields the Poly1305 key, the payload
    /// keystream starts at block 1.
    fn payload_cipher(&self, seqn: u32) -> (Poly1305, ChaCha20Legacy) {
        let mut cipher = ChaCha20Legacy::new(
            GenericArray::from_slice(&self.payload_key),
            GenericArray::from_slice(&(seqn as u64).to_be_bytes()),
        );
        let mut poly_key = [0u8; 32];
        cipher.apply_keystream(&mut poly_key);
        cipher.seek(64u64);
        (Poly1305::new(GenericArray::from_slice(&poly_key)), cipher)
    }
}

impl super::OpeningKey for Key {
    fn decrypt_packet_length(
        &self,
        seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error> {
        let mut len = [0; PACKET_LENGTH_LEN];
        len.copy_from_slice(
            encrypted_packet_length
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?,
        );
        self.length_cipher(seqn).apply_keystream(&mut len);
        Ok(len)
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn open<'a>(&mut self, seqn: u32, buffer: &'a mut [u8], tag: &[u8]) -> Result<&'a [u8], Error> {
        let (poly, mut cipher) = self.payload_cipher(seqn);

        // The tag covers the encrypted length and the encrypted payload.
        let expected = poly.compute_unpadded(buffer);
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(Error::PacketAuth);
        }

        let body = buffer
            .get_mut(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)?;
        cipher.apply_keystream(body);

        buffer
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl super::SealingKey for Key {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let block_size = 8;
        let extra_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
        let padding_len = if payload.len() + extra_len <= MINIMUM_PACKET_LEN {
            MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN
        } else {
            block_size - ((PADDING_LENGTH_LEN + payload.len()) % block_size)
        };
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + block_size
        } else {
            padding_len
        }
    }

    // Stateful counter-mode encryption; the padding never feeds the
    // keystream, so constant padding avoids the PRNG.
    fn fill_padding(&self, padding_out: &mut [u8]) {
        for padding_byte in padding_out {
            *padding_byte = 0;
        }
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag: &mut [u8]) {
        let (poly, mut cipher) = self.payload_cipher(seqn);

        if let Some(len) = plaintext_in_ciphertext_out.get_mut(..PACKET_LENGTH_LEN) {
            self.length_cipher(seqn).apply_keystream(len);
        }
        if let Some(body) = plaintext_in_ciphertext_out.get_mut(PACKET_LENGTH_LEN..) {
            cipher.apply_keystream(body);
        }

        let computed = poly.compute_unpadded(plaintext_in_ciphertext_out);
        tag.clone_from_slice(&computed);
    }
}

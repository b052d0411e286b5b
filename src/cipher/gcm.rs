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

//! AES-GCM in the OpenSSH framing (RFC 5647): the packet length is
//! authenticated as associated data but not encrypted, and the nonce is
//! the derived IV whose low 64 bits form an invocation counter.

use std::marker::PhantomData;

use aes_gcm::{AeadCore, AeadInPlace, KeyInit, KeySizeUser};
use generic_array::typenum::Unsigned;
use generic_array::{ArrayLength, GenericArray};
use rand::RngCore;

use super::{Error, MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::MacAlgorithm;

pub(crate) struct GcmCipher<A>(pub PhantomData<A>);

type Nonce<A> = GenericArray<u8, <A as AeadCore>::NonceSize>;

impl<A> super::Cipher for GcmCipher<A>
where
    A: AeadInPlace + KeyInit + KeySizeUser + Send + Sync + 'static,
    Nonce<A>: Send,
{
    fn key_len(&self) -> usize {
        A::key_size()
    }

    fn nonce_len(&self) -> usize {
        A::NonceSize::to_usize()
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        let mut nonce = Nonce::<A>::default();
        if n.len() != nonce.len() || k.len() != A::key_size() {
            return Err(Error::KexInit);
        }
        nonce.clone_from_slice(n);
        Ok(Box::new(OpeningKey {
            nonce,
            cipher: A::new_from_slice(k).map_err(|_| Error::KexInit)?,
        }))
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        let mut nonce = Nonce::<A>::default();
        if n.len() != nonce.len() || k.len() != A::key_size() {
            return Err(Error::KexInit);
        }
        nonce.clone_from_slice(n);
        Ok(Box::new(SealingKey {
            nonce,
            cipher: A::new_from_slice(k).map_err(|_| Error::KexInit)?,
        }))
    }
}

pub(crate) struct OpeningKey<A: AeadInPlace> {
    nonce: Nonce<A>,
    cipher: A,
}

pub(crate) struct SealingKey<A: AeadInPlace> {
    nonce: Nonce<A>,
    cipher: A,
}

/// Increment the 64-bit invocation counter in the low bytes of the nonce.
fn inc_nonce<N: ArrayLength<u8>>(nonce: &mut GenericArray<u8, N>) {
    let mut carry = 1u16;
    let fixed = nonce.len().saturating_sub(8);
    for i in (fixed..nonce.len()).rev() {
        if let Some(b) = nonce.get_mut(i) {
            let n = *b as u16 + carry;
            *b = n as u8;
            carry = n >> 8;
        }
    }
}

impl<A: AeadInPlace + Send> super::OpeningKey for OpeningKey<A> {
    fn decrypt_packet_length(
        &self,
        _seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error> {
        // The packet length is sent unencrypted.
        let mut len = [0; PACKET_LENGTH_LEN];
        len.copy_from_slice(
            encrypted_packet_length
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?,
        );
        Ok(len)
    }

    fn tag_len(&self) -> usize {
        A::TagSize::to_usize()
    }

    fn open<'a>(
        &mut self,
        _seqn: u32,
        buffer: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error> {
        let mut packet_length = [0; PACKET_LENGTH_LEN];
        packet_length.copy_from_slice(
            buffer
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?,
        );

        let mut tag_buf = GenericArray::<u8, A::TagSize>::default();
        if tag.len() != tag_buf.len() {
            return Err(Error::DecryptionError);
        }
        tag_buf.clone_from_slice(tag);

        let body = buffer
            .get_mut(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)?;
        self.cipher
            .decrypt_in_place_detached(&self.nonce, &packet_length, body, &tag_buf)
            .map_err(|_| Error::DecryptionError)?;

        inc_nonce(&mut self.nonce);

        buffer
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl<A: AeadInPlace + Send> super::SealingKey for SealingKey<A> {
    fn padding_length(&self, payload: &[u8]) -> usize {
        // The length field is associated data, not part of the alignment.
        let block_size = 16;
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

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        A::TagSize::to_usize()
    }

    fn seal(&mut self, _seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag: &mut [u8]) {
        let mut packet_length = [0; PACKET_LENGTH_LEN];
        if let Some(len) = plaintext_in_ciphertext_out.get(..PACKET_LENGTH_LEN) {
            packet_length.copy_from_slice(len);
        }

        if let Some(body) = plaintext_in_ciphertext_out.get_mut(PACKET_LENGTH_LEN..) {
            if let Ok(tag_out) =
                self.cipher
                    .encrypt_in_place_detached(&self.nonce, &packet_length, body)
            {
                tag.clone_from_slice(&tag_out);
            }
        }

        inc_nonce(&mut self.nonce);
    }
}

//! Classic block/stream ciphers (aes-ctr, aes-cbc) with an external MAC,
//! in both MAC-then-encrypt and `*-etm@openssh.com` layouts.

use std::convert::TryInto;
use std::marker::PhantomData;

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

use super::{Error, MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::{Mac, MacAlgorithm};

const BLOCK_LEN: usize = 16;

/// The per-direction cipher state a [`SshBlockCipher`] drives: encrypt and
/// decrypt advance the keystream/chain, peek must not.
pub(crate) trait BlockStreamCipher: Send {
    fn encrypt_data(&mut self, data: &mut [u8]);
    fn decrypt_data(&mut self, data: &mut [u8]);
    fn decrypt_peek(&self, data: &mut [u8]);
}

/// Construction seam so CTR and CBC share the packet layout code.
pub(crate) trait BlockCipherInit: BlockStreamCipher + Sized {
    fn key_len() -> usize;
    fn iv_len() -> usize;
    fn init(key: &[u8], iv: &[u8]) -> Result<Self, Error>;
}

/// Counter-mode ciphers: the same keystream application both ways, peeking
/// by cloning the keystream position.
pub(crate) struct CtrWrapper<C: StreamCipher + KeyIvInit + Clone + Send>(C);

impl<C: StreamCipher + KeyIvInit + Clone + Send> BlockStreamCipher for CtrWrapper<C> {
    fn encrypt_data(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }

    fn decrypt_data(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }

    fn decrypt_peek(&self, data: &mut [u8]) {
        let mut cipher = self.0.clone();
        cipher.apply_keystream(data);
    }
}

impl<C: StreamCipher + KeyIvInit + Clone + Send> BlockCipherInit for CtrWrapper<C> {
    fn key_len() -> usize {
        C::key_size()
    }

    fn iv_len() -> usize {
        C::iv_size()
    }

    fn init(key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        Ok(CtrWrapper(
            C::new_from_slices(key, iv).map_err(|_| Error::KexInit)?,
        ))
    }
}

pub(crate) struct SshBlockCipher<C: BlockCipherInit>(pub PhantomData<C>);

impl<C: BlockCipherInit + Send + 'static> super::Cipher for SshBlockCipher<C> {
    fn needs_mac(&self) -> bool {
        true
    }

    fn key_len(&self) -> usize {
        C::key_len()
    }

    fn nonce_len(&self) -> usize {
        C::iv_len()
    }

    fn make_opening_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(OpeningKey {
            cipher: C::init(key, nonce)?,
            mac: mac.make_mac(mac_key),
        }))
    }

    fn make_sealing_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(SealingKey {
            cipher: C::init(key, nonce)?,
            mac: mac.make_mac(mac_key),
        }))
    }
}

pub(crate) struct OpeningKey<C: BlockStreamCipher> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

pub(crate) struct SealingKey<C: BlockStreamCipher> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

impl<C: BlockStreamCipher> super::OpeningKey for OpeningKey<C> {
    fn packet_length_to_read_for_block_length(&self) -> usize {
        if self.mac.is_etm() {
            // The length is sent in the clear ahead of the ciphertext.
            PACKET_LENGTH_LEN
        } else {
            BLOCK_LEN
        }
    }

    fn decrypt_packet_length(
        &self,
        _seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error> {
        if self.mac.is_etm() {
            Ok(encrypted_packet_length
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?
                .try_into()
                .map_err(|_| Error::IndexOutOfBounds)?)
        } else {
            let mut block = encrypted_packet_length.to_vec();
            self.cipher.decrypt_peek(&mut block);
            Ok(block
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?
                .try_into()
                .map_err(|_| Error::IndexOutOfBounds)?)
        }
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open<'a>(
        &mut self,
        seqn: u32,
        buffer: &'a mut [u8],
        tag: &[u8],
    ) -> Result<&'a [u8], Error> {
        if self.mac.is_etm() {
            // Verify over the cleartext length and the ciphertext, then
            // decrypt the body only.
            if !self.mac.verify(seqn, buffer, tag) {
                return Err(Error::PacketAuth);
            }
            let body = buffer
                .get_mut(PACKET_LENGTH_LEN..)
                .ok_or(Error::IndexOutOfBounds)?;
            self.cipher.decrypt_data(body);
        } else {
            self.cipher.decrypt_data(buffer);
            if !self.mac.verify(seqn, buffer, tag) {
                return Err(Error::PacketAuth);
            }
        }
        buffer
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl<C: BlockStreamCipher> super::SealingKey for SealingKey<C> {
    fn padding_length(&self, payload: &[u8]) -> usize {
        // For etm modes the length field is excluded from the alignment.
        let pll = if self.mac.is_etm() {
            0
        } else {
            PACKET_LENGTH_LEN
        };
        let extra_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + self.mac.mac_len();
        let padding_len = if payload.len() + extra_len <= MINIMUM_PACKET_LEN {
            MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN - pll
        } else {
            BLOCK_LEN - ((pll + PADDING_LENGTH_LEN + payload.len()) % BLOCK_LEN)
        };
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + BLOCK_LEN
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        if self.mac.is_etm() {
            if let Some(body) = plaintext_in_ciphertext_out.get_mut(PACKET_LENGTH_LEN..) {
                self.cipher.encrypt_data(body);
            }
            self.mac
                .compute(seqn, plaintext_in_ciphertext_out, tag_out);
        } else {
            self.mac
                .compute(seqn, plaintext_in_ciphertext_out, tag_out);
            self.cipher.encrypt_data(plaintext_in_ciphertext_out);
        }
    }
}

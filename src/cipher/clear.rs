//! The identity cipher, used until the first NEWKEYS.

use super::{Error, MINIMUM_PACKET_LEN, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::MacAlgorithm;

pub(crate) struct Clear {}

#[derive(Debug)]
pub(crate) struct Key;

impl super::Cipher for Clear {
    fn key_len(&self) -> usize {
        0
    }

    fn make_opening_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(Key))
    }

    fn make_sealing_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(Key))
    }
}

impl super::OpeningKey for Key {
    fn decrypt_packet_length(
        &self,
        _seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error> {
        let mut len = [0; PACKET_LENGTH_LEN];
        len.copy_from_slice(
            encrypted_packet_length
                .get(..PACKET_LENGTH_LEN)
                .ok_or(Error::IndexOutOfBounds)?,
        );
        Ok(len)
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open<'a>(&mut self, _seqn: u32, buffer: &'a mut [u8], _tag: &[u8]) -> Result<&'a [u8], Error> {
        buffer
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl super::SealingKey for Key {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let block_size = 8;
        let padding_len = if PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len()
            <= MINIMUM_PACKET_LEN
        {
            MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN - PACKET_LENGTH_LEN
        } else {
            block_size
                - ((PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len()) % block_size)
        };
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + block_size
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        for b in padding_out {
            *b = 0;
        }
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&mut self, _seqn: u32, _plaintext_in_ciphertext_out: &mut [u8], _tag_out: &mut [u8]) {}
}

use aes::cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyIvInit,
};
use cbc::{Decryptor, Encryptor};
use generic_array::GenericArray;

use super::block::{BlockCipherInit, BlockStreamCipher};
use crate::Error;

pub(crate) struct CbcWrapper<C: BlockEncrypt + BlockCipher + BlockDecrypt + Clone> {
    encryptor: Encryptor<C>,
    decryptor: Decryptor<C>,
}

impl<C: BlockEncrypt + BlockCipher + BlockDecrypt + Clone + Send> BlockStreamCipher
    for CbcWrapper<C>
{
    fn encrypt_data(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(C::block_size()) {
            let mut block: GenericArray<u8, C::BlockSize> = GenericArray::clone_from_slice(chunk);
            self.encryptor.encrypt_block_mut(&mut block);
            chunk.copy_from_slice(&block);
        }
    }

    fn decrypt_data(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(C::block_size()) {
            let mut block: GenericArray<u8, C::BlockSize> = GenericArray::clone_from_slice(chunk);
            self.decryptor.decrypt_block_mut(&mut block);
            chunk.copy_from_slice(&block);
        }
    }

    fn decrypt_peek(&self, data: &mut [u8]) {
        let mut decryptor = self.decryptor.clone();
        for chunk in data.chunks_exact_mut(C::block_size()) {
            let mut block: GenericArray<u8, C::BlockSize> = GenericArray::clone_from_slice(chunk);
            decryptor.decrypt_block_mut(&mut block);
            chunk.copy_from_slice(&block);
        }
    }
}

impl<C: BlockEncrypt + BlockCipher + BlockDecrypt + Clone + Send> BlockCipherInit
    for CbcWrapper<C>
where
    C: aes::cipher::KeyInit,
{
    fn key_len() -> usize {
        C::key_size()
    }

    fn iv_len() -> usize {
        C::block_size()
    }

    fn init(key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        Ok(CbcWrapper {
            encryptor: Encryptor::new_from_slices(key, iv).map_err(|_| Error::KexInit)?,
            decryptor: Decryptor::new_from_slices(key, iv).map_err(|_| Error::KexInit)?,
        })
    }
}

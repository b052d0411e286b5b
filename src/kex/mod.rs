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
//! This module exports kex algorithm names for use with [Preferred].

mod curve25519;
pub mod dh;
mod ecdh_nistp;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::sync::LazyLock;

use curve25519::Curve25519KexType;
use delegate::delegate;
use dh::groups::DhGroup;
use dh::{DhGexSha256KexType, DhGroup14Sha1KexType, DhGroup14Sha256KexType, DhGroup16Sha512KexType};
use digest::Digest;
use ecdh_nistp::{EcdhNistP256KexType, EcdhNistP384KexType, EcdhNistP521KexType};
use ssh_encoding::Encode;
use zeroize::Zeroizing;

use crate::cipher::CIPHERS;
use crate::client::GexParams;
use crate::mac::{self, MACS};
use crate::session::Exchange;
use crate::wire::encode_mpint;
use crate::{cipher, Error};

pub(crate) trait KexAlgorithm: Send {
    fn skip_exchange(&self) -> bool {
        false
    }

    fn is_dh_gex(&self) -> bool {
        false
    }

    #[allow(unused_variables)]
    fn client_dh_gex_init(&mut self, gex: &GexParams, writer: &mut Vec<u8>) -> Result<(), Error> {
        Err(Error::KexInit)
    }

    #[allow(unused_variables)]
    fn dh_gex_set_group(&mut self, group: DhGroup) -> Result<(), Error> {
        Err(Error::KexInit)
    }

    /// Generate our ephemeral, record it in `client_ephemeral` and write
    /// the KEX init message.
    fn client_dh(&mut self, client_ephemeral: &mut Vec<u8>, writer: &mut Vec<u8>)
        -> Result<(), Error>;

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error>;

    /// `key` is the wire-encoded server host key blob, already framed as
    /// an SSH string.
    fn compute_exchange_hash(
        &self,
        key: &[u8],
        exchange: &Exchange,
        buffer: &mut Vec<u8>,
    ) -> Result<Vec<u8>, Error>;

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        client_cipher: cipher::Name,
        server_cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
    ) -> Result<cipher::CipherPair, Error>;
}

pub(crate) trait KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send>;
}

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
        KEXES.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");
/// `diffie-hellman-group-exchange-sha256`
pub const DH_GEX_SHA256: Name = Name("diffie-hellman-group-exchange-sha256");
/// `diffie-hellman-group14-sha1`
pub const DH_G14_SHA1: Name = Name("diffie-hellman-group14-sha1");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256: Name = Name("diffie-hellman-group14-sha256");
/// `diffie-hellman-group16-sha512`
pub const DH_G16_SHA512: Name = Name("diffie-hellman-group16-sha512");
/// `ecdh-sha2-nistp256`
pub const ECDH_SHA2_NISTP256: Name = Name("ecdh-sha2-nistp256");
/// `ecdh-sha2-nistp384`
pub const ECDH_SHA2_NISTP384: Name = Name("ecdh-sha2-nistp384");
/// `ecdh-sha2-nistp521`
pub const ECDH_SHA2_NISTP521: Name = Name("ecdh-sha2-nistp521");
/// `ext-info-c` (RFC 8308 §2.1, not a key exchange method)
pub const EXTENSION_SUPPORT_AS_CLIENT: Name = Name("ext-info-c");

const _CURVE25519: Curve25519KexType = Curve25519KexType {};
const _DH_GEX_SHA256: DhGexSha256KexType = DhGexSha256KexType {};
const _DH_G14_SHA1: DhGroup14Sha1KexType = DhGroup14Sha1KexType {};
const _DH_G14_SHA256: DhGroup14Sha256KexType = DhGroup14Sha256KexType {};
const _DH_G16_SHA512: DhGroup16Sha512KexType = DhGroup16Sha512KexType {};
const _ECDH_SHA2_NISTP256: EcdhNistP256KexType = EcdhNistP256KexType {};
const _ECDH_SHA2_NISTP384: EcdhNistP384KexType = EcdhNistP384KexType {};
const _ECDH_SHA2_NISTP521: EcdhNistP521KexType = EcdhNistP521KexType {};

pub const ALL_KEX_ALGORITHMS: &[&Name] = &[
    &CURVE25519,
    &CURVE25519_PRE_RFC_8731,
    &DH_GEX_SHA256,
    &DH_G14_SHA1,
    &DH_G14_SHA256,
    &DH_G16_SHA512,
    &ECDH_SHA2_NISTP256,
    &ECDH_SHA2_NISTP384,
    &ECDH_SHA2_NISTP521,
];

pub(crate) static KEXES: LazyLock<HashMap<&'static Name, &(dyn KexType + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn KexType + Send + Sync)> = HashMap::new();
        h.insert(&CURVE25519, &_CURVE25519);
        h.insert(&CURVE25519_PRE_RFC_8731, &_CURVE25519);
        h.insert(&DH_GEX_SHA256, &_DH_GEX_SHA256);
        h.insert(&DH_G14_SHA1, &_DH_G14_SHA1);
        h.insert(&DH_G14_SHA256, &_DH_G14_SHA256);
        h.insert(&DH_G16_SHA512, &_DH_G16_SHA512);
        h.insert(&ECDH_SHA2_NISTP256, &_ECDH_SHA2_NISTP256);
        h.insert(&ECDH_SHA2_NISTP384, &_ECDH_SHA2_NISTP384);
        h.insert(&ECDH_SHA2_NISTP521, &_ECDH_SHA2_NISTP521);
        assert_eq!(ALL_KEX_ALGORITHMS.len(), h.len());
        h
    });

/// The shared secret `K`, already framed the way it enters the exchange
/// hash and the key derivation (mpint for DH-style kexes).
pub(crate) enum SharedSecret {
    Mpint(Zeroizing<Vec<u8>>),
}

impl SharedSecret {
    pub fn from_mpint(bytes: &[u8]) -> Result<Self, Error> {
        let mut encoded = Zeroizing::new(Vec::new());
        encode_mpint(bytes, &mut *encoded)?;
        Ok(SharedSecret::Mpint(encoded))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SharedSecret::Mpint(v) => v.as_ref(),
        }
    }
}

/// RFC 4253 §7.2: derive IVs, cipher keys and MAC keys from `K`, `H` and
/// the session id, with the per-direction letters 'A'..'F'. The client's
/// local-to-remote direction uses 'A'/'C'/'E'.
pub(crate) fn compute_keys<D: Digest>(
    shared_secret: Option<&SharedSecret>,
    session_id: &[u8],
    exchange_hash: &[u8],
    client_cipher: cipher::Name,
    server_cipher: cipher::Name,
    remote_to_local_mac: mac::Name,
    local_to_remote_mac: mac::Name,
) -> Result<cipher::CipherPair, Error> {
    let client_cipher_algo = CIPHERS.get(&client_cipher).ok_or(Error::UnknownAlgo)?;
    let server_cipher_algo = CIPHERS.get(&server_cipher).ok_or(Error::UnknownAlgo)?;
    let remote_to_local_mac_algo = MACS.get(&remote_to_local_mac).ok_or(Error::UnknownAlgo)?;
    let local_to_remote_mac_algo = MACS.get(&local_to_remote_mac).ok_or(Error::UnknownAlgo)?;

    let compute_key = |letter: u8, len: usize| -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(Vec::new());
        let mut buffer = Zeroizing::new(Vec::new());
        if let Some(shared) = shared_secret {
            buffer.extend_from_slice(shared.as_bytes());
        }
        buffer.extend_from_slice(exchange_hash);
        buffer.push(letter);
        buffer.extend_from_slice(session_id);
        key.extend_from_slice(D::digest(buffer.as_slice()).as_ref());

        while key.len() < len {
            // Extend by re-hashing K || H || output so far.
            buffer.clear();
            if let Some(shared) = shared_secret {
                buffer.extend_from_slice(shared.as_bytes());
            }
            buffer.extend_from_slice(exchange_hash);
            buffer.extend_from_slice(&key);
            key.extend_from_slice(D::digest(buffer.as_slice()).as_ref());
        }

        key.truncate(len);
        key
    };

    let iv = compute_key(b'A', client_cipher_algo.nonce_len());
    let key = compute_key(b'C', client_cipher_algo.key_len());
    let mac = compute_key(b'E', local_to_remote_mac_algo.key_len());
    let local_to_remote =
        client_cipher_algo.make_sealing_key(&key, &iv, &mac, *local_to_remote_mac_algo)?;

    let iv = compute_key(b'B', server_cipher_algo.nonce_len());
    let key = compute_key(b'D', server_cipher_algo.key_len());
    let mac = compute_key(b'F', remote_to_local_mac_algo.key_len());
    let remote_to_local =
        server_cipher_algo.make_opening_key(&key, &iv, &mac, *remote_to_local_mac_algo)?;

    Ok(cipher::CipherPair {
        local_to_remote,
        remote_to_local,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    // The key derivation needs to extend its output by re-hashing when a
    // cipher wants more key material than one digest block; chacha20
    // (64-byte key) over sha256 exercises that path.
    #[test]
    fn derivation_covers_long_keys() {
        let shared = SharedSecret::from_mpint(&[0x11u8; 32]).unwrap();
        let h = [0x22u8; 32];
        let sid = [0x33u8; 32];
        for name in [cipher::AES_256_CTR, cipher::CHACHA20_POLY1305] {
            compute_keys::<sha2::Sha256>(
                Some(&shared),
                &sid,
                &h,
                name,
                name,
                mac::HMAC_SHA256,
                mac::HMAC_SHA256,
            )
            .unwrap();
        }
    }
}

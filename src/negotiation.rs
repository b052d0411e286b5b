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

use std::borrow::Cow;

use log::debug;
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use crate::cipher::CIPHERS;
use crate::wire::NameList;
use crate::{cipher, compression, kex, mac, msg, AlgorithmKind, Error};

/// The outcome of one KEXINIT exchange. `client_*` names the
/// client-to-server direction, `server_*` the reverse.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: kex::Name,
    pub key: Algorithm,
    pub client_cipher: cipher::Name,
    pub server_cipher: cipher::Name,
    pub client_mac: mac::Name,
    pub server_mac: mac::Name,
    pub client_compression: compression::Compression,
    pub server_compression: compression::Compression,
    pub ignore_guessed: bool,
}

/// Lists of preferred algorithms, in client preference order.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred host key algorithms.
    pub key: Cow<'static, [Algorithm]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
    /// Preferred compression algorithms.
    pub compression: Cow<'static, [compression::Name]>,
}

const KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

const HMAC_ORDER: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

const COMPRESSION_ORDER: &[compression::Name] = &[
    compression::NONE,
    #[cfg(feature = "flate2")]
    compression::ZLIB,
    #[cfg(feature = "flate2")]
    compression::ZLIB_LEGACY,
];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(KEX_ORDER),
        key: Cow::Borrowed(&[
            Algorithm::Ed25519,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP521,
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa { hash: None },
        ]),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSION_ORDER),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// RFC 4253 §7.1: the chosen algorithm is the first of the client's
/// preferences that the server also supports. Returns whether both sides'
/// first choice matched (for the first-kex-packet-follows optimism).
pub(crate) fn select<S: AsRef<str> + Clone>(
    client_list: &[S],
    server_list: &[String],
    kind: AlgorithmKind,
) -> Result<(bool, S), Error> {
    let mut both_first_choice = true;
    for c in client_list {
        for s in server_list {
            if s == c.as_ref() {
                return Ok((both_first_choice, c.clone()));
            }
            both_first_choice = false
        }
    }
    Err(Error::NoCommonAlgo {
        kind,
        ours: client_list.iter().map(|x| x.as_ref().to_owned()).collect(),
        theirs: server_list.to_vec(),
    })
}

/// Parse the server's KEXINIT payload and resolve every category against
/// our preferences.
pub(crate) fn read_kex(buffer: &[u8], pref: &Preferred) -> Result<Names, Error> {
    let mut r = buffer.get(17..).ok_or(Error::Inconsistent)?;
    let r = &mut r;

    let kex_string = NameList::decode(r)?;
    let (kex_both_first, kex_algorithm) = select(
        pref.kex
            .iter()
            .filter(|k| **k != kex::EXTENSION_SUPPORT_AS_CLIENT)
            .cloned()
            .collect::<Vec<_>>()
            .as_slice(),
        &kex_string.0,
        AlgorithmKind::Kex,
    )?;

    let key_string = NameList::decode(r)?;
    let (key_both_first, key_algorithm) = select(&pref.key, &key_string.0, AlgorithmKind::Key)?;

    let client_cipher_string = NameList::decode(r)?;
    let (_, client_cipher) = select(&pref.cipher, &client_cipher_string.0, AlgorithmKind::Cipher)?;
    let server_cipher_string = NameList::decode(r)?;
    let (_, server_cipher) = select(&pref.cipher, &server_cipher_string.0, AlgorithmKind::Cipher)?;

    let client_needs_mac = CIPHERS
        .get(&client_cipher)
        .map(|x| x.needs_mac())
        .unwrap_or(false);
    let server_needs_mac = CIPHERS
        .get(&server_cipher)
        .map(|x| x.needs_mac())
        .unwrap_or(false);

    let client_mac = match select(&pref.mac, &NameList::decode(r)?.0, AlgorithmKind::Mac) {
        Ok((_, m)) => m,
        Err(e) if client_needs_mac => return Err(e),
        Err(_) => mac::NONE,
    };
    let server_mac = match select(&pref.mac, &NameList::decode(r)?.0, AlgorithmKind::Mac) {
        Ok((_, m)) => m,
        Err(e) if server_needs_mac => return Err(e),
        Err(_) => mac::NONE,
    };

    let client_compression = compression::Compression::new(
        &select(
            &pref.compression,
            &NameList::decode(r)?.0,
            AlgorithmKind::Compression,
        )?
        .1,
    );
    let server_compression = compression::Compression::new(
        &select(
            &pref.compression,
            &NameList::decode(r)?.0,
            AlgorithmKind::Compression,
        )?
        .1,
    );

    NameList::decode(r)?; // languages client-to-server
    NameList::decode(r)?; // languages server-to-client

    let follows = u8::decode(r)? != 0;
    debug!(
        "negotiated: kex {:?}, key {:?}, cipher {:?}/{:?}, mac {:?}/{:?}",
        kex_algorithm, key_algorithm, client_cipher, server_cipher, client_mac, server_mac
    );
    Ok(Names {
        kex: kex_algorithm,
        key: key_algorithm,
        client_cipher,
        server_cipher,
        client_mac,
        server_mac,
        client_compression,
        server_compression,
        // Ignore the next packet if (1) it follows and (2) it's not the correct guess.
        ignore_guessed: follows && !(kex_both_first && key_both_first),
    })
}

/// Build our KEXINIT payload; the caller both sends it and captures it
/// verbatim for the exchange hash.
pub(crate) fn write_kexinit(prefs: &Preferred) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    msg::KEXINIT.encode(&mut buf)?;

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend_from_slice(&cookie);

    extend_list(&mut buf, prefs.kex.iter().map(|k| k.as_ref()))?;
    extend_list(&mut buf, prefs.key.iter().map(|k| k.as_str()))?;

    extend_list(&mut buf, prefs.cipher.iter().map(|k| k.as_ref()))?; // client to server
    extend_list(&mut buf, prefs.cipher.iter().map(|k| k.as_ref()))?; // server to client

    extend_list(&mut buf, prefs.mac.iter().map(|k| k.as_ref()))?;
    extend_list(&mut buf, prefs.mac.iter().map(|k| k.as_ref()))?;

    extend_list(&mut buf, prefs.compression.iter().map(|k| k.as_ref()))?;
    extend_list(&mut buf, prefs.compression.iter().map(|k| k.as_ref()))?;

    extend_list(&mut buf, std::iter::empty())?; // languages client to server
    extend_list(&mut buf, std::iter::empty())?; // languages server to client

    buf.push(0); // doesn't follow
    0u32.encode(&mut buf)?; // reserved
    Ok(buf)
}

fn extend_list<'i>(
    buf: &mut Vec<u8>,
    names: impl Iterator<Item = &'i str>,
) -> Result<(), Error> {
    let list = names.collect::<Vec<_>>().join(",");
    list.as_str().encode(buf)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn client_preference_wins() {
        // Our list is [curve25519-sha256, dh-group14-sha256]; the server
        // prefers them the other way around. We pick our first.
        let ours = [kex::CURVE25519, kex::DH_G14_SHA256];
        let theirs = vec![
            "diffie-hellman-group14-sha256".to_string(),
            "curve25519-sha256".to_string(),
        ];
        let (both_first, chosen) = select(&ours, &theirs, AlgorithmKind::Kex).unwrap();
        assert_eq!(chosen, kex::CURVE25519);
        assert!(!both_first);
    }

    #[test]
    fn no_overlap_fails() {
        let ours = [kex::CURVE25519];
        let theirs = vec!["diffie-hellman-group1-sha1".to_string()];
        assert!(matches!(
            select(&ours, &theirs, AlgorithmKind::Kex),
            Err(Error::NoCommonAlgo { .. })
        ));
    }

    #[test]
    fn kexinit_roundtrips_through_read_kex() {
        let payload = write_kexinit(&Preferred::DEFAULT).unwrap();
        assert_eq!(payload.first(), Some(&msg::KEXINIT));
        // Parse our own proposal as if a server with identical preferences
        // had sent it.
        let names = read_kex(&payload, &Preferred::DEFAULT).unwrap();
        assert_eq!(names.kex, kex::CURVE25519);
        assert_eq!(names.client_cipher, cipher::CHACHA20_POLY1305);
        assert_eq!(names.server_cipher, cipher::CHACHA20_POLY1305);
        assert!(!names.ignore_guessed);
    }
}

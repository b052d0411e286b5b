//! Host keys and client identities enter this crate as `ssh-key` values;
//! this module only adds what the wire needs on top: wire-blob parsing
//! and RSA signature-hash selection.

use std::sync::Arc;

use ssh_key::private::KeypairData;
use ssh_key::{Algorithm, HashAlg, PrivateKey, PublicKey, Signature};

use crate::Error;

/// Parse a wire-encoded public key blob (the `K_S` field of the kex
/// reply, or a `publickey` auth field).
pub fn parse_public_key(blob: &[u8]) -> Result<PublicKey, Error> {
    Ok(PublicKey::from_bytes(blob)?)
}

/// A client identity plus the negotiated RSA signature hash. For
/// non-RSA keys the hash is always `None`; for RSA keys it is chosen
/// from the server's `server-sig-algs` (RFC 8308).
#[derive(Clone, Debug)]
pub struct PrivateKeyWithHashAlg {
    key: Arc<PrivateKey>,
    hash_alg: Option<HashAlg>,
}

impl PrivateKeyWithHashAlg {
    pub fn new(key: Arc<PrivateKey>, hash_alg: Option<HashAlg>) -> Self {
        Self { key, hash_alg }
    }

    /// The algorithm name that goes on the wire, `rsa-sha2-*` when a
    /// hash was negotiated.
    pub fn algorithm(&self) -> Algorithm {
        match self.key.algorithm() {
            Algorithm::Rsa { .. } => Algorithm::Rsa {
                hash: self.hash_alg,
            },
            other => other,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }

    pub(crate) fn hash_alg(&self) -> Option<HashAlg> {
        self.hash_alg
    }

    pub(crate) fn set_hash_alg(&mut self, hash_alg: Option<HashAlg>) {
        self.hash_alg = hash_alg;
    }

    pub(crate) fn sign(&self, data: &[u8]) -> Result<Signature, Error> {
        Ok(match self.key.key_data() {
            KeypairData::Rsa(rsa_keypair) => {
                // ssh-key does not produce SHA-1 signatures; an
                // unnegotiated hash falls back to SHA-512.
                let hash = self.hash_alg.unwrap_or(HashAlg::Sha512);
                signature::Signer::try_sign(&(rsa_keypair, hash), data)?
            }
            keypair => signature::Signer::try_sign(keypair, data)?,
        })
    }
}

/// Pick the strongest RSA hash the server advertised via EXT_INFO
/// `server-sig-algs`. Without the extension, `rsa-sha2-256` is assumed;
/// every server this library can sign for understands it.
pub(crate) fn best_rsa_hash(server_sig_algs: Option<&[String]>) -> Option<HashAlg> {
    match server_sig_algs {
        Some(algs) if algs.iter().any(|a| a == "rsa-sha2-512") => Some(HashAlg::Sha512),
        _ => Some(HashAlg::Sha256),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn rsa_hash_selection_prefers_sha512() {
        let algs = vec![
            "ssh-ed25519".to_string(),
            "rsa-sha2-256".to_string(),
            "rsa-sha2-512".to_string(),
        ];
        assert_eq!(best_rsa_hash(Some(&algs)), Some(HashAlg::Sha512));
        let algs = vec!["rsa-sha2-256".to_string()];
        assert_eq!(best_rsa_hash(Some(&algs)), Some(HashAlg::Sha256));
        assert_eq!(best_rsa_hash(None), Some(HashAlg::Sha256));
    }
}

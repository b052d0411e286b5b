use std::marker::PhantomData;

use digest::Digest;
use elliptic_curve::ecdh::{EphemeralSecret, SharedSecret as EcSharedSecret};
use elliptic_curve::point::PointCompression;
use elliptic_curve::sec1::{FromEncodedPoint, ModulusSize, ToEncodedPoint};
use elliptic_curve::{AffinePoint, Curve, CurveArithmetic, FieldBytesSize};
use p256::NistP256;
use p384::NistP384;
use p521::NistP521;
use sha2::{Sha256, Sha384, Sha512};
use ssh_encoding::Encode;

use super::{compute_keys, KexAlgorithm, KexType, SharedSecret};
use crate::session::Exchange;
use crate::wire::encode_mpint;
use crate::{cipher, mac, msg, Error};

pub struct EcdhNistP256KexType {}

impl KexType for EcdhNistP256KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(EcdhNistPKex::<NistP256, Sha256> {
            local_secret: None,
            shared_secret: None,
            _digest: PhantomData,
        }) as Box<dyn KexAlgorithm + Send>
    }
}

pub struct EcdhNistP384KexType {}

impl KexType for EcdhNistP384KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(EcdhNistPKex::<NistP384, Sha384> {
            local_secret: None,
            shared_secret: None,
            _digest: PhantomData,
        }) as Box<dyn KexAlgorithm + Send>
    }
}

pub struct EcdhNistP521KexType {}

impl KexType for EcdhNistP521KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(EcdhNistPKex::<NistP521, Sha512> {
            local_secret: None,
            shared_secret: None,
            _digest: PhantomData,
        }) as Box<dyn KexAlgorithm + Send>
    }
}

pub struct EcdhNistPKex<C: Curve + CurveArithmetic, D: Digest> {
    local_secret: Option<EphemeralSecret<C>>,
    shared_secret: Option<EcSharedSecret<C>>,
    _digest: PhantomData<D>,
}

impl<C: Curve + CurveArithmetic, D: Digest> std::fmt::Debug for EcdhNistPKex<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

impl<C: Curve + CurveArithmetic + Send, D: Digest + Send> KexAlgorithm for EcdhNistPKex<C, D>
where
    C: PointCompression,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
    EphemeralSecret<C>: Send,
    EcSharedSecret<C>: Send,
{
    fn client_dh(
        &mut self,
        client_ephemeral: &mut Vec<u8>,
        writer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let client_secret = EphemeralSecret::<C>::random(&mut rand_core::OsRng);
        let client_pubkey = client_secret.public_key();

        // fill exchange.
        client_ephemeral.clear();
        client_ephemeral.extend_from_slice(&client_pubkey.to_sec1_bytes());

        msg::KEX_ECDH_INIT.encode(writer)?;
        client_pubkey.to_sec1_bytes().as_ref().encode(writer)?;

        self.local_secret = Some(client_secret);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey_: &[u8]) -> Result<(), Error> {
        let local_secret = self.local_secret.take().ok_or(Error::KexInit)?;
        let remote_pubkey = elliptic_curve::PublicKey::<C>::from_sec1_bytes(remote_pubkey_)
            .map_err(|_| Error::BadDhParameters)?;
        self.shared_secret = Some(local_secret.diffie_hellman(&remote_pubkey));
        Ok(())
    }

    fn compute_exchange_hash(
        &self,
        key: &[u8],
        exchange: &Exchange,
        buffer: &mut Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        // Computing the exchange hash, see page 7 of RFC 5656.
        buffer.clear();
        exchange.client_id.as_slice().encode(buffer)?;
        exchange.server_id.as_slice().encode(buffer)?;
        exchange.client_kex_init.as_slice().encode(buffer)?;
        exchange.server_kex_init.as_slice().encode(buffer)?;

        buffer.extend_from_slice(key);
        exchange.client_ephemeral.as_slice().encode(buffer)?;
        exchange.server_ephemeral.as_slice().encode(buffer)?;

        if let Some(ref shared) = self.shared_secret {
            encode_mpint(shared.raw_secret_bytes(), buffer)?;
        }

        Ok(D::digest(buffer.as_slice()).to_vec())
    }

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        client_cipher: cipher::Name,
        server_cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
    ) -> Result<cipher::CipherPair, Error> {
        let shared_secret = self
            .shared_secret
            .as_ref()
            .map(|x| SharedSecret::from_mpint(x.raw_secret_bytes()))
            .transpose()?;

        compute_keys::<D>(
            shared_secret.as_ref(),
            session_id,
            exchange_hash,
            client_cipher,
            server_cipher,
            remote_to_local_mac,
            local_to_remote_mac,
        )
    }
}

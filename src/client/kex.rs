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

use log::{debug, error, warn};
use signature::Verifier;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Mpint, Signature};

use crate::cipher::SealingKey;
use crate::client::{Config, Handler};
use crate::kex::dh::groups::DhGroup;
use crate::kex::KEXES;
use crate::key::parse_public_key;
use crate::session::{Kex, KexDhDone, KexInit, NewKeys};
use crate::sshbuffer::SSHBuffer;
use crate::{msg, negotiation, Error};

impl KexInit {
    /// Send our KEXINIT, capturing it verbatim for the exchange hash.
    pub fn client_write(
        &mut self,
        config: &Config,
        cipher: &mut dyn SealingKey,
        write_buffer: &mut SSHBuffer,
    ) -> Result<(), Error> {
        self.exchange.client_kex_init = negotiation::write_kexinit(&config.preferred)?;
        self.sent = true;
        cipher.write(&self.exchange.client_kex_init, write_buffer);
        Ok(())
    }

    /// The server's KEXINIT arrived: negotiate, then start the chosen
    /// exchange (DH init, or the group request for group exchange).
    pub fn client_parse(
        mut self,
        config: &Config,
        cipher: &mut dyn SealingKey,
        buf: &[u8],
        write_buffer: &mut SSHBuffer,
    ) -> Result<Kex, Error> {
        let names = if let Some(names) = self.algo.take() {
            names
        } else {
            if buf.first() != Some(&msg::KEXINIT) {
                return Err(Error::KexInit);
            }
            self.exchange.server_kex_init = buf.to_vec();
            negotiation::read_kex(buf, &config.preferred)?
        };

        if !self.sent {
            self.client_write(config, cipher, write_buffer)?
        }

        let mut kex = KEXES.get(&names.kex).ok_or(Error::UnknownAlgo)?.make();

        let mut init = Vec::new();
        if kex.is_dh_gex() {
            kex.client_dh_gex_init(&config.gex, &mut init)?;
            cipher.write(&init, write_buffer);
            Ok(Kex::GexGroup(KexDhDone {
                exchange: self.exchange,
                names,
                kex,
                session_id: self.session_id,
            }))
        } else {
            kex.client_dh(&mut self.exchange.client_ephemeral, &mut init)?;
            cipher.write(&init, write_buffer);
            Ok(Kex::DhDone(KexDhDone {
                exchange: self.exchange,
                names,
                kex,
                session_id: self.session_id,
            }))
        }
    }
}

impl KexDhDone {
    /// Group exchange only: the server proposed a group; validate it and
    /// send our DH init.
    pub fn client_gex_group(
        mut self,
        config: &Config,
        cipher: &mut dyn SealingKey,
        buf: &[u8],
        write_buffer: &mut SSHBuffer,
    ) -> Result<Kex, Error> {
        if buf.first() != Some(&msg::KEX_DH_GEX_GROUP) {
            error!("Unexpected kex message at this stage: {:?}", buf.first());
            return Err(Error::KexInit);
        }

        let mut r = buf.get(1..).ok_or(Error::Inconsistent)?;
        let r = &mut r;
        let prime = Mpint::decode(r)?;
        let generator = Mpint::decode(r)?;

        let group = DhGroup {
            prime: prime.as_bytes().to_vec().into(),
            generator: generator.as_bytes().to_vec().into(),
        };

        if group.bit_size() < config.gex.min_group_size()
            || group.bit_size() > config.gex.max_group_size()
        {
            warn!(
                "DH prime size ({} bits) not within requested range",
                group.bit_size()
            );
            return Err(Error::BadDhParameters);
        }

        self.exchange.gex = Some((config.gex.clone(), group.clone()));
        self.kex.dh_gex_set_group(group)?;

        let mut init = Vec::new();
        self.kex
            .client_dh(&mut self.exchange.client_ephemeral, &mut init)?;
        cipher.write(&init, write_buffer);

        Ok(Kex::DhDone(self))
    }

    /// The message number carrying the server's reply for this exchange.
    pub fn expected_reply(&self) -> u8 {
        if self.kex.is_dh_gex() {
            msg::KEX_DH_GEX_REPLY
        } else {
            msg::KEX_ECDH_REPLY
        }
    }

    /// The server's DH reply: check the host key against the policy (on
    /// the first exchange only), verify its signature over the exchange
    /// hash, and derive the new keys.
    pub async fn server_key_check<H: Handler>(
        mut self,
        rekey: bool,
        handler: &mut H,
        buf: &[u8],
    ) -> Result<NewKeys, H::Error> {
        let mut r = buf.get(1..).ok_or(Error::Inconsistent).map_err(Error::from)?;
        let r = &mut r;

        let server_host_key = Vec::<u8>::decode(r).map_err(Error::from)?; // server public key.
        let pubkey = parse_public_key(&server_host_key)?;
        debug!("server_public_key: {:?}", pubkey.to_openssh().ok());

        if !rekey {
            let check = handler.check_server_key(&pubkey).await?;
            if !check {
                return Err(Error::UnknownKey.into());
            }
        }

        let server_ephemeral = Vec::<u8>::decode(r).map_err(Error::from)?;
        self.exchange.server_ephemeral = server_ephemeral;
        let signature = Vec::<u8>::decode(r).map_err(Error::from)?;

        self.kex
            .compute_shared_secret(&self.exchange.server_ephemeral)?;

        let mut pubkey_blob = Vec::new();
        server_host_key
            .as_slice()
            .encode(&mut pubkey_blob)
            .map_err(Error::from)?;

        let hash = {
            let mut buffer = Vec::new();
            self.kex
                .compute_exchange_hash(&pubkey_blob, &self.exchange, &mut buffer)?
        };

        let signature = Signature::decode(&mut signature.as_slice()).map_err(Error::from)?;
        if let Err(e) = Verifier::verify(&pubkey, hash.as_slice(), &signature) {
            debug!("wrong server sig: {e:?}");
            return Err(Error::WrongServerSig.into());
        }

        Ok(self.compute_keys(hash)?)
    }
}

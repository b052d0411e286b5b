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

use async_trait::async_trait;
use bitflags::bitflags;
use ssh_encoding::Decode;

use crate::key::PrivateKeyWithHashAlg;
use crate::wire::NameList;
use crate::Error;

bitflags! {
    /// Set of authentication methods, represented by bit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `hostbased` method (certain hostnames are allowed by
        /// the server).
        const HOSTBASED = 8;
        /// The SSH `keyboard-interactive` method (answer to a challenge,
        /// where the "challenge" can be a password prompt, a bytestring
        /// to sign with a smartcard, or something else).
        const KEYBOARD_INTERACTIVE = 16;
    }
}

impl From<MethodSet> for &'static str {
    fn from(value: MethodSet) -> Self {
        match value {
            MethodSet::NONE => "none",
            MethodSet::PASSWORD => "password",
            MethodSet::PUBLICKEY => "publickey",
            MethodSet::HOSTBASED => "hostbased",
            MethodSet::KEYBOARD_INTERACTIVE => "keyboard-interactive",
            _ => "",
        }
    }
}

impl MethodSet {
    pub(crate) fn from_method_name(name: &str) -> Option<MethodSet> {
        match name {
            "none" => Some(MethodSet::NONE),
            "password" => Some(MethodSet::PASSWORD),
            "publickey" => Some(MethodSet::PUBLICKEY),
            "hostbased" => Some(MethodSet::HOSTBASED),
            "keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
            _ => None,
        }
    }

    /// The comma-separated rendering used on the wire. Names come out in
    /// canonical flag order, not the order the server advertised; the
    /// allowed-methods list is a set, its order carries no meaning.
    pub fn as_name_list(&self) -> String {
        NameList(
            self.iter()
                .map(|m| <&'static str>::from(m).to_string())
                .collect(),
        )
        .as_encoded_string()
    }
}

/// An authentication method, chosen by the consumer per attempt.
#[derive(Debug)]
pub enum Method {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: PrivateKeyWithHashAlg,
    },
    /// Public key whose signature is produced elsewhere (an agent, a
    /// hardware token) through the [`Signer`] trait.
    FuturePublicKey {
        key: ssh_key::PublicKey,
    },
    KeyboardInteractive {
        submethods: String,
    },
}

/// External signature producers (SSH agents, HSMs). The data to sign is
/// the session-id-prefixed authentication blob; the returned bytes are
/// the wire-encoded signature.
#[async_trait]
pub trait Signer: Sized + Send {
    type Error: From<crate::Error> + Send;

    async fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        to_sign: Vec<u8>,
    ) -> Result<Vec<u8>, Self::Error>;
}

/// The outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    /// The server refused this attempt. `remaining_methods` is the
    /// server's name-list of methods that can continue;
    /// `partial_success` means the attempt itself was accepted but more
    /// methods are required.
    Failure {
        remaining_methods: MethodSet,
        partial_success: bool,
    },
    /// Password authentication was accepted, but the password has
    /// expired; a new one must be set with another password round.
    ChangePassword {
        prompt: String,
    },
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }
}

/// State of the dialog while the server has our USERAUTH_REQUEST.
#[derive(Debug)]
pub(crate) struct AuthRequest {
    pub methods: MethodSet,
    pub partial_success: bool,
    pub current: Option<CurrentRequest>,
}

#[derive(Debug)]
pub(crate) enum CurrentRequest {
    PublicKey {
        sent_pk_ok: bool,
    },
    KeyboardInteractive {
        #[allow(dead_code)]
        submethods: String,
    },
}

/// Parse the body of a USERAUTH_FAILURE message (after the message
/// number): the allowed-methods name-list and the partial-success flag.
pub(crate) fn parse_userauth_failure(mut r: &[u8]) -> Result<(MethodSet, bool), Error> {
    let r = &mut r;
    let list = NameList::decode(r)?;
    let partial_success = u8::decode(r)? != 0;
    let mut methods = MethodSet::empty();
    for name in &list.0 {
        if let Some(m) = MethodSet::from_method_name(name) {
            methods |= m;
        }
    }
    Ok((methods, partial_success))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn userauth_failure_carries_methods_and_partial_success() {
        // name-list "publickey,password", partial_success = true
        let mut body = Vec::new();
        body.extend_from_slice(&(b"publickey,password".len() as u32).to_be_bytes());
        body.extend_from_slice(b"publickey,password");
        body.push(1);

        let (methods, partial) = parse_userauth_failure(&body).unwrap();
        assert_eq!(methods, MethodSet::PUBLICKEY | MethodSet::PASSWORD);
        assert!(partial);
        // Rendering is in canonical flag order, not the server's order.
        assert_eq!(methods.as_name_list(), "password,publickey");
    }

    #[test]
    fn unknown_methods_are_ignored() {
        let mut body = Vec::new();
        body.extend_from_slice(&(b"gssapi-with-mic,password".len() as u32).to_be_bytes());
        body.extend_from_slice(b"gssapi-with-mic,password");
        body.push(0);

        let (methods, partial) = parse_userauth_failure(&body).unwrap();
        assert_eq!(methods, MethodSet::PASSWORD);
        assert!(!partial);
    }
}

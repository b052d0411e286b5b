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

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]

//! Asynchronous SSH 2.0 client library, based on tokio/futures.
//!
//! A session is driven by a background event-loop task owning the socket.
//! Consumers obtain a [`client::Handle`] from [`client::connect`], implement
//! [`client::Handler`] for unsolicited events (host-key checks, incoming
//! data), authenticate, and then open *channels* — the multiplexed streams
//! the SSH connection protocol runs over. A typical exchange:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use halyard::{client, ChannelMsg};
//!
//! struct Client;
//!
//! #[async_trait]
//! impl client::Handler for Client {
//!     type Error = halyard::Error;
//!
//!     async fn check_server_key(
//!         &mut self,
//!         _key: &ssh_key::PublicKey,
//!     ) -> Result<bool, Self::Error> {
//!         Ok(true) // consult known_hosts here
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), halyard::Error> {
//!     let config = Arc::new(client::Config::default());
//!     let mut session = client::connect(config, ("localhost", 22), Client).await?;
//!     let auth = session.authenticate_password("user", "secret").await?;
//!     assert!(auth.success());
//!     let mut channel = session.channel_open_session().await?;
//!     channel.exec(true, "echo hello").await?;
//!     while let Some(msg) = channel.wait().await {
//!         if let ChannelMsg::Data { data } = msg {
//!             print!("{}", String::from_utf8_lossy(&data));
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The transport (binary packet protocol, key exchange, rekeying) and the
//! authentication dialog are handled behind the scenes. Writes from
//! multiple producers are serialized by the event loop, so the byte stream
//! is always a concatenation of complete packets; channel writes beyond
//! the peer's window are queued and flushed as WINDOW_ADJUST credit
//! arrives.

use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

use ssh_encoding::{Decode, Encode};
use thiserror::Error;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        use byteorder::{BigEndian, ByteOrder};
        let i0 = $buffer.len();
        $buffer.extend_from_slice(b"\0\0\0\0");
        let x = $x;
        let i1 = $buffer.len();
        #[allow(clippy::indexing_slicing)] // room was just reserved
        BigEndian::write_u32(&mut $buffer[i0..], (i1 - i0 - 4) as u32);
        x
    }};
}

mod auth;
pub mod cipher;
pub mod compression;
pub mod kex;
mod key;
pub mod mac;
mod msg;
mod negotiation;
mod parsing;
mod session;
mod ssh_read;
mod sshbuffer;
mod wire;

#[cfg(test)]
mod tests;

pub use auth::{AuthResult, Method, MethodSet, Signer};
pub use key::{parse_public_key, PrivateKeyWithHashAlg};
pub use negotiation::{Names, Preferred};
pub use sshbuffer::SshId;
pub use wire::NameList;

mod channels;
pub use channels::{Channel, ChannelMsg};

/// Client side of this library.
pub mod client;

/// The algorithm family a negotiation failure refers to.
#[derive(Debug)]
pub enum AlgorithmKind {
    Kex,
    Key,
    Cipher,
    Compression,
    Mac,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Unknown algorithm name after negotiation.
    #[error("Unknown algorithm")]
    UnknownAlgo,

    /// No common algorithm found during key exchange.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Invalid SSH version string.
    #[error("Invalid SSH version string")]
    Version,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// Failed to decrypt an AEAD packet.
    #[error("Failed to decrypt a packet")]
    DecryptionError,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The peer rejected one of our packets.
    #[error("Peer sent UNIMPLEMENTED for our packet #{0}")]
    Unimplemented(u32),

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Truncated or malformed wire data.
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] ssh_encoding::Error),

    /// Index out of bounds while parsing.
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// The server key was rejected by the verification policy.
    #[error("Unknown server key")]
    UnknownKey,

    /// The server provided a wrong signature over the exchange hash.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// Diffie-Hellman parameters outside the accepted range.
    #[error("Rejected Diffie-Hellman parameters")]
    BadDhParameters,

    /// Excessive or inconsistent packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// Message received/sent on a channel we don't know about.
    #[error("Channel not open")]
    WrongChannel,

    /// Server refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// Disconnected locally.
    #[error("Disconnected")]
    Disconnect,

    /// The peer sent DISCONNECT.
    #[error("Disconnected by the remote side: {reason:?} ({description})")]
    Disconnected {
        reason: Disconnect,
        description: String,
    },

    /// Connection closed by the remote side without DISCONNECT.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Keepalive timeout.
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    /// Inactivity timeout.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    /// All configured authentication methods were exhausted.
    #[error("No authentication method left")]
    NoAuthMethod,

    /// Could not reach the session event loop.
    #[error("Channel send error")]
    SendError,

    /// The event loop went away while we were waiting for a reply.
    #[error("Unable to receive more messages from the session")]
    RecvError,

    /// Pending buffer limit reached during rekey.
    #[error("Pending buffer limit reached")]
    Pending,

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Compress(#[from] flate2::CompressError),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Decompress(#[from] flate2::DecompressError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

/// The number of bytes and packets written, and the time elapsed, before a
/// key re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_packet_limit: u32,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the byte bounds cannot lead to
    /// nonce reuse.
    pub fn new(
        write_limit: usize,
        read_limit: usize,
        packet_limit: u32,
        time_limit: std::time::Duration,
    ) -> Limits {
        assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30);
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_packet_limit: packet_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 GiB
            rekey_read_limit: 1 << 30,
            rekey_packet_limit: 1 << 31,
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection, RFC 4253 §11.1.
#[allow(missing_docs)] // self-explanatory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// The type of signals that can be sent to a remote process. If you plan
/// to use custom signals, read
/// [the RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }
    fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

/// The identifier of a channel, unique on our side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ChannelId(pub(crate) u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

use ssh_encoding::{Decode, Encode, Reader};

use crate::{msg, Error};

#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    pub fn parse<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            recipient_channel: u32::decode(r)?,
            sender_channel: u32::decode(r)?,
            initial_window_size: u32::decode(r)?,
            maximum_packet_size: u32::decode(r)?,
        })
    }
}

/// A server-initiated CHANNEL_OPEN,
/// https://tools.ietf.org/html/rfc4254#section-5.1
#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub typ: ChannelType,
    pub recipient_channel: u32,
    pub recipient_window_size: u32,
    pub recipient_maximum_packet_size: u32,
}

impl OpenChannelMessage {
    pub fn parse<R: Reader>(r: &mut R) -> Result<Self, Error> {
        let typ = String::decode(r)?;
        let sender = u32::decode(r)?;
        let window = u32::decode(r)?;
        let maxpacket = u32::decode(r)?;

        let typ = match typ.as_str() {
            "session" => ChannelType::Session,
            "x11" => {
                let originator_address = String::decode(r)?;
                let originator_port = u32::decode(r)?;
                ChannelType::X11 {
                    originator_address,
                    originator_port,
                }
            }
            "forwarded-tcpip" => ChannelType::ForwardedTcpIp(TcpChannelInfo::decode(r)?),
            _ => ChannelType::Unknown { typ },
        };

        Ok(Self {
            typ,
            recipient_channel: sender,
            recipient_window_size: window,
            recipient_maximum_packet_size: maxpacket,
        })
    }

    /// Push a confirmation that this channel was opened.
    pub fn confirm(
        &self,
        buffer: &mut Vec<u8>,
        sender_channel: u32,
        window_size: u32,
        packet_size: u32,
    ) -> Result<(), Error> {
        push_packet!(buffer, {
            msg::CHANNEL_OPEN_CONFIRMATION.encode(buffer)?;
            self.recipient_channel.encode(buffer)?; // remote channel number.
            sender_channel.encode(buffer)?; // our channel number.
            window_size.encode(buffer)?;
            packet_size.encode(buffer)?;
        });
        Ok(())
    }

    /// Push a failure message.
    pub fn fail(&self, buffer: &mut Vec<u8>, reason: u8, message: &[u8]) -> Result<(), Error> {
        push_packet!(buffer, {
            msg::CHANNEL_OPEN_FAILURE.encode(buffer)?;
            self.recipient_channel.encode(buffer)?;
            (reason as u32).encode(buffer)?;
            message.encode(buffer)?;
            "en".encode(buffer)?;
        });
        Ok(())
    }

    /// Push an unknown-type refusal.
    pub fn unknown_type(&self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        self.fail(
            buffer,
            msg::SSH_OPEN_UNKNOWN_CHANNEL_TYPE,
            b"Unknown channel type",
        )
    }
}

#[derive(Debug)]
pub(crate) enum ChannelType {
    Session,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    ForwardedTcpIp(TcpChannelInfo),
    Unknown {
        typ: String,
    },
}

#[derive(Debug)]
pub(crate) struct TcpChannelInfo {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl Decode for TcpChannelInfo {
    type Error = ssh_encoding::Error;

    fn decode(r: &mut impl Reader) -> Result<Self, Self::Error> {
        let host_to_connect = String::decode(r)?;
        let port_to_connect = u32::decode(r)?;
        let originator_address = String::decode(r)?;
        let originator_port = u32::decode(r)?;
        Ok(Self {
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        })
    }
}

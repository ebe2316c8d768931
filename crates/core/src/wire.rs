//! Tunnel header codec
//!
//! Every Echo payload exchanged between client and relay starts with a
//! five byte header: a four byte magic tag naming the sender's role followed
//! by a one byte packet type. Fields are read and written at fixed offsets
//! after the frame length has been checked.

use std::fmt;

use crate::{EchotunError, Result};

/// Size of the tunnel header on the wire
pub const HEADER_SIZE: usize = 5;

const MAGIC_LEN: usize = 4;
const TYPE_OFFSET: usize = 4;

/// Four byte role tag at the start of every tunnel frame
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Magic([u8; MAGIC_LEN]);

/// Tag carried by frames a client sends to the relay
pub const CLIENT_MAGIC: Magic = Magic(*b"hanc");

/// Tag carried by frames the relay sends to a client
pub const SERVER_MAGIC: Magic = Magic(*b"hans");

impl Magic {
    pub const fn new(bytes: [u8; MAGIC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAGIC_LEN] {
        &self.0
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            // all bytes are ASCII, so this cannot fail
            f.write_str(std::str::from_utf8(&self.0).unwrap_or_default())
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Magic({})", self)
    }
}

/// Message kind carried in the tunnel header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    ResetConnection,
    ConnectionRequest,
    Challenge,
    ChallengeResponse,
    ConnectionAccept,
    ChallengeError,
    Data,
    Poll,
    ServerFull,
    DataSeq,
    Nack,
    /// A type byte no message is defined for, kept as received
    Unknown(u8),
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::ResetConnection => 1,
            Self::ConnectionRequest => 2,
            Self::Challenge => 3,
            Self::ChallengeResponse => 4,
            Self::ConnectionAccept => 5,
            Self::ChallengeError => 6,
            Self::Data => 7,
            Self::Poll => 8,
            Self::ServerFull => 9,
            Self::DataSeq => 10,
            Self::Nack => 11,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::ResetConnection,
            2 => Self::ConnectionRequest,
            3 => Self::Challenge,
            4 => Self::ChallengeResponse,
            5 => Self::ConnectionAccept,
            6 => Self::ChallengeError,
            7 => Self::Data,
            8 => Self::Poll,
            9 => Self::ServerFull,
            10 => Self::DataSeq,
            11 => Self::Nack,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded tunnel header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub magic: Magic,
    pub packet_type: PacketType,
}

impl WireHeader {
    pub fn new(magic: Magic, packet_type: PacketType) -> Self {
        Self { magic, packet_type }
    }

    /// Split a frame into its header and the remaining payload.
    ///
    /// Fails only with `TooShort`. Unrecognised type bytes decode as
    /// [`PacketType::Unknown`].
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8])> {
        if frame.len() < HEADER_SIZE {
            return Err(EchotunError::TooShort {
                required: HEADER_SIZE,
                available: frame.len(),
            });
        }

        let mut magic = [0u8; MAGIC_LEN];
        magic.copy_from_slice(&frame[..MAGIC_LEN]);
        let packet_type = PacketType::from(frame[TYPE_OFFSET]);

        Ok((Self::new(Magic(magic), packet_type), &frame[HEADER_SIZE..]))
    }

    /// Write the header into the first `HEADER_SIZE` bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE {
            return Err(EchotunError::TooShort {
                required: HEADER_SIZE,
                available: buf.len(),
            });
        }
        buf[..MAGIC_LEN].copy_from_slice(&self.magic.0);
        buf[TYPE_OFFSET] = self.packet_type.as_u8();
        Ok(())
    }

    /// Prefix `payload` with this header
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&self.magic.0);
        frame.push(self.packet_type.as_u8());
        frame.extend_from_slice(payload);
        frame
    }
}

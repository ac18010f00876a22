//! Wire format. One record per datagram.
//!
//! ```text
//! 0x01 ClientHello  [type][u16 identity_len][identity][noise msg 1]
//! 0x02 ServerHello  [type][noise msg 2]
//! 0x15 Alert        [type][level][description]
//! 0x17 Data         [type][u64 sequence][ciphertext]
//! ```
//!
//! Integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sealgram_core::{AlertDescription, AlertLevel};
use thiserror::Error;

/// Record type byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    ClientHello = 0x01,
    ServerHello = 0x02,
    Alert = 0x15,
    Data = 0x17,
}

impl TryFrom<u8> for RecordType {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ClientHello),
            0x02 => Ok(Self::ServerHello),
            0x15 => Ok(Self::Alert),
            0x17 => Ok(Self::Data),
            other => Err(RecordError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("empty record")]
    Empty,

    #[error("unknown record type {0:#04x}")]
    UnknownType(u8),

    #[error("truncated {0:?} record")]
    Truncated(RecordType),

    #[error("identity too long: {0} bytes")]
    IdentityTooLong(usize),

    #[error("invalid alert level {0}")]
    AlertLevel(u8),

    #[error("invalid alert description {0}")]
    AlertDescription(u8),
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    ClientHello { identity: Bytes, noise: Bytes },
    ServerHello { noise: Bytes },
    Alert { level: AlertLevel, description: AlertDescription },
    Data { seq: u64, ciphertext: Bytes },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::ClientHello { .. } => RecordType::ClientHello,
            Self::ServerHello { .. } => RecordType::ServerHello,
            Self::Alert { .. } => RecordType::Alert,
            Self::Data { .. } => RecordType::Data,
        }
    }

    pub fn encode(&self) -> Result<Bytes, RecordError> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.record_type() as u8);
        match self {
            Self::ClientHello { identity, noise } => {
                let len = u16::try_from(identity.len())
                    .map_err(|_| RecordError::IdentityTooLong(identity.len()))?;
                buf.reserve(2 + identity.len() + noise.len());
                buf.put_u16(len);
                buf.put_slice(identity);
                buf.put_slice(noise);
            }
            Self::ServerHello { noise } => buf.put_slice(noise),
            Self::Alert { level, description } => {
                buf.put_u8(*level as u8);
                buf.put_u8(*description as u8);
            }
            Self::Data { seq, ciphertext } => {
                buf.reserve(8 + ciphertext.len());
                buf.put_u64(*seq);
                buf.put_slice(ciphertext);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        let mut buf = Bytes::copy_from_slice(data);
        if !buf.has_remaining() {
            return Err(RecordError::Empty);
        }
        let kind = RecordType::try_from(buf.get_u8())?;

        match kind {
            RecordType::ClientHello => {
                if buf.remaining() < 2 {
                    return Err(RecordError::Truncated(kind));
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Err(RecordError::Truncated(kind));
                }
                let identity = buf.split_to(len);
                Ok(Self::ClientHello {
                    identity,
                    noise: buf,
                })
            }
            RecordType::ServerHello => Ok(Self::ServerHello { noise: buf }),
            RecordType::Alert => {
                if buf.remaining() < 2 {
                    return Err(RecordError::Truncated(kind));
                }
                let level = buf.get_u8();
                let description = buf.get_u8();
                Ok(Self::Alert {
                    level: AlertLevel::try_from(level).map_err(RecordError::AlertLevel)?,
                    description: AlertDescription::try_from(description)
                        .map_err(RecordError::AlertDescription)?,
                })
            }
            RecordType::Data => {
                if buf.remaining() < 8 {
                    return Err(RecordError::Truncated(kind));
                }
                let seq = buf.get_u64();
                Ok(Self::Data {
                    seq,
                    ciphertext: buf,
                })
            }
        }
    }
}

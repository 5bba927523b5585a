//! Message and acknowledgement envelopes carried inside chunks.
//!
//! ```text
//! Message: | 0x10 | corr_id (16B) | u32 name_len | name | body ... |
//! Ack:     | 0x11 | corr_id (16B) | u8 success |
//! ```
//!
//! `name_len` follows the configured byte order. The body is whatever the
//! message type's [`Message::pack`] wrote.

use crate::codec::{PackConfig, PackReader, PackWriter};
use crate::error::WireError;
use crate::registry::{Message, TypeRegistry};
use bytes::Bytes;
use uuid::Uuid;

/// Envelope discriminator, first byte of every chunk payload
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Application or handshake message
    Message = 0x10,
    /// Acknowledgement of a message
    Ack = 0x11,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::Message),
            0x11 => Ok(Self::Ack),
            other => Err(WireError::Opcode(other)),
        }
    }
}

/// Decoded chunk payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A message whose body has not been decoded yet
    Message {
        /// Correlation id echoed by the acknowledgement
        corr_id: Uuid,
        /// Wire type name
        type_name: String,
        /// Packed message fields
        body: Bytes,
    },
    /// Positive or negative acknowledgement
    Ack {
        /// Correlation id of the acknowledged message
        corr_id: Uuid,
        /// Whether the receiver accepted the message
        success: bool,
    },
}

impl Envelope {
    /// Encode a message envelope; fails if the message type is not mapped
    pub fn encode_message(
        corr_id: Uuid,
        message: &dyn Message,
        registry: &TypeRegistry,
        config: PackConfig,
    ) -> Result<Bytes, WireError> {
        let name = registry.name_for(message)?;
        let mut writer = PackWriter::new(config);
        writer.put_u8(Opcode::Message as u8);
        writer.put_uuid(&corr_id);
        writer.put_str(name)?;
        message.pack(&mut writer)?;
        Ok(writer.into_bytes())
    }

    /// Encode an acknowledgement envelope
    pub fn encode_ack(corr_id: Uuid, success: bool, config: PackConfig) -> Bytes {
        let mut writer = PackWriter::new(config);
        writer.put_u8(Opcode::Ack as u8);
        writer.put_uuid(&corr_id);
        writer.put_bool(success);
        writer.into_bytes()
    }

    /// Parse a chunk payload
    pub fn decode(payload: Bytes, config: PackConfig) -> Result<Self, WireError> {
        let mut reader = PackReader::new(payload, config);
        match Opcode::try_from(reader.get_u8()?)? {
            Opcode::Message => {
                let corr_id = reader.get_uuid()?;
                let type_name = reader.get_str()?;
                Ok(Self::Message {
                    corr_id,
                    type_name,
                    body: reader.rest(),
                })
            }
            Opcode::Ack => {
                let corr_id = reader.get_uuid()?;
                let success = reader.get_bool()?;
                Ok(Self::Ack { corr_id, success })
            }
        }
    }

    /// Correlation id of either variant
    pub fn corr_id(&self) -> Uuid {
        match self {
            Self::Message { corr_id, .. } | Self::Ack { corr_id, .. } => *corr_id,
        }
    }
}

//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Not enough bytes left to read a field
    #[error("truncated: need {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field requires
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown envelope opcode
    #[error("unknown opcode {0:#04x}")]
    Opcode(u8),

    /// String field is not valid UTF-8
    #[error("string field is not valid utf-8")]
    Utf8,

    /// Incoming type name has no registered type
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// Outgoing message type has no registered name
    #[error("message type {0} is not mapped")]
    Unmapped(&'static str),

    /// Name or type already present in the registry
    #[error("'{0}' is already mapped")]
    AlreadyMapped(String),

    /// Message-specific field validation failed
    #[error("invalid field: {0}")]
    Invalid(String),

    /// Underlying stream failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

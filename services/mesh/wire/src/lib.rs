//! Wire protocol framing, field packing, envelopes and the type registry for mesh.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------+
//! | u32 LE chunk_len     | length of bytes that follow      |
//! +----------------------+----------------------------------+
//! | u8 opcode            | 0x10 message, 0x11 ack           |
//! +----------------------+----------------------------------+
//! | corr_id (16B)        | correlation id                   |
//! +----------------------+----------------------------------+
//! | message: name + body | ack: u8 success                  |
//! +----------------------+----------------------------------+
//! ```
//!
//! Integers inside the payload use the configured [`ByteOrder`]; the chunk
//! length prefix is always little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod registry;

// Re-export main types
pub use codec::{ByteOrder, PackConfig, PackReader, PackWriter};
pub use envelope::{Envelope, Opcode};
pub use error::WireError;
pub use frame::{
    encode_chunk, read_chunk, write_chunk, ChunkDecoder, CHUNK_PREFIX_SIZE, DEFAULT_MAX_CHUNK_SIZE,
};
pub use registry::{AsAny, Message, TypeRegistry, Unpack};

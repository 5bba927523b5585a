//! Field packing for message bodies.
//!
//! Message bodies are written field by field through [`PackWriter`] and read
//! back through [`PackReader`]. Every multi-byte integer honours the
//! configured [`ByteOrder`]; only the outer chunk length prefix is fixed to
//! little-endian (see [`crate::frame`]).
//!
//! Variable-length fields (strings, byte blobs) carry a `u32` length prefix
//! in the configured byte order. Timestamps are stored as signed
//! milliseconds relative to the reference epoch of the [`PackConfig`].

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Byte order applied to packed integer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

/// Settings shared by both ends of a connection that affect field encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackConfig {
    /// Integer byte order
    pub byte_order: ByteOrder,
    /// Reference point for timestamp fields
    pub epoch: DateTime<Utc>,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Little,
            epoch: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

macro_rules! put_int {
    ($name:ident, $ty:ty, $le:ident, $be:ident) => {
        #[doc = concat!("Write a `", stringify!($ty), "` in the configured byte order")]
        pub fn $name(&mut self, value: $ty) {
            match self.config.byte_order {
                ByteOrder::Little => self.buf.$le(value),
                ByteOrder::Big => self.buf.$be(value),
            }
        }
    };
}

macro_rules! get_int {
    ($name:ident, $ty:ty, $le:ident, $be:ident) => {
        #[doc = concat!("Read a `", stringify!($ty), "` in the configured byte order")]
        pub fn $name(&mut self) -> Result<$ty, WireError> {
            self.need(std::mem::size_of::<$ty>())?;
            Ok(match self.config.byte_order {
                ByteOrder::Little => self.buf.$le(),
                ByteOrder::Big => self.buf.$be(),
            })
        }
    };
}

/// Writer for packed message fields
#[derive(Debug)]
pub struct PackWriter {
    buf: BytesMut,
    config: PackConfig,
}

impl PackWriter {
    /// Create an empty writer
    pub fn new(config: PackConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            config,
        }
    }

    /// Encoding settings in effect
    pub fn config(&self) -> PackConfig {
        self.config
    }

    /// Write a single byte
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Write a boolean as one byte (0 or 1)
    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    put_int!(put_u16, u16, put_u16_le, put_u16);
    put_int!(put_u32, u32, put_u32_le, put_u32);
    put_int!(put_u64, u64, put_u64_le, put_u64);
    put_int!(put_i32, i32, put_i32_le, put_i32);
    put_int!(put_i64, i64, put_i64_le, put_i64);
    put_int!(put_f64, f64, put_f64_le, put_f64);

    /// Write raw bytes with no length prefix
    pub fn put_fixed(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a length-prefixed byte blob
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::Size(bytes.len()))?;
        self.put_u32(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string
    pub fn put_str(&mut self, value: &str) -> Result<(), WireError> {
        self.put_bytes(value.as_bytes())
    }

    /// Write a 16-byte UUID
    pub fn put_uuid(&mut self, value: &Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    /// Write a timestamp as milliseconds since the reference epoch
    pub fn put_time(&mut self, value: DateTime<Utc>) {
        let millis = value
            .signed_duration_since(self.config.epoch)
            .num_milliseconds();
        self.put_i64(millis);
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and take the buffer
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reader for packed message fields
#[derive(Debug)]
pub struct PackReader {
    buf: Bytes,
    config: PackConfig,
}

impl PackReader {
    /// Create a reader over a message body
    pub fn new(buf: Bytes, config: PackConfig) -> Self {
        Self { buf, config }
    }

    /// Encoding settings in effect
    pub fn config(&self) -> PackConfig {
        self.config
    }

    fn need(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read a single byte
    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a one-byte boolean; any non-zero value is `true`
    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.get_u8()? != 0)
    }

    get_int!(get_u16, u16, get_u16_le, get_u16);
    get_int!(get_u32, u32, get_u32_le, get_u32);
    get_int!(get_u64, u64, get_u64_le, get_u64);
    get_int!(get_i32, i32, get_i32_le, get_i32);
    get_int!(get_i64, i64, get_i64_le, get_i64);
    get_int!(get_f64, f64, get_f64_le, get_f64);

    /// Read `len` raw bytes
    pub fn get_fixed(&mut self, len: usize) -> Result<Bytes, WireError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a fixed-size byte array
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a length-prefixed byte blob
    pub fn get_bytes(&mut self) -> Result<Bytes, WireError> {
        let len = self.get_u32()? as usize;
        self.get_fixed(len)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_str(&mut self) -> Result<String, WireError> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
    }

    /// Read a 16-byte UUID
    pub fn get_uuid(&mut self) -> Result<Uuid, WireError> {
        Ok(Uuid::from_bytes(self.get_array::<16>()?))
    }

    /// Read a timestamp stored as milliseconds since the reference epoch
    pub fn get_time(&mut self) -> Result<DateTime<Utc>, WireError> {
        let millis = self.get_i64()?;
        self.config
            .epoch
            .checked_add_signed(ChronoDuration::milliseconds(millis))
            .ok_or_else(|| WireError::Invalid(format!("timestamp offset {millis}ms out of range")))
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Take everything that has not been consumed
    pub fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }
}

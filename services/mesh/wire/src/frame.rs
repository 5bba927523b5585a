//! Length-prefixed chunk framing.
//!
//! Every chunk on a stream is a 4-byte little-endian payload length followed
//! by exactly that many payload bytes. The prefix is always little-endian,
//! independent of the byte order configured for packed fields.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the chunk prefix
pub const CHUNK_PREFIX_SIZE: usize = 4;

/// Default largest payload accepted in a single chunk (16 MiB)
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Prefix a payload with its length
pub fn encode_chunk(payload: &[u8]) -> Result<Bytes, WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::Size(payload.len()))?;
    let mut buf = BytesMut::with_capacity(CHUNK_PREFIX_SIZE + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one chunk and flush.
///
/// Prefix and payload are written as a single buffer so a chunk is never
/// interleaved with another writer's bytes at this layer.
pub async fn write_chunk<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let chunk = encode_chunk(payload)?;
    writer.write_all(&chunk).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one chunk.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new prefix.
/// A stream that ends inside a chunk is reported as an I/O error.
pub async fn read_chunk<R>(reader: &mut R, max_chunk_size: usize) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; CHUNK_PREFIX_SIZE];
    let mut filled = 0;
    while filled < CHUNK_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_chunk_size {
        return Err(WireError::Size(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Incremental decoder for chunks arriving in arbitrary pieces
#[derive(Debug)]
pub struct ChunkDecoder {
    max_chunk_size: usize,
}

impl ChunkDecoder {
    /// Create a decoder with the given payload limit
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }

    /// Take one complete chunk from the front of `buf`, if present
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if buf.len() < CHUNK_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_chunk_size {
            return Err(WireError::Size(len));
        }

        if buf.len() < CHUNK_PREFIX_SIZE + len {
            return Ok(None);
        }

        buf.advance(CHUNK_PREFIX_SIZE);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_little_endian() {
        let chunk = encode_chunk(b"abc").unwrap();
        assert_eq!(&chunk[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decoder_waits_for_complete_chunk() {
        let mut decoder = ChunkDecoder::default();
        let chunk = encode_chunk(b"hello").unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&chunk[..3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&chunk[3..6]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&chunk[6..]);
        buf.extend_from_slice(&encode_chunk(b"").unwrap());
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversized() {
        let mut decoder = ChunkDecoder::new(4);
        let mut buf = BytesMut::from(&encode_chunk(b"too long").unwrap()[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(8))));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_chunk(&mut client, b"first").await.unwrap();
            write_chunk(&mut client, &[7u8; 100]).await.unwrap();
        });

        let first = read_chunk(&mut server, DEFAULT_MAX_CHUNK_SIZE).await.unwrap();
        assert_eq!(&first.unwrap()[..], b"first");
        let second = read_chunk(&mut server, DEFAULT_MAX_CHUNK_SIZE).await.unwrap();
        assert_eq!(second.unwrap().len(), 100);
        writer.await.unwrap();
        assert!(read_chunk(&mut server, DEFAULT_MAX_CHUNK_SIZE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_mid_chunk() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_chunk(&mut server, DEFAULT_MAX_CHUNK_SIZE).await,
            Err(WireError::Io(_))
        ));
    }
}

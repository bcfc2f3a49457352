//! Length-prefixed framing over async byte streams.
//!
//! Each payload is written as an unsigned LEB128 varint length
//! followed by the payload bytes, the same convention the libp2p
//! ecosystem uses for single-message protocols. A frame larger than
//! the caller's limit is refused before its body is allocated.

use std::io;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writes one frame and flushes the writer.
///
/// # Errors
///
/// Returns any I/O error raised by the underlying writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(payload.len(), &mut len_buf);

    writer.write_all(prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads exactly one frame.
///
/// # Errors
///
/// - [`io::ErrorKind::InvalidData`] if the length prefix is not a
///   valid varint or exceeds `max_len`.
/// - [`io::ErrorKind::UnexpectedEof`] if the stream ends mid-frame.
/// - Any other I/O error raised by the underlying reader.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = unsigned_varint::aio::read_usize(&mut *reader)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

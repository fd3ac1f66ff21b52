//! Length-delimited frame I/O over byte streams.
//!
//! A frame is a `u32` little-endian length followed by that many payload
//! bytes, assembled and written as one buffer so each write is one frame.
//! The ACK token travels raw (unframed) in the reverse direction; readers
//! accept any bytes as the ACK.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::names::ACK_TOKEN;

/// Upper bound on an accepted frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame (length prefix + payload) and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one frame.  Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}

/// Write the ACK token.
pub async fn write_ack<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ACK_TOKEN).await?;
    writer.flush().await
}

/// Wait for ACK bytes.  Any non-empty read counts; EOF is an error.
pub async fn read_ack<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 16];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before ACK",
        ));
    }
    Ok(())
}

//! Length-prefixed frames: 4-byte big-endian length, then the payload.
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::transport_error;

pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(transport_error!("Failed to read length prefix: {}", e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(transport_error!("Frame too large: {} bytes", len));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| transport_error!("Failed to read frame: {}", e))?;
    Ok(Some(Bytes::from(buf)))
}

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(transport_error!("Frame too large: {} bytes", data.len()));
    }
    let len = data.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| transport_error!("Failed to write length prefix: {}", e))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| transport_error!("Failed to write frame: {}", e))?;
    stream
        .flush()
        .await
        .map_err(|e| transport_error!("Failed to flush frame: {}", e))?;
    Ok(())
}

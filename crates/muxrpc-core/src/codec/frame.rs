//! Length-prefixed framing.
//!
//! Wire format: `[4-byte length as u32 big-endian] + [payload]`. The frame
//! layer is codec-agnostic; payload bytes come from a [`Codec`](super::Codec).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{MuxError, Result};

/// Maximum frame payload size (16 MB). Guards against allocating absurd
/// buffers from a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed frame and flushes the stream.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(MuxError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads one length-prefixed frame.
///
/// A clean EOF before the length prefix maps to
/// [`MuxError::ConnectionClosed`]; an oversized length prefix fails without
/// allocating.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(MuxError::ConnectionClosed);
        }
        return Err(e.into());
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MuxError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"hello frames").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"hello frames");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, b"").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let bogus = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, MuxError::FrameTooLarge(_, _)));
    }

    #[tokio::test]
    async fn test_eof_maps_to_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed));
    }
}

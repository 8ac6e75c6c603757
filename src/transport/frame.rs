use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

type PayloadLen = u32;

/// Reads length-delimited frames off a byte stream.
#[async_trait]
pub trait FrameRead {
    /// Returns `None` on a clean EOF at a frame boundary.
    async fn read_frame(&mut self) -> Option<Result<Vec<u8>, Error>>;
}

/// Writes length-delimited frames onto a byte stream.
///
/// Does not flush; callers flush once a logical message is complete.
#[async_trait]
pub trait FrameWrite {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error>;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameRead for R {
    async fn read_frame(&mut self) -> Option<Result<Vec<u8>, Error>> {
        let mut len_buf = [0u8; 4];
        if let Err(err) = self.read_exact(&mut len_buf).await {
            // EOF between frames is the normal end of a connection.
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return None;
            }
            return Some(Err(err.into()));
        }
        let len = PayloadLen::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if let Err(err) = self.read_exact(&mut payload).await {
            return Some(Err(err.into()));
        }
        Some(Ok(payload))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWrite for W {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > PayloadLen::MAX as usize {
            return Err(Error::Internal(format!(
                "frame payload exceeds maximum, max is {}, found {}",
                PayloadLen::MAX,
                payload.len()
            )));
        }

        self.write_all(&(payload.len() as PayloadLen).to_be_bytes())
            .await?;
        self.write_all(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        a.write_frame(b"hello frame").await.unwrap();
        a.flush().await.unwrap();

        let payload = b.read_frame().await.unwrap().unwrap();
        assert_eq!(payload, b"hello frame");
    }

    #[tokio::test]
    async fn empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_frame(b"").await.unwrap();
        a.flush().await.unwrap();

        let payload = b.read_frame().await.unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        assert!(b.read_frame().await.is_none());
    }
}

// Frame writer over the write half of a connection.
use anyhow::{Context, Result};
use bytes::BytesMut;
use pylon_wire::Frame;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encodes frames into a reusable scratch buffer and writes them in one call,
/// so a frame is always handed to the socket whole.
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        frame.encode_into(&mut self.scratch)?;
        self.inner
            .write_all(&self.scratch)
            .await
            .context("write frame")?;
        self.inner.flush().await.context("flush frame")
    }

    /// Write bytes that already hold one or more complete encoded frames.
    pub async fn write_encoded(&mut self, encoded: &[u8]) -> Result<()> {
        self.inner
            .write_all(encoded)
            .await
            .context("write encoded frame")?;
        self.inner.flush().await.context("flush frame")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.context("shutdown write half")
    }
}

// Stream reader: pulls whole frames off the read half of a connection.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use pylon_wire::{Frame, MessageType, check_payload_len, topic_from_bytes};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Outcome of one [`FrameReader::read_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Frame(Frame),
    /// No frame started within the read timeout. Liveness signal, not an error.
    TimedOut,
    /// The peer closed the stream cleanly between frames.
    Closed,
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_payload_bytes: usize,
    scratch: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_payload_bytes,
            scratch: BytesMut::new(),
        }
    }

    /// Read the next frame.
    ///
    /// `read_timeout` bounds the wait for the first byte of a frame only; once a
    /// frame has started the rest is read to completion. EOF before the first byte
    /// is a clean close, EOF inside a frame is an error.
    pub async fn read_frame(&mut self, read_timeout: Option<Duration>) -> Result<ReadEvent> {
        let first = match read_timeout {
            Some(limit) if !limit.is_zero() => {
                match tokio::time::timeout(limit, self.inner.read_u8()).await {
                    Ok(result) => result,
                    Err(_) => return Ok(ReadEvent::TimedOut),
                }
            }
            _ => self.inner.read_u8().await,
        };
        let first = match first {
            Ok(byte) => byte,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(ReadEvent::Closed),
            Err(err) => return Err(err).context("read message type"),
        };
        let message_type = MessageType::try_from(first)?;

        let request_id = if message_type.has_request_id() {
            self.read_u32().await.context("read request id")?
        } else {
            0
        };
        let topic = if message_type.has_topic() {
            self.read_string().await.context("read topic")?
        } else {
            String::new()
        };
        let payload = if message_type.has_payload() {
            self.read_blob().await.context("read payload")?
        } else {
            Bytes::new()
        };
        Ok(ReadEvent::Frame(Frame::from_parts(
            message_type,
            request_id,
            topic,
            payload,
        )))
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8().await?)
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32().await?)
    }

    /// u8 length prefix followed by UTF-8 bytes.
    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.inner.read_u8().await? as usize;
        let mut bytes = [0u8; pylon_wire::MAX_TOPIC_LEN];
        self.inner.read_exact(&mut bytes[..len]).await?;
        Ok(topic_from_bytes(&bytes[..len])?)
    }

    /// u32 length prefix followed by that many bytes, bounded by the payload cap.
    pub async fn read_blob(&mut self) -> Result<Bytes> {
        let len = self.inner.read_u32().await? as usize;
        check_payload_len(len, self.max_payload_bytes)?;
        self.scratch.clear();
        self.scratch.resize(len, 0u8);
        self.inner.read_exact(&mut self.scratch[..]).await?;
        Ok(self.scratch.split().freeze())
    }
}

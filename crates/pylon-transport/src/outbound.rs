// Outbound serializer: the single task that owns a connection's write half.
//
// Every write (data, heartbeats, control frames, replies) goes through one bounded
// queue and is written by one task, strictly in submission order.
use crate::writer::FrameWriter;
use anyhow::Result;
use bytes::Bytes;
use pylon_wire::Frame;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

enum Command {
    Frame(Frame),
    Encoded(Bytes),
    Close,
}

/// Cloneable handle to a connection's writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Command>,
    failed: watch::Receiver<bool>,
}

impl Outbound {
    /// Spawn the writer task. The join handle resolves with the first write error,
    /// or `Ok` once a close request has drained the queue and shut the socket down.
    pub fn spawn<W>(writer: FrameWriter<W>, queue_depth: usize) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (failed_tx, failed) = watch::channel(false);
        let handle = tokio::spawn(run_writer(writer, rx, failed_tx));
        (Self { tx, failed }, handle)
    }

    /// Enqueue without waiting; a full queue drops the frame.
    pub fn try_send(&self, frame: Frame) -> Result<(), SendError> {
        self.try_push(Command::Frame(frame))
    }

    /// Enqueue bytes holding a complete encoded frame. Lets a broadcast encode once
    /// and share the buffer across sessions.
    pub fn try_send_encoded(&self, encoded: Bytes) -> Result<(), SendError> {
        self.try_push(Command::Encoded(encoded))
    }

    /// Enqueue, waiting for queue capacity.
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx
            .send(Command::Frame(frame))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Ask the writer to flush everything queued so far, then shut the write half
    /// down. Frames queued after this call are rejected.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close).await;
    }

    /// Resolves once a write has failed. Never resolves for a healthy writer.
    pub async fn failed(&self) {
        let mut failed = self.failed.clone();
        let signalled = failed.wait_for(|failed| *failed).await.is_ok();
        if !signalled {
            // Writer finished without failing.
            std::future::pending::<()>().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn try_push(&self, command: Command) -> Result<(), SendError> {
        self.tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<Command>,
    failed: watch::Sender<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Frame(frame) => writer.write_frame(&frame).await,
            Command::Encoded(encoded) => writer.write_encoded(&encoded).await,
            Command::Close => break,
        };
        if let Err(err) = result {
            let _ = failed.send(true);
            return Err(err);
        }
    }
    rx.close();
    // Peer may already be gone; nothing useful to report at this point.
    if let Err(err) = writer.shutdown().await {
        tracing::debug!(error = %err, "outbound shutdown failed");
    }
    Ok(())
}

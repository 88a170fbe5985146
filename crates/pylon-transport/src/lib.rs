// TCP transport configuration and primitives.
use anyhow::{Context, Result};
use pylon_wire::DEFAULT_MAX_PAYLOAD_BYTES;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

pub mod outbound;
pub mod reader;
pub mod writer;

pub use outbound::{Outbound, SendError};
pub use reader::{FrameReader, ReadEvent};
pub use writer::FrameWriter;

/// Transport-level configuration defaults.
///
/// ```
/// use pylon_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_payload_bytes > 0);
/// assert!(config.nodelay);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_payload_bytes: usize,
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Process-unique connection identifier used for tracing/logging.
///
/// ```
/// use pylon_transport::ConnectionId;
///
/// let id = ConnectionId(7);
/// assert_eq!(id.to_string(), "conn-7");
/// ```
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
/// Metadata about a live TCP connection.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// TCP listener wrapper producing framed connections.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    transport: TransportConfig,
}

impl TcpServer {
    pub async fn bind(addr: impl ToSocketAddrs, transport: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind TCP listener")?;
        Ok(Self {
            listener,
            transport,
        })
    }

    pub async fn accept(&self) -> Result<Connection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context("accept TCP connection")?;
        Connection::from_stream(stream, &self.transport)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("read TCP local address")
    }
}

/// Open a framed connection to `addr`.
pub async fn connect(addr: impl ToSocketAddrs, transport: &TransportConfig) -> Result<Connection> {
    let stream = TcpStream::connect(addr)
        .await
        .context("establish TCP connection")?;
    Connection::from_stream(stream, transport)
}

/// One TCP socket, ready to be split into its reader and writer halves.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    info: ConnectionInfo,
    max_payload_bytes: usize,
}

impl Connection {
    pub fn from_stream(stream: TcpStream, transport: &TransportConfig) -> Result<Self> {
        if transport.nodelay {
            stream.set_nodelay(true).context("set TCP_NODELAY")?;
        }
        let info = ConnectionInfo {
            id: ConnectionId::next(),
            peer_addr: stream.peer_addr().context("read peer address")?,
            local_addr: stream.local_addr().context("read local address")?,
        };
        Ok(Self {
            stream,
            info,
            max_payload_bytes: transport.max_payload_bytes,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Split into independently owned halves; the reader and writer can live on
    /// different tasks.
    pub fn split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let (read, write) = self.stream.into_split();
        (
            FrameReader::new(read, self.max_payload_bytes),
            FrameWriter::new(write),
        )
    }
}

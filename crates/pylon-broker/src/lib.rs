// Server side of the pylon bus: accepts connections, runs one session per
// connection and keeps the process-wide registry used for fan-out.
//
// Each session has exactly one writer (its `Outbound` task) and one reader loop.
// The reader loop is the only place that declares a session gone: when it ends,
// for whatever reason, the session leaves the registry and `SessionClosed` is
// emitted once.
use pylon_common::ids::{RequestId, SessionId};

pub mod acceptor;
pub mod config;
pub mod events;
pub mod registry;
pub mod session;

pub use acceptor::Acceptor;
pub use config::BrokerConfig;
pub use events::ServerEvent;
pub use registry::SessionRegistry;
pub use session::{ReplyHandle, ServerSession};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("request {0} was already replied to")]
    AlreadyReplied(RequestId),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("session closed: {0}")]
    SessionClosed(SessionId),
    #[error("outbound queue full for session {0}")]
    QueueFull(SessionId),
    #[error(transparent)]
    Wire(#[from] pylon_wire::Error),
    #[error(transparent)]
    Codec(#[from] pylon_wire::CodecError),
}

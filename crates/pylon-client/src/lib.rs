// Client for the pylon pub/sub bus.
//
// CLIENT-SIDE DESIGN
// ------------------
// A TCP write half is a single-writer resource. Rather than guarding it with a
// lock, each session runs one actor task that owns the write half and executes
// every write (publish, request, subscribe control, heartbeat, logout) in the
// order it was submitted. Application threads only encode and enqueue.
//
// The reader task for a connection dispatches inbound frames to subscriber and
// reply callbacks. Anything that changes connection state (a read failure, a
// server logout) is posted back to the actor rather than acted on in place.
//
// Publishes and requests are best-effort: a frame that reaches the actor while
// the session is disconnected is dropped, not buffered for the next connection.
pub mod client;
pub mod config;

pub use client::{ClientSession, ClientStats, SessionEvent, SessionState, Subscription};
pub use config::ClientConfig;
pub use pylon_common::ids::RequestId;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("topic {0} is already subscribed")]
    AlreadySubscribed(String),
    #[error("session is closed")]
    Closed,
    #[error("session was already closed")]
    AlreadyClosed,
    #[error("request {0} timed out")]
    RequestTimedOut(RequestId),
    #[error(transparent)]
    Wire(#[from] pylon_wire::Error),
    #[error(transparent)]
    Codec(#[from] pylon_wire::CodecError),
}

#[cfg(test)]
mod tests;

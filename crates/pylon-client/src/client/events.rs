// Lifecycle events, session state and counters.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// Notifications delivered to handlers registered with
/// [`ClientSession::on_event`](crate::ClientSession::on_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { peer: SocketAddr },
    ConnectFailed { error: String },
    /// `expected` is true when the connection ended through `close()` or a clean
    /// logout from the server, false for I/O failures and protocol violations.
    Disconnected { expected: bool },
    Heartbeat,
    ReadTimeout,
    Closed,
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub reconnects_scheduled: u64,
    pub disconnects: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub dropped_while_disconnected: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) connects: AtomicU64,
    pub(crate) connect_failures: AtomicU64,
    pub(crate) reconnects_scheduled: AtomicU64,
    pub(crate) disconnects: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) dropped_while_disconnected: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClientStats {
        ClientStats {
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            dropped_while_disconnected: self.dropped_while_disconnected.load(Ordering::Relaxed),
        }
    }
}

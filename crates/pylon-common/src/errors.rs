//! Error-handler collaborator shared by client and broker.
//!
//! Network tasks never propagate failures across task boundaries. Every error
//! raised on a reader, writer or accept loop is funneled into a single
//! [`ErrorHandler`] so the application decides what to do with it; the default
//! handler logs and moves on.
use std::fmt;
use std::sync::Arc;

/// Where a reported error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    Connect,
    Read,
    Write,
    Protocol,
    Codec,
    Accept,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::Connect => "connect",
            ErrorOrigin::Read => "read",
            ErrorOrigin::Write => "write",
            ErrorOrigin::Protocol => "protocol",
            ErrorOrigin::Codec => "codec",
            ErrorOrigin::Accept => "accept",
        }
    }
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every error raised on a network task.
///
/// ```
/// use pylon_common::{ErrorHandler, ErrorOrigin};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let seen = AtomicUsize::new(0);
/// let handler = |_origin: ErrorOrigin, _err: &anyhow::Error| {
///     seen.fetch_add(1, Ordering::Relaxed);
/// };
/// handler.handle_error(ErrorOrigin::Read, &anyhow::anyhow!("reset"));
/// assert_eq!(seen.load(Ordering::Relaxed), 1);
/// ```
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, origin: ErrorOrigin, error: &anyhow::Error);
}

impl<F> ErrorHandler for F
where
    F: Fn(ErrorOrigin, &anyhow::Error) + Send + Sync,
{
    fn handle_error(&self, origin: ErrorOrigin, error: &anyhow::Error) {
        self(origin, error)
    }
}

/// Default handler: log and continue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle_error(&self, origin: ErrorOrigin, error: &anyhow::Error) {
        tracing::warn!(origin = %origin, error = %format!("{error:#}"), "network error");
    }
}

pub fn default_error_handler() -> Arc<dyn ErrorHandler> {
    Arc::new(LogErrorHandler)
}

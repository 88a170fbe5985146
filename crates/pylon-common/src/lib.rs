// Shared data types and small helpers used across crates.
pub mod errors;
pub mod listeners;

pub use errors::{ErrorHandler, ErrorOrigin, LogErrorHandler, default_error_handler};
pub use listeners::{ListenerGuard, Listeners};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub mod ids {
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    /// Random identity the acceptor assigns to each accepted connection.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct SessionId(Uuid);

    impl SessionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SessionId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for SessionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(&self.0, f)
        }
    }

    impl FromStr for SessionId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            Uuid::parse_str(input)
                .map(Self)
                .map_err(|_| Error::InvalidId(input.into()))
        }
    }

    /// Correlates a request frame with its reply; allocated per client session.
    pub type RequestId = u32;
}

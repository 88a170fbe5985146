// Client session, subscriptions, request correlation and lifecycle events.
mod correlator;
pub mod events;
mod session;
mod subscription;

pub use events::{ClientStats, SessionEvent, SessionState};
pub use session::ClientSession;
pub use subscription::Subscription;

use pylon_common::ids::SessionId;
use pylon_wire::PayloadCodec;
use std::sync::Arc;

use crate::session::{ReplyHandle, ServerSession};

/// Everything the broker tells application logic about its sessions.
///
/// Handlers run on the session's reader task (or the acceptor task for
/// `SessionOpened`), so they must not block.
pub enum ServerEvent<C: PayloadCodec> {
    SessionOpened {
        session: Arc<ServerSession>,
    },
    Subscribed {
        session: Arc<ServerSession>,
        topic: String,
    },
    Unsubscribed {
        session: Arc<ServerSession>,
        topic: String,
    },
    Logout {
        session: Arc<ServerSession>,
    },
    Message {
        session: Arc<ServerSession>,
        topic: String,
        message: C::Message,
    },
    Request {
        session: Arc<ServerSession>,
        topic: String,
        message: C::Message,
        reply: ReplyHandle<C>,
    },
    Heartbeat {
        session: Arc<ServerSession>,
    },
    ReadTimeout {
        session: Arc<ServerSession>,
    },
    SessionClosed {
        session: Arc<ServerSession>,
    },
}

impl<C: PayloadCodec> ServerEvent<C> {
    pub fn session(&self) -> &Arc<ServerSession> {
        match self {
            ServerEvent::SessionOpened { session }
            | ServerEvent::Subscribed { session, .. }
            | ServerEvent::Unsubscribed { session, .. }
            | ServerEvent::Logout { session }
            | ServerEvent::Message { session, .. }
            | ServerEvent::Request { session, .. }
            | ServerEvent::Heartbeat { session }
            | ServerEvent::ReadTimeout { session }
            | ServerEvent::SessionClosed { session } => session,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session().id()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionOpened { .. } => "session_opened",
            ServerEvent::Subscribed { .. } => "subscribed",
            ServerEvent::Unsubscribed { .. } => "unsubscribed",
            ServerEvent::Logout { .. } => "logout",
            ServerEvent::Message { .. } => "message",
            ServerEvent::Request { .. } => "request",
            ServerEvent::Heartbeat { .. } => "heartbeat",
            ServerEvent::ReadTimeout { .. } => "read_timeout",
            ServerEvent::SessionClosed { .. } => "session_closed",
        }
    }
}

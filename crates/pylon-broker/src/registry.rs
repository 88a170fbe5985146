// Process-wide session registry.
//
// Writers (session open/close) take the map lock and republish an immutable
// snapshot; broadcast reads the snapshot without locking, so a fan-out never
// contends with sessions coming and going.
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use pylon_common::ids::SessionId;
use pylon_common::{ErrorHandler, ErrorOrigin, ListenerGuard, Listeners, default_error_handler};
use pylon_transport::SendError;
use pylon_wire::{Frame, PayloadCodec};
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::ServerEvent;
use crate::session::ServerSession;
use crate::{BrokerError, Result};

pub struct SessionRegistry<C: PayloadCodec> {
    codec: Arc<C>,
    sessions: RwLock<HashMap<SessionId, Arc<ServerSession>>>,
    snapshot: ArcSwap<Vec<Arc<ServerSession>>>,
    listeners: Listeners<ServerEvent<C>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl<C: PayloadCodec> SessionRegistry<C> {
    pub fn new(codec: C) -> Arc<Self> {
        Self::with_error_handler(codec, default_error_handler())
    }

    pub fn with_error_handler(codec: C, error_handler: Arc<dyn ErrorHandler>) -> Arc<Self> {
        Arc::new(Self {
            codec: Arc::new(codec),
            sessions: RwLock::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            listeners: Listeners::new(),
            error_handler,
        })
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Register a handler for every session event. Dropping the guard removes it.
    pub fn on_event<F>(&self, handler: F) -> ListenerGuard
    where
        F: Fn(&ServerEvent<C>) + Send + Sync + 'static,
    {
        self.listeners.register(handler)
    }

    /// Send `message` on `topic` to every session currently subscribed to it.
    ///
    /// The frame is encoded once and shared. A session whose queue is full
    /// misses this message; the others are unaffected. Returns how many sessions
    /// had the frame queued.
    pub fn publish_to_all_subscribed_clients(&self, topic: &str, message: &C::Message) -> Result<usize> {
        let payload = self.codec.encode(message)?;
        let encoded = Frame::Data {
            topic: topic.to_string(),
            payload,
        }
        .encode()?;

        let sessions = self.snapshot.load();
        let mut delivered = 0;
        for session in sessions.iter().filter(|session| session.is_subscribed(topic)) {
            match session.send_encoded(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::Full) => {
                    metrics::counter!("pylon_broker_broadcast_dropped_total").increment(1);
                    tracing::warn!(
                        session_id = %session.id(),
                        topic = %topic,
                        "outbound queue full; dropping broadcast"
                    );
                }
                Err(SendError::Closed) => {
                    tracing::debug!(session_id = %session.id(), topic = %topic, "session closing; skipping broadcast");
                }
            }
        }
        Ok(delivered)
    }

    /// Send `message` on `topic` to one session, subscribed or not.
    pub fn publish_to_session(&self, session_id: SessionId, topic: &str, message: &C::Message) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or(BrokerError::SessionNotFound(session_id))?;
        let payload = self.codec.encode(message)?;
        session.send(Frame::Data {
            topic: topic.to_string(),
            payload,
        })
    }

    /// Ask a session to close. Returns false if it is not registered.
    pub fn disconnect(&self, session_id: SessionId) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<ServerSession>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.snapshot.load().iter().map(|session| session.id()).collect()
    }

    pub fn subscribers_of(&self, topic: &str) -> Vec<SessionId> {
        self.snapshot
            .load()
            .iter()
            .filter(|session| session.is_subscribed(topic))
            .map(|session| session.id())
            .collect()
    }

    pub(crate) fn insert(&self, session: Arc<ServerSession>) {
        {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id(), Arc::clone(&session));
            self.rebuild_snapshot(&sessions);
        }
        metrics::counter!("pylon_broker_sessions_opened_total").increment(1);
        self.emit(&ServerEvent::SessionOpened { session });
    }

    /// Drop a session and announce it. A session already removed is ignored, so
    /// `SessionClosed` fires at most once per session.
    pub(crate) fn remove(&self, session: &Arc<ServerSession>) {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(&session.id());
            if removed.is_some() {
                self.rebuild_snapshot(&sessions);
            }
            removed
        };
        if let Some(session) = removed {
            metrics::counter!("pylon_broker_sessions_closed_total").increment(1);
            self.emit(&ServerEvent::SessionClosed { session });
        }
    }

    pub(crate) fn emit(&self, event: &ServerEvent<C>) {
        self.listeners.emit(event);
    }

    pub(crate) fn report(&self, origin: ErrorOrigin, error: &anyhow::Error) {
        if origin == ErrorOrigin::Protocol {
            metrics::counter!("pylon_broker_protocol_errors_total").increment(1);
        }
        self.error_handler.handle_error(origin, error);
    }

    fn rebuild_snapshot(&self, sessions: &HashMap<SessionId, Arc<ServerSession>>) {
        let snapshot: Vec<_> = sessions.values().cloned().collect();
        metrics::gauge!("pylon_broker_sessions_active").set(snapshot.len() as f64);
        self.snapshot.store(Arc::new(snapshot));
    }
}

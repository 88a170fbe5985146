// Client subscription table and the RAII subscription handle.
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::session::Command;
use crate::ClientError;

pub(crate) type Callback<M> = Arc<dyn Fn(M) + Send + Sync>;

pub(crate) struct Registration<M> {
    pub(crate) id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<M>,
}

impl<M> Registration<M> {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deliver unless the registration was disposed in the meantime.
    pub(crate) fn deliver(&self, message: M) {
        if self.is_active() {
            (self.callback)(message);
        }
    }
}

/// topic -> the single local registration for that topic.
pub(crate) struct SubscriptionTable<M> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<String, Arc<Registration<M>>>>,
}

impl<M> SubscriptionTable<M> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `callback` for `topic`. An inactive leftover whose removal is
    /// still queued is replaced; an active registration is never replaced.
    pub(crate) fn insert(
        &self,
        topic: &str,
        callback: Callback<M>,
    ) -> Result<(u64, Arc<AtomicBool>), ClientError> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(topic)
            && existing.is_active()
        {
            return Err(ClientError::AlreadySubscribed(topic.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        entries.insert(
            topic.to_string(),
            Arc::new(Registration {
                id,
                active: Arc::clone(&active),
                callback,
            }),
        );
        Ok((id, active))
    }

    pub(crate) fn get_active(&self, topic: &str) -> Option<Arc<Registration<M>>> {
        self.entries
            .read()
            .get(topic)
            .filter(|registration| registration.is_active())
            .cloned()
    }

    /// Remove `topic` only if it still maps to registration `id`.
    pub(crate) fn remove_if(&self, topic: &str, id: u64) -> bool {
        let mut entries = self.entries.write();
        match entries.get(topic) {
            Some(registration) if registration.id == id => {
                entries.remove(topic);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn active_topics(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, registration)| registration.is_active())
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

/// Handle for one topic subscription. Dropping it, or calling
/// [`Subscription::unsubscribe`], stops local delivery at once and queues the
/// Unsubscribe frame.
#[must_use = "dropping the subscription unsubscribes"]
pub struct Subscription {
    topic: String,
    id: u64,
    active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        id: u64,
        active: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            topic,
            id,
            active,
            commands,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn dispose(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Unsubscribe {
                topic: std::mem::take(&mut self.topic),
                registration: self.id,
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

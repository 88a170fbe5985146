// Typed observer registry: register(handler) -> guard, emit(event).
use parking_lot::Mutex;
use slab::Slab;
use std::sync::{Arc, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of event handlers.
///
/// Handlers run on whichever task emits the event, so they should be quick and
/// must not block. Emission snapshots the handler list and calls each handler
/// outside the lock, which lets a handler register or dispose other handlers.
///
/// ```
/// use pylon_common::Listeners;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let listeners = Listeners::<u32>::new();
/// let total = Arc::new(AtomicUsize::new(0));
/// let guard = {
///     let total = Arc::clone(&total);
///     listeners.register(move |value| {
///         total.fetch_add(*value as usize, Ordering::Relaxed);
///     })
/// };
/// listeners.emit(&3);
/// guard.dispose();
/// listeners.emit(&4);
/// assert_eq!(total.load(Ordering::Relaxed), 3);
/// ```
pub struct Listeners<E> {
    handlers: Arc<Mutex<Slab<Handler<E>>>>,
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Slab::new())),
        }
    }

    pub fn register<F>(&self, handler: F) -> ListenerGuard
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let key = self.handlers.lock().insert(Arc::new(handler));
        let handlers: Weak<Mutex<Slab<Handler<E>>>> = Arc::downgrade(&self.handlers);
        ListenerGuard {
            remove: Some(Box::new(move || {
                if let Some(handlers) = handlers.upgrade() {
                    let mut handlers = handlers.lock();
                    if handlers.contains(key) {
                        handlers.remove(key);
                    }
                }
            })),
        }
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII disposer returned by [`Listeners::register`]; unregisters on drop.
#[must_use = "dropping the guard unregisters the handler"]
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerGuard {
    /// Unregister now.
    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the handler registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

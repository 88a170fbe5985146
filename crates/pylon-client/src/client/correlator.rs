// Request/reply correlation with per-request timeouts.
//
// Claiming an entry means removing it from the table under the mutex, so a reply
// and its timeout can never both win.
use parking_lot::Mutex;
use pylon_common::ids::RequestId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

pub(crate) type ReplyFn<M> = Box<dyn FnOnce(M) + Send>;
pub(crate) type TimeoutFn = Box<dyn FnOnce() + Send>;

struct PendingRequest<M> {
    on_reply: ReplyFn<M>,
    on_timeout: TimeoutFn,
    timer: AbortHandle,
}

pub(crate) struct Correlator<M> {
    // Timers run here, so callers need not be on a runtime thread.
    runtime: Handle,
    next_id: AtomicU32,
    pending: Mutex<HashMap<RequestId, PendingRequest<M>>>,
}

impl<M: 'static> Correlator<M> {
    pub(crate) fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a request id, store the callbacks and arm the timeout.
    pub(crate) fn register(
        self: &Arc<Self>,
        on_reply: ReplyFn<M>,
        on_timeout: TimeoutFn,
        timeout: Duration,
    ) -> RequestId {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let correlator = Arc::downgrade(self);
        // Held across the spawn so the timer cannot claim an entry that is not
        // inserted yet.
        let mut pending = self.pending.lock();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = correlator.upgrade() {
                correlator.expire(request_id);
            }
        })
        .abort_handle();
        let previous = pending.insert(
            request_id,
            PendingRequest {
                on_reply,
                on_timeout,
                timer,
            },
        );
        drop(pending);
        if let Some(previous) = previous {
            // Id space wrapped onto a request that never resolved.
            previous.timer.abort();
            tracing::warn!(request_id, "request id reused; dropping stale request");
        }
        request_id
    }

    /// Claim the entry for an arriving reply. `None` means the request already
    /// timed out, was cancelled, or never existed.
    pub(crate) fn complete(&self, request_id: RequestId) -> Option<ReplyFn<M>> {
        let entry = self.pending.lock().remove(&request_id)?;
        entry.timer.abort();
        Some(entry.on_reply)
    }

    fn expire(&self, request_id: RequestId) {
        let entry = self.pending.lock().remove(&request_id);
        if let Some(entry) = entry {
            tracing::debug!(request_id, "request timed out");
            (entry.on_timeout)();
        }
    }

    pub(crate) fn cancel(&self, request_id: RequestId) {
        if let Some(entry) = self.pending.lock().remove(&request_id) {
            entry.timer.abort();
        }
    }

    /// Drop every pending request without invoking any callback.
    pub(crate) fn clear(&self) {
        let drained: Vec<_> = self.pending.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.timer.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

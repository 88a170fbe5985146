// Relay mode: the daemon has no application logic of its own, so every client
// publish is forwarded verbatim to the sessions subscribed to its topic.
use bytes::Bytes;
use pylon_broker::{ServerEvent, SessionRegistry};
use pylon_common::ListenerGuard;
use pylon_wire::BytesCodec;
use std::sync::{Arc, Weak};

pub type RelayRegistry = SessionRegistry<BytesCodec>;

/// Hook relaying into `registry`. Relaying stops when the guard is dropped.
pub fn install(registry: &Arc<RelayRegistry>) -> ListenerGuard {
    // Listeners live inside the registry; a strong handle here would be a cycle.
    let weak: Weak<RelayRegistry> = Arc::downgrade(registry);
    registry.on_event(move |event: &ServerEvent<BytesCodec>| match event {
        ServerEvent::Message {
            session,
            topic,
            message,
        } => {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            relay(&registry, topic, message, session.id());
        }
        ServerEvent::Request { session, topic, reply, .. } => {
            tracing::debug!(
                session_id = %session.id(),
                request_id = reply.request_id(),
                topic = %topic,
                "no request handler; request left unanswered"
            );
        }
        _ => {}
    })
}

fn relay(
    registry: &RelayRegistry,
    topic: &str,
    message: &Bytes,
    from: pylon_common::ids::SessionId,
) {
    match registry.publish_to_all_subscribed_clients(topic, message) {
        Ok(delivered) => {
            metrics::counter!("pylon_broker_relayed_total").increment(1);
            tracing::trace!(session_id = %from, topic = %topic, delivered, "relayed publish");
        }
        Err(err) => {
            tracing::warn!(session_id = %from, topic = %topic, error = %err, "relay failed");
        }
    }
}

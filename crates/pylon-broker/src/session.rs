// Server-side session: one accepted connection, its subscription set and its
// reader loop.
//
// The reader loop owns the read half. Everything written to the peer goes
// through the session's `Outbound`, so replies, heartbeat echoes and broadcast
// frames issued from other tasks never interleave on the socket.
use parking_lot::Mutex;
use pylon_common::ErrorOrigin;
use pylon_common::ids::{RequestId, SessionId};
use pylon_transport::{Connection, ConnectionInfo, Outbound, ReadEvent, SendError};
use pylon_wire::{Frame, PayloadCodec};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::BrokerConfig;
use crate::events::ServerEvent;
use crate::registry::SessionRegistry;
use crate::{BrokerError, Result};

// Upper bound on how long a closing session waits for its writer to drain.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct ServerSession {
    id: SessionId,
    info: ConnectionInfo,
    topics: Mutex<HashSet<String>>,
    outbound: Outbound,
    closing: watch::Sender<bool>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("peer_addr", &self.info.peer_addr)
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    fn new(info: ConnectionInfo, outbound: Outbound) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            id: SessionId::new(),
            info,
            topics: Mutex::new(HashSet::new()),
            outbound,
            closing,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Queue a frame for this session without waiting.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .try_send(frame)
            .map_err(|err| self.send_error(err))
    }

    pub(crate) fn send_encoded(&self, encoded: bytes::Bytes) -> std::result::Result<(), SendError> {
        self.outbound.try_send_encoded(encoded)
    }

    /// Server-initiated close: tell the peer, then stop the reader loop. The
    /// session leaves the registry once the loop has wound down.
    pub fn disconnect(&self) {
        // Only the caller that flips the flag queues the Disconnect frame.
        let first = self
            .closing
            .send_if_modified(|closing| !std::mem::replace(closing, true));
        if first {
            let _ = self.outbound.try_send(Frame::Disconnect);
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow() || self.outbound.is_closed()
    }

    fn send_error(&self, err: SendError) -> BrokerError {
        match err {
            SendError::Full => BrokerError::QueueFull(self.id),
            SendError::Closed => BrokerError::SessionClosed(self.id),
        }
    }
}

/// Answers exactly one request. Clones share the answered flag, so whichever
/// clone replies first wins and every later attempt fails.
pub struct ReplyHandle<C: PayloadCodec> {
    session: Arc<ServerSession>,
    codec: Arc<C>,
    request_id: RequestId,
    topic: String,
    replied: Arc<AtomicBool>,
}

impl<C: PayloadCodec> Clone for ReplyHandle<C> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            codec: Arc::clone(&self.codec),
            request_id: self.request_id,
            topic: self.topic.clone(),
            replied: Arc::clone(&self.replied),
        }
    }
}

impl<C: PayloadCodec> ReplyHandle<C> {
    pub(crate) fn new(
        session: Arc<ServerSession>,
        codec: Arc<C>,
        request_id: RequestId,
        topic: String,
    ) -> Self {
        Self {
            session,
            codec,
            request_id,
            topic,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Send the reply on the originating session, echoing the request id and topic.
    ///
    /// A reply that could not be queued (`QueueFull`, `SessionClosed`) does not
    /// count as answered, so it may be retried.
    pub fn reply(&self, message: &C::Message) -> Result<()> {
        let payload = self.codec.encode(message)?;
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyReplied(self.request_id));
        }
        let sent = self.session.send(Frame::Reply {
            request_id: self.request_id,
            topic: self.topic.clone(),
            payload,
        });
        if sent.is_err() {
            self.replied.store(false, Ordering::Release);
        }
        sent
    }
}

enum Flow {
    Continue,
    Logout,
    Violation(anyhow::Error),
}

/// Drive one accepted connection until the peer leaves, a read or write fails,
/// the session is disconnected, or the acceptor shuts down.
pub(crate) async fn run_session<C: PayloadCodec>(
    registry: Arc<SessionRegistry<C>>,
    connection: Connection,
    config: BrokerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let info = connection.info().clone();
    let (mut reader, writer) = connection.split();
    let (outbound, writer_task) = Outbound::spawn(writer, config.outbound_queue_depth);
    let session = Arc::new(ServerSession::new(info, outbound.clone()));
    let mut closing = session.closing.subscribe();
    let read_timeout = Some(config.read_timeout);
    tracing::debug!(session_id = %session.id, peer = %session.info.peer_addr, "session opened");
    registry.insert(Arc::clone(&session));

    let failure: Option<(ErrorOrigin, anyhow::Error)> = loop {
        tokio::select! {
            _ = wait_true(&mut shutdown) => break None,
            _ = wait_true(&mut closing) => break None,
            _ = outbound.failed() => break None,
            event = reader.read_frame(read_timeout) => match event {
                Ok(ReadEvent::Frame(frame)) => {
                    match dispatch(&registry, &session, frame, &config) {
                        Flow::Continue => {}
                        Flow::Logout => break None,
                        Flow::Violation(err) => break Some((ErrorOrigin::Protocol, err)),
                    }
                }
                Ok(ReadEvent::TimedOut) => {
                    registry.emit(&ServerEvent::ReadTimeout {
                        session: Arc::clone(&session),
                    });
                }
                Ok(ReadEvent::Closed) => break None,
                Err(err) => {
                    let origin = if err.downcast_ref::<pylon_wire::Error>().is_some() {
                        ErrorOrigin::Protocol
                    } else {
                        ErrorOrigin::Read
                    };
                    break Some((origin, err));
                }
            },
        }
    };

    registry.remove(&session);

    if tokio::time::timeout(CLOSE_GRACE, outbound.close()).await.is_err() {
        tracing::debug!(session_id = %session.id, "outbound queue did not accept close");
    }
    let mut writer_task = writer_task;
    match tokio::time::timeout(CLOSE_GRACE, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => registry.report(ErrorOrigin::Write, &err),
        Ok(Err(join_err)) => {
            tracing::warn!(session_id = %session.id, error = %join_err, "outbound writer task failed")
        }
        Err(_) => writer_task.abort(),
    }
    if let Some((origin, err)) = failure {
        registry.report(origin, &err);
    }
    tracing::debug!(session_id = %session.id, "session closed");
}

fn dispatch<C: PayloadCodec>(
    registry: &SessionRegistry<C>,
    session: &Arc<ServerSession>,
    frame: Frame,
    config: &BrokerConfig,
) -> Flow {
    match frame {
        Frame::Subscribe { topic } => {
            session.topics.lock().insert(topic.clone());
            registry.emit(&ServerEvent::Subscribed {
                session: Arc::clone(session),
                topic,
            });
        }
        Frame::Unsubscribe { topic } => {
            session.topics.lock().remove(&topic);
            registry.emit(&ServerEvent::Unsubscribed {
                session: Arc::clone(session),
                topic,
            });
        }
        Frame::Disconnect => {
            registry.emit(&ServerEvent::Logout {
                session: Arc::clone(session),
            });
            // Ack; the close that follows drains it to the peer.
            let _ = session.outbound.try_send(Frame::Disconnect);
            return Flow::Logout;
        }
        Frame::Heartbeat => {
            registry.emit(&ServerEvent::Heartbeat {
                session: Arc::clone(session),
            });
            if config.echo_heartbeats
                && let Err(err) = session.outbound.try_send(Frame::Heartbeat)
            {
                tracing::debug!(session_id = %session.id, error = %err, "heartbeat echo dropped");
            }
        }
        Frame::Data { topic, payload } => match registry.codec().decode(&topic, payload) {
            Ok(message) => registry.emit(&ServerEvent::Message {
                session: Arc::clone(session),
                topic,
                message,
            }),
            Err(err) => registry.report(ErrorOrigin::Codec, &anyhow::Error::new(err)),
        },
        Frame::DataRequest {
            request_id,
            topic,
            payload,
        } => match registry.codec().decode(&topic, payload) {
            Ok(message) => {
                let reply = ReplyHandle::new(
                    Arc::clone(session),
                    Arc::clone(registry.codec()),
                    request_id,
                    topic.clone(),
                );
                registry.emit(&ServerEvent::Request {
                    session: Arc::clone(session),
                    topic,
                    message,
                    reply,
                });
            }
            Err(err) => registry.report(ErrorOrigin::Codec, &anyhow::Error::new(err)),
        },
        Frame::Reply { request_id, topic, .. } => {
            return Flow::Violation(anyhow::anyhow!(
                "unexpected reply frame from client (request {request_id}, topic {topic})"
            ));
        }
    }
    Flow::Continue
}

// Resolves once the flag is set or its sender is gone.
async fn wait_true(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

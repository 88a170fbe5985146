// Client session: public handle plus the actor task that owns the connection.
//
// The actor is the connection's outbound serializer. It owns the write half, the
// heartbeat interval and the reconnect timer, and processes commands one at a
// time in submission order. The reader task only dispatches inbound frames and
// posts its exit back to the actor; it never writes and never touches
// connection state.
use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use pylon_common::ids::RequestId;
use pylon_common::{ErrorHandler, ErrorOrigin, ListenerGuard, Listeners, default_error_handler};
use pylon_transport::{FrameReader, FrameWriter, ReadEvent};
use pylon_wire::{Frame, PayloadCodec, validate_topic};
use std::future::{Future, pending};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use super::correlator::Correlator;
use super::events::{ClientStats, Counters, SessionEvent, SessionState};
use super::subscription::{Subscription, SubscriptionTable};
use crate::config::ClientConfig;
use crate::{ClientError, Result};

pub(crate) enum Command {
    Connect,
    /// A complete encoded frame (Data or DataRequest).
    Send(Bytes),
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
        registration: u64,
    },
    ReaderExited {
        generation: u64,
        exit: ReaderExit,
    },
    Close {
        send_logout: bool,
        done: oneshot::Sender<()>,
    },
}

pub(crate) enum ReaderExit {
    /// Peer closed the stream between frames.
    Eof,
    /// Peer sent a Disconnect frame.
    Logout,
    Failed {
        origin: ErrorOrigin,
        error: anyhow::Error,
    },
}

struct Shared<C: PayloadCodec> {
    config: ClientConfig,
    codec: C,
    subscriptions: SubscriptionTable<C::Message>,
    correlator: Arc<Correlator<C::Message>>,
    listeners: Listeners<SessionEvent>,
    error_handler: Arc<dyn ErrorHandler>,
    counters: Counters,
    state: Mutex<SessionState>,
    started: AtomicBool,
    closed: AtomicBool,
    // Raised by close() so the actor can abandon a write the peer never drains.
    close_signal: watch::Sender<bool>,
}

impl<C: PayloadCodec> Shared<C> {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: SessionEvent) {
        self.listeners.emit(&event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session closed. Returns false if it already was.
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_signal.send_replace(true);
        true
    }

    fn report(&self, origin: ErrorOrigin, error: &anyhow::Error) {
        self.error_handler.handle_error(origin, error);
    }

    /// Handle one inbound frame on the reader task. `Some` ends the read loop.
    fn dispatch(&self, frame: Frame) -> Option<ReaderExit> {
        match frame {
            Frame::Heartbeat => self.emit(SessionEvent::Heartbeat),
            Frame::Disconnect => return Some(ReaderExit::Logout),
            Frame::Data { topic, payload } => {
                let Some(registration) = self.subscriptions.get_active(&topic) else {
                    tracing::trace!(topic = %topic, "data for unsubscribed topic");
                    return None;
                };
                match self.codec.decode(&topic, payload) {
                    Ok(message) => registration.deliver(message),
                    Err(err) => self.report(ErrorOrigin::Codec, &err.into()),
                }
            }
            Frame::Reply {
                request_id,
                topic,
                payload,
            } => {
                let Some(on_reply) = self.correlator.complete(request_id) else {
                    tracing::debug!(request_id, "discarding reply with no pending request");
                    return None;
                };
                match self.codec.decode(&topic, payload) {
                    Ok(message) => on_reply(message),
                    Err(err) => self.report(ErrorOrigin::Codec, &err.into()),
                }
            }
            other => {
                return Some(ReaderExit::Failed {
                    origin: ErrorOrigin::Protocol,
                    error: anyhow!(
                        "unexpected {:?} frame from server",
                        other.message_type()
                    ),
                });
            }
        }
        None
    }
}

/// One logical client of a pylon broker.
///
/// Construct inside a tokio runtime; the session's actor task and request
/// timers run on it, so the handle may then be used from any thread. Nothing
/// connects until [`start`](Self::start) is called, and after a failure
/// the session reconnects on its own and replays its subscriptions until
/// [`close`](Self::close).
///
/// ```no_run
/// use pylon_client::{ClientConfig, ClientSession};
/// use pylon_wire::Utf8Codec;
///
/// # async fn run() -> anyhow::Result<()> {
/// let session = ClientSession::new(ClientConfig::with_addr("127.0.0.1:7400"), Utf8Codec);
/// let _subscription = session.subscribe("news", |message: String| println!("{message}"))?;
/// session.start()?;
/// session.publish("news", &"hello".to_string())?;
/// session.close(true).await?;
/// # Ok(())
/// # }
/// ```
pub struct ClientSession<C: PayloadCodec> {
    shared: Arc<Shared<C>>,
    commands: mpsc::UnboundedSender<Command>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PayloadCodec> ClientSession<C> {
    pub fn new(config: ClientConfig, codec: C) -> Self {
        Self::with_error_handler(config, codec, default_error_handler())
    }

    pub fn with_error_handler(
        config: ClientConfig,
        codec: C,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        let backoff = config.reconnect_delay;
        let runtime = Handle::current();
        let (close_signal, closing) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            codec,
            subscriptions: SubscriptionTable::new(),
            correlator: Correlator::new(runtime.clone()),
            listeners: Listeners::new(),
            error_handler,
            counters: Counters::default(),
            state: Mutex::new(SessionState::Idle),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: Arc::clone(&shared),
            commands: commands.clone(),
            conn: None,
            generation: 0,
            heartbeat: None,
            reconnect: None,
            backoff,
            closing,
        };
        let handle = runtime.spawn(actor.run(rx));
        Self {
            shared,
            commands,
            actor: Mutex::new(Some(handle)),
        }
    }

    /// Begin connecting. Returns `false` if the session was already started.
    pub fn start(&self) -> Result<bool> {
        if self.shared.is_closed() {
            return Err(ClientError::Closed);
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.enqueue(Command::Connect)?;
        Ok(true)
    }

    /// Register the single local subscriber for `topic`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(C::Message) + Send + Sync + 'static,
    {
        if self.shared.is_closed() {
            return Err(ClientError::Closed);
        }
        validate_topic(topic)?;
        let (id, active) = self.shared.subscriptions.insert(topic, Arc::new(callback))?;
        self.enqueue(Command::Subscribe {
            topic: topic.to_string(),
        })?;
        Ok(Subscription::new(
            topic.to_string(),
            id,
            active,
            self.commands.clone(),
        ))
    }

    /// Fire-and-forget publish. Dropped when the session is not connected at the
    /// moment the frame reaches the front of the queue.
    pub fn publish(&self, topic: &str, message: &C::Message) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ClientError::Closed);
        }
        let payload = self.shared.codec.encode(message)?;
        let frame = Frame::Data {
            topic: topic.to_string(),
            payload,
        }
        .encode()?;
        self.enqueue(Command::Send(frame))
    }

    /// Send a request; exactly one of `on_reply` / `on_timeout` runs unless the
    /// session is closed first, in which case neither does.
    pub fn request<R, T>(
        &self,
        topic: &str,
        message: &C::Message,
        on_reply: R,
        on_timeout: T,
        timeout: Duration,
    ) -> Result<RequestId>
    where
        R: FnOnce(C::Message) + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        if self.shared.is_closed() {
            return Err(ClientError::Closed);
        }
        validate_topic(topic)?;
        let payload = self.shared.codec.encode(message)?;
        let correlator = &self.shared.correlator;
        let request_id = correlator.register(Box::new(on_reply), Box::new(on_timeout), timeout);
        let encoded = Frame::DataRequest {
            request_id,
            topic: topic.to_string(),
            payload,
        }
        .encode();
        let frame = match encoded {
            Ok(frame) => frame,
            Err(err) => {
                correlator.cancel(request_id);
                return Err(err.into());
            }
        };
        if let Err(err) = self.enqueue(Command::Send(frame)) {
            correlator.cancel(request_id);
            return Err(err);
        }
        Ok(request_id)
    }

    /// Await the reply to a request.
    pub async fn call(
        &self,
        topic: &str,
        message: &C::Message,
        timeout: Duration,
    ) -> Result<C::Message> {
        let (tx, rx) = oneshot::channel();
        let reply_tx = Arc::new(Mutex::new(Some(tx)));
        let timeout_tx = Arc::clone(&reply_tx);
        let request_id = self.request(
            topic,
            message,
            move |reply| {
                if let Some(tx) = reply_tx.lock().take() {
                    let _ = tx.send(Some(reply));
                }
            },
            move || {
                if let Some(tx) = timeout_tx.lock().take() {
                    let _ = tx.send(None);
                }
            },
            timeout,
        )?;
        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ClientError::RequestTimedOut(request_id)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Close the session. Calling it twice is an error.
    ///
    /// With `send_logout` and a live connection, a Disconnect frame is sent and
    /// the server's acknowledgement awaited for up to `logout_timeout`. A write
    /// stuck behind a peer that stopped reading is abandoned and the connection
    /// dropped, so close never waits on the peer beyond that bound.
    pub async fn close(&self, send_logout: bool) -> Result<()> {
        if !self.shared.mark_closed() {
            return Err(ClientError::AlreadyClosed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close {
                send_logout,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            let _ = actor.await;
        }
        Ok(())
    }

    pub fn on_event<F>(&self, handler: F) -> ListenerGuard
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.register(handler)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.counters.snapshot()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

impl<C: PayloadCodec> Drop for ClientSession<C> {
    fn drop(&mut self) {
        if self.shared.mark_closed() {
            let (done, _) = oneshot::channel();
            let _ = self.commands.send(Command::Close {
                send_logout: false,
                done,
            });
        }
    }
}

struct ActiveConnection {
    writer: FrameWriter<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    generation: u64,
    logout_ack: Arc<Notify>,
    peer: SocketAddr,
}

struct Actor<C: PayloadCodec> {
    shared: Arc<Shared<C>>,
    commands: mpsc::UnboundedSender<Command>,
    conn: Option<ActiveConnection>,
    generation: u64,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    backoff: Duration,
    closing: watch::Receiver<bool>,
}

impl<C: PayloadCodec> Actor<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        self.shutdown(false).await;
                        break;
                    };
                    if let Command::Close { send_logout, done } = command {
                        self.shutdown(send_logout).await;
                        let _ = done.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                _ = tick(&mut self.heartbeat), if self.heartbeat.is_some() => {
                    self.send_heartbeat().await;
                }
                _ = expired(&mut self.reconnect), if self.reconnect.is_some() => {
                    self.reconnect = None;
                    self.connect().await;
                }
            }
        }
        tracing::debug!("client session actor exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.conn.is_none() && self.reconnect.is_none() && !self.shared.is_closed() {
                    self.connect().await;
                }
            }
            Command::Send(frame) => self.write_encoded(frame).await,
            Command::Subscribe { topic } => {
                if self.conn.is_some() {
                    self.write_frame(Frame::Subscribe { topic }).await;
                }
            }
            Command::Unsubscribe {
                topic,
                registration,
            } => {
                self.shared.subscriptions.remove_if(&topic, registration);
                if self.conn.is_some() {
                    self.write_frame(Frame::Unsubscribe { topic }).await;
                }
            }
            Command::ReaderExited { generation, exit } => {
                let current = self.conn.as_ref().map(|conn| conn.generation);
                if current != Some(generation) {
                    tracing::trace!(generation, "ignoring exit of stale reader");
                    return;
                }
                match exit {
                    ReaderExit::Eof => {
                        let error = anyhow!("connection closed by peer");
                        self.handle_disconnect(Some((ErrorOrigin::Read, error)))
                            .await;
                    }
                    ReaderExit::Logout => {
                        tracing::info!("server ended the session");
                        self.handle_disconnect(None).await;
                    }
                    ReaderExit::Failed { origin, error } => {
                        self.handle_disconnect(Some((origin, error))).await;
                    }
                }
            }
            Command::Close { .. } => {}
        }
    }

    async fn connect(&mut self) {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        shared.set_state(SessionState::Connecting);
        let transport = config.transport();
        let attempt = async {
            let attempt = pylon_transport::connect(config.addr.as_str(), &transport);
            if config.connect_timeout.is_zero() {
                return attempt.await;
            }
            match tokio::time::timeout(config.connect_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "connect to {} timed out after {:?}",
                    config.addr,
                    config.connect_timeout
                )),
            }
        };
        let Some(result) = unless_closing(&mut self.closing, attempt).await else {
            return;
        };
        if shared.is_closed() {
            // close() raced the attempt; the queued Close finishes the teardown.
            return;
        }
        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                Counters::bump(&shared.counters.connect_failures);
                shared.set_state(SessionState::Disconnected);
                tracing::debug!(addr = %config.addr, error = %err, "connect failed");
                shared.emit(SessionEvent::ConnectFailed {
                    error: format!("{err:#}"),
                });
                shared.report(ErrorOrigin::Connect, &err);
                self.schedule_reconnect();
                return;
            }
        };

        let peer = connection.info().peer_addr;
        let (reader, mut writer) = connection.split();
        for topic in shared.subscriptions.active_topics() {
            let frame = Frame::Subscribe { topic };
            let replay = writer.write_frame(&frame);
            let Some(written) = unless_closing(&mut self.closing, replay).await else {
                return;
            };
            if let Err(err) = written {
                Counters::bump(&shared.counters.connect_failures);
                shared.set_state(SessionState::Disconnected);
                shared.emit(SessionEvent::ConnectFailed {
                    error: format!("{err:#}"),
                });
                shared.report(ErrorOrigin::Write, &err);
                self.schedule_reconnect();
                return;
            }
            Counters::bump(&shared.counters.frames_sent);
        }

        self.generation += 1;
        let logout_ack = Arc::new(Notify::new());
        let reader = tokio::spawn(run_reader(
            Arc::clone(&shared),
            reader,
            self.generation,
            self.commands.clone(),
            Arc::clone(&logout_ack),
        ));
        self.conn = Some(ActiveConnection {
            writer,
            reader,
            generation: self.generation,
            logout_ack,
            peer,
        });
        self.backoff = config.reconnect_delay;
        if !config.heartbeat_interval.is_zero() {
            let period = config.heartbeat_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat = Some(interval);
        }
        Counters::bump(&shared.counters.connects);
        shared.set_state(SessionState::Connected);
        tracing::info!(peer = %peer, generation = self.generation, "client session connected");
        shared.emit(SessionEvent::Connected { peer });
    }

    /// Exactly one retry may be pending; a zero reconnect delay disables retries.
    fn schedule_reconnect(&mut self) {
        let config = &self.shared.config;
        if self.shared.is_closed() || self.reconnect.is_some() || config.reconnect_delay.is_zero()
        {
            return;
        }
        let delay = self.backoff;
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
        self.backoff = next_backoff(delay, config.reconnect_max_delay);
        Counters::bump(&self.shared.counters.reconnects_scheduled);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    async fn handle_disconnect(&mut self, failure: Option<(ErrorOrigin, anyhow::Error)>) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.heartbeat = None;
        teardown(conn).await;
        Counters::bump(&self.shared.counters.disconnects);
        self.shared.set_state(SessionState::Disconnected);
        self.shared.emit(SessionEvent::Disconnected {
            expected: failure.is_none(),
        });
        if let Some((origin, error)) = failure {
            tracing::warn!(origin = %origin, error = %format!("{error:#}"), "client session disconnected");
            self.shared.report(origin, &error);
        }
        self.schedule_reconnect();
    }

    async fn shutdown(&mut self, send_logout: bool) {
        self.reconnect = None;
        self.heartbeat = None;
        if let Some(mut conn) = self.conn.take() {
            if send_logout {
                let logout = Frame::Disconnect;
                match unless_closing(&mut self.closing, conn.writer.write_frame(&logout)).await {
                    None => tracing::debug!(peer = %conn.peer, "logout not written; peer is not reading"),
                    Some(Ok(())) => {
                        let wait = self.shared.config.logout_timeout;
                        if !wait.is_zero()
                            && tokio::time::timeout(wait, conn.logout_ack.notified())
                                .await
                                .is_err()
                        {
                            tracing::debug!(peer = %conn.peer, "logout not acknowledged in time");
                        }
                    }
                    Some(Err(err)) => tracing::debug!(error = %err, "failed to send logout"),
                }
            }
            teardown(conn).await;
            Counters::bump(&self.shared.counters.disconnects);
            self.shared.emit(SessionEvent::Disconnected { expected: true });
        }
        self.shared.correlator.clear();
        self.shared.set_state(SessionState::Closed);
        self.shared.emit(SessionEvent::Closed);
    }

    async fn send_heartbeat(&mut self) {
        self.write_frame(Frame::Heartbeat).await;
    }

    async fn write_frame(&mut self, frame: Frame) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let outcome = unless_closing(&mut self.closing, conn.writer.write_frame(&frame)).await;
        self.written(outcome).await;
    }

    async fn write_encoded(&mut self, frame: Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            Counters::bump(&self.shared.counters.dropped_while_disconnected);
            tracing::trace!("dropping frame while disconnected");
            return;
        };
        let outcome = unless_closing(&mut self.closing, conn.writer.write_encoded(&frame)).await;
        self.written(outcome).await;
    }

    async fn written(&mut self, outcome: Option<anyhow::Result<()>>) {
        match outcome {
            Some(Ok(())) => Counters::bump(&self.shared.counters.frames_sent),
            Some(Err(err)) => self.handle_disconnect(Some((ErrorOrigin::Write, err))).await,
            None => self.abandon_connection().await,
        }
    }

    /// close() interrupted a write mid-frame: the stream can carry nothing more,
    /// so drop it without a logout.
    async fn abandon_connection(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        tracing::debug!(peer = %conn.peer, "closing with a write still pending; dropping connection");
        self.heartbeat = None;
        teardown(conn).await;
        Counters::bump(&self.shared.counters.disconnects);
        self.shared.set_state(SessionState::Disconnected);
        self.shared.emit(SessionEvent::Disconnected { expected: true });
    }
}

/// Run `io` unless close() has been requested first or while it is pending.
/// `None` means the operation was abandoned.
async fn unless_closing<F, T>(closing: &mut watch::Receiver<bool>, io: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        output = io => Some(output),
        _ = close_requested(closing) => None,
    }
}

async fn close_requested(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|requested| *requested).await;
}

async fn teardown(mut conn: ActiveConnection) {
    conn.reader.abort();
    if let Err(err) = conn.writer.shutdown().await {
        tracing::trace!(error = %err, "write half shutdown failed");
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max.max(current))
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn run_reader<C: PayloadCodec>(
    shared: Arc<Shared<C>>,
    mut reader: FrameReader<OwnedReadHalf>,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    logout_ack: Arc<Notify>,
) {
    let read_timeout = Some(shared.config.read_timeout);
    let exit = loop {
        match reader.read_frame(read_timeout).await {
            Ok(ReadEvent::Frame(frame)) => {
                Counters::bump(&shared.counters.frames_received);
                if let Some(exit) = shared.dispatch(frame) {
                    if matches!(exit, ReaderExit::Logout) {
                        logout_ack.notify_one();
                    }
                    break exit;
                }
            }
            Ok(ReadEvent::TimedOut) => shared.emit(SessionEvent::ReadTimeout),
            Ok(ReadEvent::Closed) => break ReaderExit::Eof,
            Err(error) => {
                let origin = if error.downcast_ref::<pylon_wire::Error>().is_some() {
                    ErrorOrigin::Protocol
                } else {
                    ErrorOrigin::Read
                };
                break ReaderExit::Failed { origin, error };
            }
        }
    };
    let _ = commands.send(Command::ReaderExited { generation, exit });
}

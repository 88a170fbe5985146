// End-to-end tests against a real broker on a loopback port.
use super::*;
use bytes::Bytes;
use parking_lot::Mutex;
use pylon_broker::{Acceptor, BrokerConfig, ServerEvent, SessionRegistry};
use pylon_common::ids::SessionId;
use pylon_common::{ErrorHandler, ErrorOrigin, ListenerGuard};
use pylon_transport::{FrameReader, FrameWriter, ReadEvent, TcpServer, TransportConfig};
use pylon_wire::{Frame, Utf8Codec};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Opened(SessionId),
    Subscribed(String),
    Unsubscribed(String),
    Logout,
    Message(String, String),
    Request(String),
    Heartbeat,
    Closed(SessionId),
}

struct TestBroker {
    acceptor: Acceptor<Utf8Codec>,
    seen: mpsc::UnboundedReceiver<Seen>,
    _guard: ListenerGuard,
}

impl TestBroker {
    // Replies "replyMsg" to requests on "rpc" and ignores requests elsewhere.
    async fn start() -> Self {
        let registry = SessionRegistry::new(Utf8Codec);
        let (tx, seen) = mpsc::unbounded_channel();
        let guard = registry.on_event(move |event: &ServerEvent<Utf8Codec>| {
            let observed = match event {
                ServerEvent::SessionOpened { session } => Seen::Opened(session.id()),
                ServerEvent::Subscribed { topic, .. } => Seen::Subscribed(topic.clone()),
                ServerEvent::Unsubscribed { topic, .. } => Seen::Unsubscribed(topic.clone()),
                ServerEvent::Logout { .. } => Seen::Logout,
                ServerEvent::Message { topic, message, .. } => {
                    Seen::Message(topic.clone(), message.clone())
                }
                ServerEvent::Request {
                    topic,
                    message,
                    reply,
                    ..
                } => {
                    if topic == "rpc" {
                        reply.reply(&"replyMsg".to_string()).expect("reply");
                    }
                    Seen::Request(message.clone())
                }
                ServerEvent::Heartbeat { .. } => Seen::Heartbeat,
                ServerEvent::ReadTimeout { .. } => return,
                ServerEvent::SessionClosed { session } => Seen::Closed(session.id()),
            };
            let _ = tx.send(observed);
        });
        let acceptor = Acceptor::bind("127.0.0.1:0", BrokerConfig::default(), registry)
            .await
            .expect("bind broker");
        acceptor.spawn().expect("spawn broker");
        Self {
            acceptor,
            seen,
            _guard: guard,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            reconnect_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            ..ClientConfig::with_addr(self.acceptor.local_addr().to_string())
        }
    }

    fn registry(&self) -> &Arc<SessionRegistry<Utf8Codec>> {
        self.acceptor.registry()
    }

    async fn expect(&mut self, wanted: impl Fn(&Seen) -> bool) -> Seen {
        loop {
            let seen = timeout(WAIT, self.seen.recv())
                .await
                .expect("broker event within deadline")
                .expect("broker event channel open");
            if wanted(&seen) {
                return seen;
            }
        }
    }

    async fn opened(&mut self) -> SessionId {
        match self.expect(|seen| matches!(seen, Seen::Opened(_))).await {
            Seen::Opened(id) => id,
            _ => unreachable!(),
        }
    }

    async fn subscribed(&mut self, topic: &str) {
        self.expect(|seen| *seen == Seen::Subscribed(topic.to_string()))
            .await;
    }
}

// Server end driven frame by frame, for cases an honest broker never produces.
struct RawServer {
    server: TcpServer,
}

struct RawPeer {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl RawServer {
    async fn bind() -> Self {
        let server = TcpServer::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .expect("bind raw server");
        Self { server }
    }

    fn config(&self) -> ClientConfig {
        let addr = self.server.local_addr().expect("local addr");
        ClientConfig {
            reconnect_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            ..ClientConfig::with_addr(addr.to_string())
        }
    }

    async fn accept(&self) -> RawPeer {
        let connection = timeout(WAIT, self.server.accept())
            .await
            .expect("client connects within deadline")
            .expect("accept");
        let (reader, writer) = connection.split();
        RawPeer { reader, writer }
    }
}

impl RawPeer {
    async fn expect_frame(&mut self, wanted: impl Fn(&Frame) -> bool) -> Frame {
        loop {
            let event = timeout(WAIT, self.reader.read_frame(None))
                .await
                .expect("frame within deadline")
                .expect("read frame");
            match event {
                ReadEvent::Frame(frame) if wanted(&frame) => return frame,
                ReadEvent::Frame(_) => {}
                other => panic!("unexpected read event {other:?}"),
            }
        }
    }

    async fn subscribed(&mut self, topic: &str) {
        let wanted = Frame::Subscribe {
            topic: topic.to_string(),
        };
        self.expect_frame(|frame| *frame == wanted).await;
    }

    async fn send(&mut self, frame: Frame) {
        self.writer.write_frame(&frame).await.expect("write frame");
    }
}

fn recording_handler() -> (Arc<dyn ErrorHandler>, Arc<Mutex<Vec<ErrorOrigin>>>) {
    let origins = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&origins);
    let handler: Arc<dyn ErrorHandler> =
        Arc::new(move |origin: ErrorOrigin, _error: &anyhow::Error| {
            recorded.lock().push(origin);
        });
    (handler, origins)
}

fn watch_events(session: &ClientSession<Utf8Codec>) -> (mpsc::UnboundedReceiver<SessionEvent>, ListenerGuard) {
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = session.on_event(move |event| {
        let _ = tx.send(event.clone());
    });
    (rx, guard)
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("client event within deadline")
            .expect("client event channel open");
        if wanted(&event) {
            return event;
        }
    }
}

fn is_connected(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Connected { .. })
}

#[tokio::test]
async fn broadcast_reaches_subscriber_exactly_once() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    let (tx, mut received) = mpsc::unbounded_channel();
    let _subscription = session
        .subscribe("hello", move |message: String| {
            let _ = tx.send(message);
        })
        .expect("subscribe");
    session.start().expect("start");
    broker.subscribed("hello").await;

    let delivered = broker
        .registry()
        .publish_to_all_subscribed_clients("hello", &"hi".to_string())
        .expect("broadcast");
    assert_eq!(delivered, 1);

    let message = timeout(WAIT, received.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(message, "hi");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err());

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn request_receives_reply_and_never_times_out() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;

    let replies = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let timeout_count = Arc::clone(&timeouts);
    let reply_count = Arc::clone(&replies);
    session
        .request(
            "rpc",
            &"requestMsg".to_string(),
            move |reply: String| {
                reply_count.fetch_add(1, Ordering::SeqCst);
                let _ = reply_tx.send(reply);
            },
            move || {
                timeout_count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(200),
        )
        .expect("request");

    let reply = timeout(WAIT, reply_rx.recv())
        .await
        .expect("reply within deadline")
        .expect("channel open");
    assert_eq!(reply, "replyMsg");
    broker
        .expect(|seen| *seen == Seen::Request("requestMsg".into()))
        .await;

    // Past the request's timeout: the reply already claimed it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(replies.load(Ordering::SeqCst), 1);
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(session.pending_requests(), 0);

    let answer = session
        .call("rpc", &"again".to_string(), Duration::from_secs(1))
        .await
        .expect("call");
    assert_eq!(answer, "replyMsg");

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn unanswered_request_times_out_once() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;

    let replies = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let reply_count = Arc::clone(&replies);
    let timeout_count = Arc::clone(&timeouts);
    session
        .request(
            "void",
            &"anyone?".to_string(),
            move |_reply: String| {
                reply_count.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                timeout_count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        )
        .expect("request");
    broker
        .expect(|seen| *seen == Seen::Request("anyone?".into()))
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(replies.load(Ordering::SeqCst), 0);
    assert_eq!(session.pending_requests(), 0);

    let result = session
        .call("void", &"still there?".to_string(), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ClientError::RequestTimedOut(_))));

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn logout_closes_without_reconnecting() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;
    let opened = broker.opened().await;

    session.close(true).await.expect("close");
    assert_eq!(session.state(), SessionState::Closed);
    broker.expect(|seen| *seen == Seen::Logout).await;
    let closed = broker.expect(|seen| matches!(seen, Seen::Closed(_))).await;
    assert_eq!(closed, Seen::Closed(opened));

    next_event(&mut events, |event| *event == SessionEvent::Closed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.stats().reconnects_scheduled, 0);
    assert!(broker.registry().is_empty());
    assert!(matches!(
        session.close(true).await,
        Err(ClientError::AlreadyClosed)
    ));
    assert!(matches!(session.start(), Err(ClientError::Closed)));
}

#[tokio::test]
async fn heartbeats_keep_an_idle_session_alive() {
    let mut broker = TestBroker::start().await;
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(50),
        read_timeout: Duration::from_millis(200),
        ..broker.config()
    };
    let session = ClientSession::new(config, Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut server_heartbeats = 0;
    while let Ok(seen) = broker.seen.try_recv() {
        if seen == Seen::Heartbeat {
            server_heartbeats += 1;
        }
    }
    assert!(server_heartbeats >= 3, "server saw {server_heartbeats} heartbeats");

    let mut echoes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Heartbeat => echoes += 1,
            SessionEvent::ReadTimeout => panic!("unexpected read timeout"),
            _ => {}
        }
    }
    assert!(echoes >= 3, "client saw {echoes} heartbeat echoes");

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn concurrent_publishes_arrive_intact() {
    const TASKS: usize = 4;
    const PER_TASK: usize = 50;

    let mut broker = TestBroker::start().await;
    let session = Arc::new(ClientSession::new(broker.config(), Utf8Codec));
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;

    let mut publishers = Vec::new();
    for task in 0..TASKS {
        let session = Arc::clone(&session);
        publishers.push(tokio::spawn(async move {
            for n in 0..PER_TASK {
                let body = format!("{task}:{n}:{}", "x".repeat(64));
                session.publish("flood", &body).expect("publish");
            }
        }));
    }
    for publisher in publishers {
        publisher.await.expect("publisher task");
    }

    let mut seen = std::collections::HashSet::new();
    while seen.len() < TASKS * PER_TASK {
        match broker.expect(|seen| matches!(seen, Seen::Message(..))).await {
            Seen::Message(topic, body) => {
                assert_eq!(topic, "flood");
                let mut parts = body.splitn(3, ':');
                let task: usize = parts.next().and_then(|p| p.parse().ok()).expect("task");
                let n: usize = parts.next().and_then(|p| p.parse().ok()).expect("n");
                assert_eq!(parts.next(), Some("x".repeat(64).as_str()));
                assert!(seen.insert((task, n)), "duplicate message {task}:{n}");
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(session.stats().dropped_while_disconnected, 0);

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn reconnect_replays_subscriptions() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    let (tx, mut received) = mpsc::unbounded_channel();
    let _subscription = session
        .subscribe("news", move |message: String| {
            let _ = tx.send(message);
        })
        .expect("subscribe");
    session.start().expect("start");
    let first = broker.opened().await;
    broker.subscribed("news").await;

    assert!(broker.registry().disconnect(first));
    next_event(&mut events, |event| {
        *event == SessionEvent::Disconnected { expected: true }
    })
    .await;

    let second = broker.opened().await;
    assert_ne!(first, second);
    broker.subscribed("news").await;
    next_event(&mut events, is_connected).await;
    assert_eq!(session.stats().reconnects_scheduled, 1);

    let delivered = broker
        .registry()
        .publish_to_all_subscribed_clients("news", &"after".to_string())
        .expect("broadcast");
    assert_eq!(delivered, 1);
    let message = timeout(WAIT, received.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(message, "after");

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn one_subscriber_per_topic_until_unsubscribed() {
    let mut broker = TestBroker::start().await;
    let session = ClientSession::new(broker.config(), Utf8Codec);
    session.start().expect("start");

    let subscription = session.subscribe("prices", |_: String| {}).expect("subscribe");
    assert!(matches!(
        session.subscribe("prices", |_: String| {}),
        Err(ClientError::AlreadySubscribed(topic)) if topic == "prices"
    ));
    broker.subscribed("prices").await;

    subscription.unsubscribe();
    broker
        .expect(|seen| *seen == Seen::Unsubscribed("prices".into()))
        .await;
    assert!(broker.registry().subscribers_of("prices").is_empty());

    let again = session.subscribe("prices", |_: String| {}).expect("resubscribe");
    assert!(again.is_active());
    broker.subscribed("prices").await;

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn connect_failures_keep_retrying_until_closed() {
    // Reserve a port, then free it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let config = ClientConfig {
        reconnect_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(40),
        ..ClientConfig::with_addr(addr.to_string())
    };
    let session = ClientSession::new(config, Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    for _ in 0..2 {
        next_event(&mut events, |event| {
            matches!(event, SessionEvent::ConnectFailed { .. })
        })
        .await;
    }
    let stats = session.stats();
    assert!(stats.connect_failures >= 2);
    assert!(stats.reconnects_scheduled >= 2);
    assert_eq!(stats.connects, 0);

    session.close(false).await.expect("close");
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn publish_while_disconnected_is_dropped() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let session = ClientSession::new(ClientConfig::with_addr(addr.to_string()), Utf8Codec);
    session
        .publish("nowhere", &"lost".to_string())
        .expect("publish is accepted");
    timeout(WAIT, async {
        while session.stats().dropped_while_disconnected == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("drop counted");
    session.close(false).await.expect("close");
    assert!(matches!(
        session.publish("nowhere", &"late".to_string()),
        Err(ClientError::Closed)
    ));
}

#[tokio::test]
async fn close_abandons_a_write_the_peer_never_reads() {
    let server = RawServer::bind().await;
    let session = ClientSession::new(server.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    // Accepted and held open, never read.
    let _stalled = server.accept().await;
    next_event(&mut events, is_connected).await;

    let body = "x".repeat(1 << 20);
    for _ in 0..64 {
        session.publish("bulk", &body).expect("publish");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.stats().frames_sent < 64, "socket buffers never filled");

    timeout(WAIT, session.close(true))
        .await
        .expect("close returns while the write is stuck")
        .expect("close");
    assert_eq!(session.state(), SessionState::Closed);
    next_event(&mut events, |event| {
        *event == SessionEvent::Disconnected { expected: true }
    })
    .await;
    next_event(&mut events, |event| *event == SessionEvent::Closed).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_from_a_plain_thread_are_answered() {
    let mut broker = TestBroker::start().await;
    let session = Arc::new(ClientSession::new(broker.config(), Utf8Codec));
    let (mut events, _guard) = watch_events(&session);
    session.start().expect("start");
    next_event(&mut events, is_connected).await;

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let (timeout_tx, mut timeouts) = mpsc::unbounded_channel();
    let worker = Arc::clone(&session);
    let thread = std::thread::spawn(move || {
        worker.publish("plain", &"from thread".to_string())?;
        worker.request(
            "rpc",
            &"answered".to_string(),
            move |reply: String| {
                let _ = reply_tx.send(reply);
            },
            || {},
            Duration::from_secs(2),
        )?;
        worker.request(
            "void",
            &"unanswered".to_string(),
            |_reply: String| {},
            move || {
                let _ = timeout_tx.send(());
            },
            Duration::from_millis(50),
        )
    });
    tokio::task::spawn_blocking(move || thread.join())
        .await
        .expect("join blocking task")
        .expect("thread did not panic")
        .expect("request from thread");

    broker
        .expect(|seen| *seen == Seen::Message("plain".into(), "from thread".into()))
        .await;
    let reply = timeout(WAIT, replies.recv())
        .await
        .expect("reply within deadline")
        .expect("channel open");
    assert_eq!(reply, "replyMsg");
    timeout(WAIT, timeouts.recv())
        .await
        .expect("timeout within deadline")
        .expect("channel open");

    session.close(true).await.expect("close");
}

#[tokio::test]
async fn dropped_connection_reconnects_once_and_replays_subscriptions() {
    let server = RawServer::bind().await;
    let (handler, origins) = recording_handler();
    let session = ClientSession::with_error_handler(server.config(), Utf8Codec, handler);
    let (mut events, _guard) = watch_events(&session);
    let (tx, mut received) = mpsc::unbounded_channel();
    let _subscription = session
        .subscribe("news", move |message: String| {
            let _ = tx.send(message);
        })
        .expect("subscribe");
    session.start().expect("start");

    let mut first = server.accept().await;
    first.subscribed("news").await;
    next_event(&mut events, is_connected).await;

    // No Disconnect frame: the socket just goes away.
    drop(first);
    next_event(&mut events, |event| {
        *event == SessionEvent::Disconnected { expected: false }
    })
    .await;

    let mut second = server.accept().await;
    second.subscribed("news").await;
    next_event(&mut events, is_connected).await;

    let stats = session.stats();
    assert_eq!(stats.reconnects_scheduled, 1);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.connects, 2);
    assert_eq!(*origins.lock(), vec![ErrorOrigin::Read]);

    second
        .send(Frame::Data {
            topic: "news".into(),
            payload: Bytes::from_static(b"after"),
        })
        .await;
    let message = timeout(WAIT, received.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(message, "after");

    session.close(false).await.expect("close");
}

#[tokio::test]
async fn unknown_frame_type_drops_the_connection_and_reconnects() {
    let server = RawServer::bind().await;
    let (handler, origins) = recording_handler();
    let session = ClientSession::with_error_handler(server.config(), Utf8Codec, handler);
    let (mut events, _guard) = watch_events(&session);
    let _subscription = session.subscribe("news", |_: String| {}).expect("subscribe");
    session.start().expect("start");

    let mut first = server.accept().await;
    first.subscribed("news").await;
    next_event(&mut events, is_connected).await;

    first.writer.write_encoded(&[0x2A]).await.expect("write garbage");
    next_event(&mut events, |event| {
        *event == SessionEvent::Disconnected { expected: false }
    })
    .await;

    let mut second = server.accept().await;
    second.subscribed("news").await;
    next_event(&mut events, is_connected).await;
    assert_eq!(session.stats().reconnects_scheduled, 1);
    assert_eq!(*origins.lock(), vec![ErrorOrigin::Protocol]);

    session.close(false).await.expect("close");
}

#[tokio::test]
async fn late_and_unknown_replies_are_discarded() {
    let server = RawServer::bind().await;
    let session = ClientSession::new(server.config(), Utf8Codec);
    let (mut events, _guard) = watch_events(&session);
    let (tx, mut received) = mpsc::unbounded_channel();
    let _subscription = session
        .subscribe("news", move |message: String| {
            let _ = tx.send(message);
        })
        .expect("subscribe");
    session.start().expect("start");
    let mut peer = server.accept().await;
    peer.subscribed("news").await;
    next_event(&mut events, is_connected).await;

    let replies = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let reply_count = Arc::clone(&replies);
    let timeout_count = Arc::clone(&timeouts);
    let request_id = session
        .request(
            "rpc",
            &"ping".to_string(),
            move |_reply: String| {
                reply_count.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                timeout_count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        )
        .expect("request");
    let request = peer
        .expect_frame(|frame| matches!(frame, Frame::DataRequest { .. }))
        .await;
    assert!(matches!(request, Frame::DataRequest { request_id: id, .. } if id == request_id));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    peer.send(Frame::Reply {
        request_id,
        topic: "rpc".into(),
        payload: Bytes::from_static(b"late"),
    })
    .await;
    peer.send(Frame::Reply {
        request_id: request_id.wrapping_add(1000),
        topic: "rpc".into(),
        payload: Bytes::from_static(b"stray"),
    })
    .await;
    // Delivered only if the connection survived both replies.
    peer.send(Frame::Data {
        topic: "news".into(),
        payload: Bytes::from_static(b"still here"),
    })
    .await;
    let message = timeout(WAIT, received.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(message, "still here");

    assert_eq!(replies.load(Ordering::SeqCst), 0);
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.stats().disconnects, 0);
    assert_eq!(session.pending_requests(), 0);

    session.close(false).await.expect("close");
}

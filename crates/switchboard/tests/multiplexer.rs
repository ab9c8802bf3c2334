//! End-to-end tests driving the multiplexer the way a transport does:
//! inbound frames through `handle_in`, async events through `handle_info`,
//! and outbound frames observed on the transport channel.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::prelude::*;
use switchboard::{Frame, Term};
use tokio::sync::mpsc;

static TERMINATIONS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static VAULT_JOINS: AtomicUsize = AtomicUsize::new(0);

#[derive(serde::Serialize, serde::Deserialize)]
struct Tick {
    n: u32,
}

struct RoomChannel;

#[async_trait]
impl Channel for RoomChannel {
    async fn join(_topic: &str, payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
        if payload.get("deny").is_some() {
            JoinResult::Error(json!({"reason": "denied"}))
        } else {
            JoinResult::Ok(RoomChannel)
        }
    }

    async fn handle_in(&mut self, event: &str, payload: Value, socket: &mut Socket) -> HandleResult {
        match event {
            "msg" => HandleResult::ok(json!({"echo": payload["body"]})),
            "greeting" => HandleResult::ok(json!({"greeting": socket.get_assign("greeting")})),
            "boom" => panic!("boom"),
            "shout" => {
                socket.broadcast_from("shout", payload).unwrap();
                HandleResult::ok(json!({}))
            }
            "stop" => HandleResult::StopReply(ExitReason::Normal, ReplyStatus::Ok, json!({"bye": true})),
            "arm_timeout" => HandleResult::NoReplyHint(Hint::Timeout(Duration::from_millis(10))),
            _ => HandleResult::NoReply,
        }
    }

    async fn handle_info(&mut self, info: Info, socket: &mut Socket) -> HandleResult {
        match info {
            Info::Timeout => {
                socket.push("timed_out", json!({})).unwrap();
            }
            Info::User(term) => {
                if let Some(tick) = term.decode::<Tick>() {
                    socket.push("tick", json!({"n": tick.n})).unwrap();
                }
            }
        }
        HandleResult::NoReply
    }

    async fn terminate(&mut self, reason: &ExitReason, _socket: &mut Socket) {
        TERMINATIONS.lock().unwrap().push(reason.to_string());
    }
}

struct VaultChannel;

#[async_trait]
impl Channel for VaultChannel {
    const INTERCEPTS: &'static [&'static str] = &["classified"];

    async fn join(_topic: &str, _payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
        VAULT_JOINS.fetch_add(1, Ordering::SeqCst);
        JoinResult::Ok(VaultChannel)
    }

    async fn handle_in(&mut self, _event: &str, _payload: Value, _socket: &mut Socket) -> HandleResult {
        HandleResult::NoReply
    }

    async fn handle_out(&mut self, event: &str, _payload: Value, socket: &mut Socket) -> HandleResult {
        socket.push(event, json!({"redacted": true})).unwrap();
        HandleResult::NoReply
    }
}

struct StuckChannel;

#[async_trait]
impl Channel for StuckChannel {
    async fn join(_topic: &str, _payload: Value, _socket: &mut Socket) -> JoinResult<Self> {
        JoinResult::Ok(StuckChannel)
    }

    async fn handle_in(&mut self, event: &str, _payload: Value, _socket: &mut Socket) -> HandleResult {
        if event == "hang" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        HandleResult::NoReply
    }
}

struct UserSocket;

#[async_trait]
impl SocketHandler for UserSocket {
    async fn connect(
        &self,
        params: Value,
        socket: Socket,
        _info: &ConnectInfo,
    ) -> Result<Socket, ConnectError> {
        if params.get("reject").is_some() {
            return Err(ConnectError::Refused);
        }
        Ok(socket.assign("params", params))
    }

    fn id(&self, socket: &Socket) -> Option<String> {
        socket
            .get_assign("params")
            .and_then(|p| p.get("user_id"))
            .and_then(Value::as_str)
            .map(|user_id| format!("users_socket:{}", user_id))
    }
}

fn registry() -> ChannelRegistry {
    ChannelRegistry::builder()
        .channel::<RoomChannel>("room:*", ChannelOpts::new().assign("greeting", json!("hello")))
        .channel::<VaultChannel>("vault:*", ChannelOpts::new())
        .channel::<StuckChannel>("stuck:*", ChannelOpts::new())
        .transport(
            "websocket",
            SerializerSpec::new()
                .with(JsonSerializer, "~2.0")
                .with(BinarySerializer, "~1.0"),
        )
        .build()
}

fn config(bus: Arc<LocalBus>) -> SocketConfig {
    SocketConfig {
        handler: Arc::new(UserSocket),
        registry: Arc::new(registry()),
        bus,
        serializer: Arc::new(JsonSerializer),
        options: SocketOptions::default(),
    }
}

struct Conn {
    mux: Multiplexer,
    transport: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

async fn connect_with(bus: Arc<LocalBus>, params: Value) -> Conn {
    let mut mux = Multiplexer::connect(config(bus), params, ConnectInfo::default())
        .await
        .expect("connect");
    let (transport_tx, transport) = mpsc::unbounded_channel();
    mux.init(transport_tx);
    let events = mux.take_events().expect("events mailbox");
    Conn { mux, transport, events }
}

async fn connect(bus: Arc<LocalBus>) -> Conn {
    connect_with(bus, json!({})).await
}

fn text(raw: impl AsRef<str>) -> Frame {
    Frame::text(raw.as_ref().as_bytes().to_vec())
}

fn decode(frames: Vec<Frame>) -> Vec<Value> {
    frames
        .into_iter()
        .map(|f| serde_json::from_slice(&f.bytes).unwrap())
        .collect()
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("frame within 1s")
        .expect("transport open");
    serde_json::from_slice(&frame.bytes).unwrap()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SocketEvent>) -> SocketEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event within 1s")
        .expect("event channel open")
}

async fn join(conn: &mut Conn, topic: &str, join_ref: &str) -> Vec<Value> {
    let raw = format!(r#"["{join_ref}","{join_ref}","{topic}","phx_join",{{}}]"#);
    decode(conn.mux.handle_in(text(raw)).await)
}

#[tokio::test]
async fn heartbeat_replies_with_the_same_ref() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    for _ in 0..2 {
        let replies = decode(
            conn.mux
                .handle_in(text(r#"[null,"1","phoenix","heartbeat",{}]"#))
                .await,
        );
        assert_eq!(
            replies,
            vec![json!([null, "1", "phoenix", "phx_reply", {"status": "ok", "payload": {}}])]
        );
    }
    assert!(conn.mux.joined_topics().is_empty());
}

#[tokio::test]
async fn join_and_echo() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    let replies = join(&mut conn, "room:42", "7").await;
    assert_eq!(
        replies,
        vec![json!(["7", "7", "room:42", "phx_reply", {"status": "ok", "payload": {}}])]
    );

    let none = conn
        .mux
        .handle_in(text(r#"["7","8","room:42","msg",{"body":"hi"}]"#))
        .await;
    assert!(none.is_empty());

    let reply = next_frame(&mut conn.transport).await;
    assert_eq!(
        reply,
        json!(["7", "8", "room:42", "phx_reply", {"status": "ok", "payload": {"echo": "hi"}}])
    );

    conn.mux.terminate().await;
}

#[tokio::test]
async fn unmatched_topic_is_refused() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    let replies = decode(
        conn.mux
            .handle_in(text(r#"[null,"3","nope:1","phx_join",{}]"#))
            .await,
    );
    assert_eq!(
        replies,
        vec![json!([null, "3", "nope:1", "phx_reply",
            {"status": "error", "payload": {"reason": "unmatched topic"}}])]
    );
    assert!(conn.mux.joined_topics().is_empty());

    // Same answer for a non-join event on an unjoined topic.
    let replies = decode(
        conn.mux
            .handle_in(text(r#"[null,"4","room:99","msg",{}]"#))
            .await,
    );
    assert_eq!(replies[0][4]["payload"]["reason"], "unmatched topic");
}

#[tokio::test]
async fn denied_join_returns_the_callback_payload() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    let replies = decode(
        conn.mux
            .handle_in(text(r#"["5","5","room:private","phx_join",{"deny":true}]"#))
            .await,
    );
    assert_eq!(
        replies,
        vec![json!(["5", "5", "room:private", "phx_reply",
            {"status": "error", "payload": {"reason": "denied"}}])]
    );
    assert!(conn.mux.joined_topics().is_empty());
}

#[tokio::test]
async fn duplicate_join_closes_the_old_worker_first() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    join(&mut conn, "room:42", "7").await;
    TERMINATIONS.lock().unwrap().clear();

    let replies = join(&mut conn, "room:42", "9").await;
    assert_eq!(
        replies,
        vec![json!(["9", "9", "room:42", "phx_reply", {"status": "ok", "payload": {}}])]
    );
    assert_eq!(conn.mux.joined_topics(), vec!["room:42"]);

    // The old worker's terminate ran with a closed reason.
    assert!(TERMINATIONS
        .lock()
        .unwrap()
        .iter()
        .any(|r| r == "shutdown:closed"));

    // Its graceful-exit notification is stale and emits nothing.
    let event = next_event(&mut conn.events).await;
    let flow = conn.mux.handle_info(event).await;
    assert!(matches!(flow, Flow::Continue(frames) if frames.is_empty()));
    assert_eq!(conn.mux.joined_topics(), vec!["room:42"]);

    conn.mux.terminate().await;
}

#[tokio::test]
async fn crash_emits_one_phx_error_and_allows_rejoin() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    join(&mut conn, "room:42", "7").await;
    let none = conn
        .mux
        .handle_in(text(r#"["7","10","room:42","boom",{}]"#))
        .await;
    assert!(none.is_empty());

    let event = next_event(&mut conn.events).await;
    let flow = conn.mux.handle_info(event).await;
    let frames = match flow {
        Flow::Continue(frames) => decode(frames),
        Flow::Stop(_) => panic!("crash must not stop the connection"),
    };
    assert_eq!(frames, vec![json!(["7", "7", "room:42", "phx_error", {}])]);
    assert!(conn.mux.joined_topics().is_empty());

    // No further frames for the topic, and a rejoin succeeds.
    let replies = join(&mut conn, "room:42", "11").await;
    assert_eq!(replies[0][4]["status"], "ok");

    conn.mux.terminate().await;
}

#[tokio::test]
async fn leave_replies_through_the_graceful_exit() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    join(&mut conn, "room:42", "7").await;
    let none = conn
        .mux
        .handle_in(text(r#"["7","12","room:42","phx_leave",{}]"#))
        .await;
    assert!(none.is_empty());

    let event = next_event(&mut conn.events).await;
    let flow = conn.mux.handle_info(event).await;
    let frames = match flow {
        Flow::Continue(frames) => decode(frames),
        Flow::Stop(_) => panic!("leave must not stop the connection"),
    };
    assert_eq!(
        frames,
        vec![json!(["7", "12", "room:42", "phx_reply", {"status": "ok", "payload": {}}])]
    );
    assert!(conn.mux.joined_topics().is_empty());
}

#[tokio::test]
async fn stop_with_reply_reaches_the_client() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;

    join(&mut conn, "room:42", "7").await;
    conn.mux
        .handle_in(text(r#"["7","13","room:42","stop",{}]"#))
        .await;

    let event = next_event(&mut conn.events).await;
    let flow = conn.mux.handle_info(event).await;
    let frames = match flow {
        Flow::Continue(frames) => decode(frames),
        Flow::Stop(_) => panic!("normal stop must not stop the connection"),
    };
    assert_eq!(
        frames,
        vec![json!(["7", "13", "room:42", "phx_reply", {"status": "ok", "payload": {"bye": true}}])]
    );
    assert!(conn.mux.joined_topics().is_empty());
}

#[tokio::test]
async fn forced_disconnect_stops_the_connection() {
    let bus = Arc::new(LocalBus::new());
    let mut conn = connect_with(bus.clone(), json!({"user_id": "42"})).await;
    assert_eq!(conn.mux.socket().id.as_deref(), Some("users_socket:42"));

    let mut broadcasts = conn.mux.take_broadcasts().expect("id-topic subscription");
    join(&mut conn, "room:42", "7").await;

    bus.publish(None, Broadcast::new("users_socket:42", "disconnect", json!({})))
        .unwrap();

    let broadcast = tokio::time::timeout(Duration::from_secs(1), broadcasts.recv())
        .await
        .expect("broadcast within 1s")
        .expect("broadcast channel open");
    let flow = conn.mux.handle_info(SocketEvent::Broadcast(broadcast)).await;
    assert!(matches!(flow, Flow::Stop(_)));

    conn.mux.terminate().await;
    assert!(conn.mux.joined_topics().is_empty());
}

#[tokio::test]
async fn fanout_skips_publisher_and_uses_the_fastlane() {
    let bus = Arc::new(LocalBus::new());
    let mut alice = connect(bus.clone()).await;
    let mut bob = connect(bus).await;

    join(&mut alice, "room:7", "1").await;
    join(&mut bob, "room:7", "2").await;

    alice
        .mux
        .handle_in(text(r#"["1","20","room:7","shout",{"body":"hey"}]"#))
        .await;

    // Bob's transport gets the fastlane-encoded broadcast; it carries no refs.
    let frame = next_frame(&mut bob.transport).await;
    assert_eq!(frame, json!([null, null, "room:7", "shout", {"body": "hey"}]));

    // Alice only gets her reply, never her own broadcast.
    let reply = next_frame(&mut alice.transport).await;
    assert_eq!(reply[3], "phx_reply");
    assert!(alice.transport.try_recv().is_err());

    alice.mux.terminate().await;
    bob.mux.terminate().await;
}

#[tokio::test]
async fn intercepted_events_run_through_handle_out() {
    let bus = Arc::new(LocalBus::new());
    let mut conn = connect(bus.clone()).await;
    join(&mut conn, "vault:1", "1").await;

    // Intercepted: the channel rewrites the payload, and the push carries
    // the join ref.
    bus.publish(None, Broadcast::new("vault:1", "classified", json!({"secret": "x"})))
        .unwrap();
    let frame = next_frame(&mut conn.transport).await;
    assert_eq!(frame, json!(["1", null, "vault:1", "classified", {"redacted": true}]));

    // Not intercepted: fastlane passes it through verbatim, no refs.
    bus.publish(None, Broadcast::new("vault:1", "open", json!({"n": 1})))
        .unwrap();
    let frame = next_frame(&mut conn.transport).await;
    assert_eq!(frame, json!([null, null, "vault:1", "open", {"n": 1}]));

    conn.mux.terminate().await;
}

#[tokio::test]
async fn info_terms_reach_handle_info() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;
    join(&mut conn, "room:42", "7").await;

    let channel = conn.mux.channel_ref("room:42").expect("joined channel");
    assert!(channel.send_info(Term::encode(&Tick { n: 3 })));

    let frame = next_frame(&mut conn.transport).await;
    assert_eq!(frame, json!(["7", null, "room:42", "tick", {"n": 3}]));

    conn.mux.terminate().await;
}

#[tokio::test]
async fn idle_timeout_hint_fires_handle_info() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;
    join(&mut conn, "room:42", "7").await;

    conn.mux
        .handle_in(text(r#"["7","21","room:42","arm_timeout",{}]"#))
        .await;

    let frame = next_frame(&mut conn.transport).await;
    assert_eq!(frame, json!(["7", null, "room:42", "timed_out", {}]));

    conn.mux.terminate().await;
}

#[tokio::test]
async fn forced_close_kills_a_stuck_worker() {
    let bus = Arc::new(LocalBus::new());
    let mut mux = Multiplexer::connect(
        SocketConfig {
            options: SocketOptions {
                close_timeout: Duration::from_millis(50),
            },
            ..config(bus)
        },
        json!({}),
        ConnectInfo::default(),
    )
    .await
    .unwrap();
    let (transport_tx, _transport) = mpsc::unbounded_channel();
    mux.init(transport_tx);

    let replies = decode(
        mux.handle_in(text(r#"["1","1","stuck:1","phx_join",{}]"#))
            .await,
    );
    assert_eq!(replies[0][4]["status"], "ok");

    // The worker blocks inside handle_in and ignores the close command.
    mux.handle_in(text(r#"["1","2","stuck:1","hang",{}]"#)).await;

    let start = tokio::time::Instant::now();
    mux.terminate().await;
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(conn_is_empty(&mux));
}

fn conn_is_empty(mux: &Multiplexer) -> bool {
    mux.joined_topics().is_empty()
}

#[tokio::test]
async fn refused_connect_fails_the_connection() {
    let result = Multiplexer::connect(
        config(Arc::new(LocalBus::new())),
        json!({"reject": true}),
        ConnectInfo::default(),
    )
    .await;
    assert!(matches!(result, Err(ConnectError::Refused)));
}

#[tokio::test]
async fn transport_serializers_negotiate_by_version() {
    let registry = registry();
    let spec = registry.serializers("websocket").expect("declared transport");
    assert_eq!(spec.negotiate("2.0.0").map(|s| s.name()), Some("json"));
    assert_eq!(spec.negotiate("1.4.2").map(|s| s.name()), Some("msgpack"));
    assert!(spec.negotiate("3.0.0").is_none());
}

#[tokio::test]
async fn route_assigns_are_merged_on_join() {
    let mut conn = connect(Arc::new(LocalBus::new())).await;
    join(&mut conn, "room:42", "7").await;

    conn.mux
        .handle_in(text(r#"["7","22","room:42","greeting",{}]"#))
        .await;

    let reply = next_frame(&mut conn.transport).await;
    assert_eq!(reply[4]["payload"]["greeting"], "hello");

    conn.mux.terminate().await;
}

#[tokio::test]
async fn joins_run_the_channel_join_callback() {
    let before = VAULT_JOINS.load(Ordering::SeqCst);
    let mut conn = connect(Arc::new(LocalBus::new())).await;
    join(&mut conn, "vault:2", "8").await;
    // Other tests join vault topics concurrently, so only monotonicity is
    // checked here.
    assert!(VAULT_JOINS.load(Ordering::SeqCst) > before);

    conn.mux.terminate().await;
}

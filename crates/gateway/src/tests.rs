use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use audit::{
    AuditQueue,
    AuditQueueConfig,
    MemoryAuditLog,
};
use pretty_assertions::assert_eq;
use store::{
    KeySpace,
    MemoryStore,
};
use sync_types::{
    Participant,
    ParticipantId,
    SessionState,
    SessionStatus,
    SyncMode,
};
use tokio::{
    sync::mpsc,
    time::timeout,
};

use super::*;

#[derive(Debug, PartialEq)]
enum WireFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

struct MockSink {
    wire: mpsc::Sender<WireFrame>,
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.wire
            .send(WireFrame::Text(text))
            .await
            .map_err(|_| anyhow::anyhow!("client gone"))
    }

    async fn send_ping(&mut self) -> anyhow::Result<()> {
        self.wire
            .send(WireFrame::Ping)
            .await
            .map_err(|_| anyhow::anyhow!("client gone"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> anyhow::Result<()> {
        self.wire
            .send(WireFrame::Close {
                code,
                reason: reason.to_owned(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("client gone"))
    }
}

struct MockStream {
    frames: mpsc::UnboundedReceiver<anyhow::Result<InboundFrame>>,
}

#[async_trait]
impl SocketStream for MockStream {
    async fn recv(&mut self) -> Option<anyhow::Result<InboundFrame>> {
        self.frames.recv().await
    }
}

/// One fake client attached to a gateway. `wire` capacity is deliberately
/// small: a test that never reads simulates a stalled consumer.
struct TestClient {
    to_server: mpsc::UnboundedSender<anyhow::Result<InboundFrame>>,
    wire: mpsc::Receiver<WireFrame>,
}

impl TestClient {
    fn connect(gateway: &Arc<FanoutGateway>, session_id: SessionId) -> Self {
        let (wire_tx, wire_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .handle_connection(
                    Box::new(MockSink { wire: wire_tx }),
                    Box::new(MockStream { frames: inbound_rx }),
                    session_id,
                )
                .await;
        });
        Self {
            to_server: inbound_tx,
            wire: wire_rx,
        }
    }

    fn send_text(&self, text: &str) {
        self.to_server
            .send(Ok(InboundFrame::Text(text.to_owned())))
            .unwrap();
    }

    fn send_pong(&self) {
        self.to_server.send(Ok(InboundFrame::Pong)).unwrap();
    }

    async fn next_frame(&mut self) -> WireFrame {
        timeout(Duration::from_secs(2), self.wire.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    async fn next_json(&mut self) -> serde_json::Value {
        match self.next_frame().await {
            WireFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

}

struct Instance {
    manager: Arc<state_manager::StateManager>,
    gateway: Arc<FanoutGateway>,
}

async fn instance(store: &Arc<MemoryStore>, keys: &KeySpace, config: GatewayConfig) -> Instance {
    let queue = Arc::new(AuditQueue::new(
        Arc::new(MemoryAuditLog::new()),
        AuditQueueConfig {
            worker_count: 1,
            ..AuditQueueConfig::default()
        },
    ));
    let manager = Arc::new(state_manager::StateManager::new(
        store.clone(),
        queue,
        keys.clone(),
        Duration::from_secs(60),
    ));
    let gateway = FanoutGateway::start(manager.clone(), config)
        .await
        .unwrap();
    Instance { manager, gateway }
}

fn quiet_config() -> GatewayConfig {
    GatewayConfig {
        // Long enough that no probe fires during a test.
        heartbeat_interval: Duration::from_secs(60),
        send_queue_depth: 8,
    }
}

fn fixture_state(session_id: SessionId) -> SessionState {
    let now = chrono::Utc::now();
    let participant = |id: &str, index: u32| Participant {
        participant_id: ParticipantId::new(id).unwrap(),
        participant_index: index,
        total_time_ms: 60_000,
        time_used_ms: 0,
        time_remaining_ms: 60_000,
        cycle_count: 0,
        is_active: false,
        has_expired: false,
        group_id: None,
    };
    SessionState {
        session_id,
        sync_mode: SyncMode::PerParticipant,
        status: SessionStatus::Pending,
        version: 1,
        participants: vec![participant("a", 0), participant("b", 1)],
        active_participant_id: None,
        total_time_ms: None,
        time_per_cycle_ms: None,
        increment_ms: 0,
        max_time_ms: None,
        cycle_started_at: None,
        session_started_at: None,
        session_completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn connected_message_greets_every_connection() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let session_id = SessionId::generate();
    let mut client = TestClient::connect(&node.gateway, session_id);
    let hello = client.next_json().await;
    assert_eq!(hello["type"], "CONNECTED");
    assert_eq!(hello["sessionId"], session_id.to_string());
    assert!(hello["timestamp"].is_string());
    assert_eq!(node.gateway.session_connection_count(session_id), 1);
}

#[tokio::test]
async fn local_fanout_reaches_every_subscriber() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let session_id = SessionId::generate();
    let mut client_a = TestClient::connect(&node.gateway, session_id);
    let mut client_b = TestClient::connect(&node.gateway, session_id);
    assert_eq!(client_a.next_json().await["type"], "CONNECTED");
    assert_eq!(client_b.next_json().await["type"], "CONNECTED");

    node.manager
        .create_session(fixture_state(session_id))
        .await
        .unwrap();

    for client in [&mut client_a, &mut client_b] {
        let update = client.next_json().await;
        assert_eq!(update["type"], "STATE_UPDATE");
        assert_eq!(update["sessionId"], session_id.to_string());
        assert_eq!(update["state"]["version"], 1);
    }
}

/// A mutation on instance 1 reaches clients connected to instance 2.
#[tokio::test]
async fn cross_instance_fanout() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node_1 = instance(&store, &keys, quiet_config()).await;
    let node_2 = instance(&store, &keys, quiet_config()).await;

    let session_id = SessionId::generate();
    let mut client_x = TestClient::connect(&node_1.gateway, session_id);
    let mut client_y = TestClient::connect(&node_2.gateway, session_id);
    assert_eq!(client_x.next_json().await["type"], "CONNECTED");
    assert_eq!(client_y.next_json().await["type"], "CONNECTED");

    let created = node_1
        .manager
        .create_session(fixture_state(session_id))
        .await
        .unwrap();
    node_1
        .manager
        .update_session(
            session_id,
            created.clone(),
            Some(created.version),
            audit::AuditEventType::SessionUpdated,
        )
        .await
        .unwrap();

    for client in [&mut client_x, &mut client_y] {
        let first = client.next_json().await;
        assert_eq!(first["type"], "STATE_UPDATE");
        assert_eq!(first["state"]["version"], 1);
        let second = client.next_json().await;
        assert_eq!(second["type"], "STATE_UPDATE");
        assert_eq!(second["state"]["version"], 2);
    }
}

#[tokio::test]
async fn deletion_says_goodbye_and_closes() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let session_id = SessionId::generate();
    node.manager
        .create_session(fixture_state(session_id))
        .await
        .unwrap();
    let mut client = TestClient::connect(&node.gateway, session_id);
    assert_eq!(client.next_json().await["type"], "CONNECTED");

    node.manager.delete_session(session_id).await.unwrap();

    let goodbye = client.next_json().await;
    assert_eq!(goodbye["type"], "SESSION_DELETED");
    assert_eq!(goodbye["sessionId"], session_id.to_string());
    let close = client.next_frame().await;
    assert_eq!(
        close,
        WireFrame::Close {
            code: CLOSE_NORMAL,
            reason: "Session deleted".to_owned(),
        }
    );
    wait_until(|| node.gateway.connection_count() == 0).await;
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let mut client = TestClient::connect(&node.gateway, SessionId::generate());
    assert_eq!(client.next_json().await["type"], "CONNECTED");

    client.send_text(r#"{"type":"PING"}"#);
    let pong = client.next_json().await;
    assert_eq!(pong["type"], "PONG");
    assert!(pong["timestamp"].is_string());
}

#[tokio::test]
async fn reconnect_resyncs_or_reports_missing() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    // Existing session: full state sync.
    let session_id = SessionId::generate();
    node.manager
        .create_session(fixture_state(session_id))
        .await
        .unwrap();
    let mut client = TestClient::connect(&node.gateway, session_id);
    assert_eq!(client.next_json().await["type"], "CONNECTED");
    client.send_text(r#"{"type":"RECONNECT"}"#);
    let sync = client.next_json().await;
    assert_eq!(sync["type"], "STATE_SYNC");
    assert_eq!(sync["state"]["version"], 1);
    assert_eq!(sync["state"]["status"], "pending");

    // Unknown session: typed error, connection stays open.
    let ghost_id = SessionId::generate();
    let mut ghost = TestClient::connect(&node.gateway, ghost_id);
    assert_eq!(ghost.next_json().await["type"], "CONNECTED");
    ghost.send_text(r#"{"type":"RECONNECT"}"#);
    let error = ghost.next_json().await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn bad_input_is_ignored_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let mut client = TestClient::connect(&node.gateway, SessionId::generate());
    assert_eq!(client.next_json().await["type"], "CONNECTED");

    client.send_text("{this is not json");
    client.send_text(r#"{"type":"SUBSCRIBE"}"#);
    client.send_text(r#"{"no_type_at_all":true}"#);

    // Still alive and answering.
    client.send_text(r#"{"type":"PING"}"#);
    assert_eq!(client.next_json().await["type"], "PONG");
}

#[tokio::test]
async fn heartbeat_probes_and_reaps_silent_connections() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(
        &store,
        &keys,
        GatewayConfig {
            heartbeat_interval: Duration::from_millis(50),
            send_queue_depth: 8,
        },
    )
    .await;

    let mut client = TestClient::connect(&node.gateway, SessionId::generate());
    assert_eq!(client.next_json().await["type"], "CONNECTED");

    // First interval: probe arrives.
    let probe = client.next_frame().await;
    assert_eq!(probe, WireFrame::Ping);

    // Answer it; we survive the next tick and get probed again.
    client.send_pong();
    let probe = client.next_frame().await;
    assert_eq!(probe, WireFrame::Ping);

    // Stay silent: the following tick reaps us.
    let close = client.next_frame().await;
    assert_eq!(
        close,
        WireFrame::Close {
            code: CLOSE_POLICY_VIOLATION,
            reason: "Heartbeat timeout".to_owned(),
        }
    );
    wait_until(|| node.gateway.connection_count() == 0).await;
}

#[tokio::test]
async fn slow_consumers_are_disconnected_not_waited_on() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(
        &store,
        &keys,
        GatewayConfig {
            heartbeat_interval: Duration::from_secs(60),
            send_queue_depth: 2,
        },
    )
    .await;

    let session_id = SessionId::generate();
    let created = node
        .manager
        .create_session(fixture_state(session_id))
        .await
        .unwrap();

    // This client never reads; its wire buffer and send queue fill up.
    let stalled = TestClient::connect(&node.gateway, session_id);

    let mut version = created.version;
    for _ in 0..64 {
        let state = node.manager.get_session(session_id).await.unwrap().unwrap();
        node.manager
            .update_session(
                session_id,
                state,
                Some(version),
                audit::AuditEventType::SessionUpdated,
            )
            .await
            .unwrap();
        version += 1;
        tokio::task::yield_now().await;
    }

    wait_until(|| node.gateway.connection_count() == 0).await;
    drop(stalled);
}

#[tokio::test]
async fn shutdown_closes_everything_with_going_away() {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::unique_for_test();
    let node = instance(&store, &keys, quiet_config()).await;

    let mut client = TestClient::connect(&node.gateway, SessionId::generate());
    assert_eq!(client.next_json().await["type"], "CONNECTED");

    node.gateway.shutdown().await;

    let close = loop {
        match client.next_frame().await {
            WireFrame::Close { code, reason } => break (code, reason),
            _ => continue,
        }
    };
    assert_eq!(close.0, CLOSE_GOING_AWAY);
    wait_until(|| node.gateway.connection_count() == 0).await;
}

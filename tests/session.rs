use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use fanout_hub::connection::Connection;
use fanout_hub::models::{MessageType, WsMessage};
use fanout_hub::session;
use fanout_hub::{Hub, HubConfig};

struct Client {
    conn: Arc<Connection>,
    to_server: UnboundedSender<Result<Message, Infallible>>,
    from_server: UnboundedReceiver<Message>,
    task: JoinHandle<()>,
}

impl Client {
    fn send_json(&self, value: serde_json::Value) {
        self.send(Message::Text(value.to_string().into()));
    }

    fn send(&self, frame: Message) {
        self.to_server.unbounded_send(Ok(frame)).unwrap();
    }

    /// Next text frame, skipping transport pings.
    async fn next_message(&mut self) -> WsMessage {
        loop {
            match timeout(Duration::from_secs(1), self.from_server.next()).await {
                Ok(Some(Message::Text(text))) => return WsMessage::decode(text.as_str()).unwrap(),
                Ok(Some(Message::Ping(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Wait for the server to send Close and end the stream.
    async fn expect_closed(mut self) {
        let frame = timeout(Duration::from_secs(1), async {
            loop {
                match self.from_server.next().await {
                    Some(Message::Ping(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(frame, Some(Message::Close(None)));
        timeout(Duration::from_secs(1), self.task).await.unwrap().unwrap();
    }
}

fn config() -> HubConfig {
    HubConfig {
        heartbeat_interval: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(10),
        shard_count: 2,
        broadcast_workers: 2,
        ..HubConfig::default()
    }
}

fn open(hub: &Hub, user: &str) -> Client {
    let (to_server, stream) = unbounded();
    let (sink, from_server) = unbounded();
    let (conn, rx) = hub.new_connection(user);
    let task = tokio::spawn(session::drive(hub.clone(), conn.clone(), rx, sink, stream));
    Client {
        conn,
        to_server,
        from_server,
        task,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn connect(hub: &Hub, user: &str) -> Client {
    let client = open(hub, user);
    let conn = client.conn.clone();
    eventually("registration", || conn.is_alive()).await;
    client
}

#[tokio::test]
async fn ping_gets_pong_and_refreshes_liveness() {
    let hub = Hub::start(config()).unwrap();
    let mut client = connect(&hub, "u1").await;
    let before = client.conn.last_heartbeat_ms();
    sleep(Duration::from_millis(5)).await;

    client.send_json(json!({"type": "ping"}));
    let reply = client.next_message().await;
    assert_eq!(reply.kind, MessageType::Pong);
    assert!(client.conn.last_heartbeat_ms() > before);

    client.send(Message::Binary(Bytes::from_static(br#"{"type":"ping"}"#)));
    assert_eq!(client.next_message().await.kind, MessageType::Pong);
    hub.shutdown().await;
}

#[tokio::test]
async fn group_join_ack_and_group_chat() {
    let hub = Hub::start(config()).unwrap();
    let mut alice = connect(&hub, "alice").await;
    let mut bob = connect(&hub, "bob").await;

    alice.send_json(json!({"type": "join_group", "data": "room"}));
    let ack = alice.next_message().await;
    assert_eq!(ack.kind, MessageType::GroupJoined);
    assert_eq!(ack.data, json!("room"));
    assert_eq!(hub.group_connection_count("room"), 1);

    bob.send_json(json!({
        "type": "chat",
        "data": {"text": "hello room"},
        "group": "room",
        "from": "mallory"
    }));
    let got = alice.next_message().await;
    assert_eq!(got.kind, MessageType::Chat);
    assert_eq!(got.from.as_deref(), Some("bob"));
    assert_eq!(got.data["text"], "hello room");
    assert!(got.timestamp > 0);

    alice.send_json(json!({"type": "leave_group", "data": "room"}));
    assert_eq!(alice.next_message().await.kind, MessageType::GroupLeft);
    assert_eq!(hub.group_connection_count("room"), 0);

    bob.send_json(json!({"type": "ping"}));
    assert_eq!(bob.next_message().await.kind, MessageType::Pong);
    hub.shutdown().await;
}

#[tokio::test]
async fn direct_chat_reaches_every_session_of_the_user() {
    let hub = Hub::start(config()).unwrap();
    let mut phone = connect(&hub, "u1").await;
    let mut laptop = connect(&hub, "u1").await;
    let sender = connect(&hub, "u2").await;

    sender.send_json(json!({"type": "chat", "data": {"text": "hey"}, "to": "u1"}));
    for client in [&mut phone, &mut laptop] {
        let got = client.next_message().await;
        assert_eq!(got.to.as_deref(), Some("u1"));
        assert_eq!(got.from.as_deref(), Some("u2"));
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_get_error_replies_and_keep_the_session() {
    let hub = Hub::start(config()).unwrap();
    let mut client = connect(&hub, "u1").await;

    client.send(Message::Text("{not json".into()));
    let reply = client.next_message().await;
    assert_eq!(reply.kind, MessageType::Error);

    client.send_json(json!({"type": "chat", "data": {"text": "x"}}));
    assert_eq!(client.next_message().await.kind, MessageType::Error);

    client.send_json(json!({"type": "join_group", "data": ""}));
    assert_eq!(client.next_message().await.kind, MessageType::Error);

    client.send_json(json!({"type": "notification", "data": "plain"}));
    assert_eq!(client.next_message().await.kind, MessageType::Error);

    assert!(client.conn.is_alive());
    assert_eq!(hub.connection_count(), 1);
    assert_eq!(hub.metrics().snapshot().malformed_frames, 4);
    hub.shutdown().await;
}

#[tokio::test]
async fn status_merges_metadata() {
    let hub = Hub::start(config()).unwrap();
    let mut client = connect(&hub, "u1").await;

    client.send_json(json!({"type": "status", "data": {"status": "away", "device": "web"}}));
    client.next_message().await;
    client.send_json(json!({"type": "status", "data": {"status": "online"}}));
    let reply = client.next_message().await;
    assert_eq!(reply.kind, MessageType::StatusUpdated);
    assert_eq!(reply.data, json!({"status": "online", "device": "web"}));
    assert_eq!(client.conn.metadata()["status"], "online");
    hub.shutdown().await;
}

#[tokio::test]
async fn notification_without_target_is_broadcast() {
    let hub = Hub::start(config()).unwrap();
    let sender = connect(&hub, "u1").await;
    let mut a = connect(&hub, "u2").await;
    let mut b = connect(&hub, "u3").await;

    sender.send_json(json!({"type": "notification", "data": {"title": "deploy"}}));
    assert_eq!(a.next_message().await.kind, MessageType::Notification);
    assert_eq!(b.next_message().await.kind, MessageType::Notification);
    hub.shutdown().await;
}

#[tokio::test]
async fn client_close_unregisters() {
    let hub = Hub::start(config()).unwrap();
    let client = connect(&hub, "u1").await;
    let conn = client.conn.clone();

    client.send(Message::Close(None));
    client.expect_closed().await;
    assert_eq!(hub.connection_count(), 0);
    assert!(conn.is_queue_closed());
    hub.shutdown().await;
}

#[tokio::test]
async fn dropped_transport_unregisters() {
    let hub = Hub::start(config()).unwrap();
    let client = connect(&hub, "u1").await;
    let Client {
        to_server, task, ..
    } = client;
    drop(to_server);
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(hub.connection_count(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn server_side_disconnect_sends_close() {
    let hub = Hub::start(config()).unwrap();
    let client = connect(&hub, "u1").await;
    assert_eq!(hub.disconnect_user("u1"), 1);
    client.expect_closed().await;
    eventually("unregistration", || hub.connection_count() == 0).await;
    hub.shutdown().await;
}

#[tokio::test]
async fn rejected_registration_closes_immediately() {
    let hub = Hub::start(HubConfig {
        max_connections: 1,
        ..config()
    })
    .unwrap();
    let _first = connect(&hub, "u1").await;
    let second = open(&hub, "u2");
    let conn = second.conn.clone();
    second.expect_closed().await;
    assert!(!conn.is_alive());
    assert_eq!(hub.connection_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_ends_the_session() {
    let hub = Hub::start(HubConfig {
        max_message_size: 64,
        ..config()
    })
    .unwrap();
    let client = connect(&hub, "u1").await;
    client.send_json(json!({"type": "chat", "data": {"text": "x".repeat(200)}, "to": "u2"}));
    client.expect_closed().await;
    assert_eq!(hub.connection_count(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn writer_sends_periodic_pings() {
    let hub = Hub::start(HubConfig {
        heartbeat_interval: Duration::from_millis(50),
        connection_timeout: Duration::from_secs(5),
        ..config()
    })
    .unwrap();
    let mut client = connect(&hub, "u1").await;
    let frame = timeout(Duration::from_secs(1), client.from_server.next())
        .await
        .unwrap();
    assert!(matches!(frame, Some(Message::Ping(_))));

    client.send(Message::Pong(Bytes::new()));
    sleep(Duration::from_millis(20)).await;
    assert!(client.conn.is_alive());
    hub.shutdown().await;
}

#[tokio::test]
async fn hub_shutdown_ends_sessions() {
    let hub = Hub::start(config()).unwrap();
    let client = connect(&hub, "u1").await;
    hub.shutdown().await;
    client.expect_closed().await;
}

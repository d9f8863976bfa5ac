//! Per-client connection state shared between the hub and the connection's own tasks.
//!
//! The hub holds an `Arc<Connection>` while it is registered. The transport itself
//! is owned by the reader/writer tasks; the hub only ever *asks* for it to be closed
//! through [`Connection::close`], which cancels the transport token those tasks select on.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::HubError;
use crate::models::{Payload, WsMessage};

pub type ConnectionId = String;

/// Item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Payload),
    /// Liveness probe; the writer turns it into a transport-level ping.
    Ping,
}

pub type OutboundReceiver = mpsc::Receiver<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport established, not registered yet.
    Connecting,
    /// Registered and alive.
    Active,
    /// Transport closing, waiting for unregistration.
    Draining,
    /// Removed from every index, outbound queue closed.
    Removed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ReadError,
    WriteError,
    ClientClosed,
    HeartbeatTimeout,
    Backpressure,
    CapacityExceeded,
    Requested,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Backpressure => "backpressure",
            CloseReason::CapacityExceeded => "capacity_exceeded",
            CloseReason::Requested => "requested",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    tx: mpsc::Sender<Outbound>,
    state: AtomicU8,
    groups: RwLock<HashSet<String>>,
    metadata: RwLock<Map<String, Value>>,
    /// Unix milliseconds of the last liveness signal from the client.
    last_heartbeat_ms: AtomicI64,
    connected_at: i64,
    transport: CancellationToken,
    queue: CancellationToken,
    queue_closed: AtomicBool,
}

impl Connection {
    /// Create a connection in the `Connecting` state. The receiver is the outbound
    /// queue the writer task drains. An empty `user_id` marks an anonymous client.
    pub fn new(user_id: impl Into<String>, queue_capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = now_millis();
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            groups: RwLock::new(HashSet::new()),
            metadata: RwLock::new(Map::new()),
            last_heartbeat_ms: AtomicI64::new(now),
            connected_at: now / 1000,
            transport: CancellationToken::new(),
            queue: CancellationToken::new(),
            queue_closed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Connecting -> Active. Returns false if the connection already left `Connecting`.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark not-alive and ask the owning tasks to close the transport.
    /// Returns true only for the call that performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        let moved = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ConnectionState::from_u8(s) {
                    ConnectionState::Connecting | ConnectionState::Active => {
                        Some(ConnectionState::Draining as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        self.transport.cancel();
        if moved {
            tracing::debug!(conn_id = %self.id, user_id = %self.user_id, reason = reason.as_str(), "connection closing");
        }
        moved
    }

    /// Terminal transition. Closes the outbound queue exactly once; later calls are no-ops.
    pub(crate) fn mark_removed(&self) -> bool {
        self.state.store(ConnectionState::Removed as u8, Ordering::Release);
        self.transport.cancel();
        if self.queue_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.queue.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_cancelled()
    }

    /// Resolves once the transport has been asked to close.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.transport.cancelled()
    }

    pub fn is_queue_closed(&self) -> bool {
        self.queue_closed.load(Ordering::Acquire)
    }

    /// Resolves once the hub has closed the outbound queue.
    pub fn queue_closed(&self) -> WaitForCancellationFuture<'_> {
        self.queue.cancelled()
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Outbound> {
        &self.tx
    }

    /// Record a liveness signal (pong frame or `ping` message).
    pub fn touch(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms()) > timeout_ms
    }

    /// Direct reply to this connection (acks, pongs, errors). Never blocks.
    pub fn reply(&self, msg: &WsMessage) -> Result<(), HubError> {
        if self.is_queue_closed() {
            return Err(HubError::ConnectionClosed(self.id.clone()));
        }
        let payload = msg.encode()?;
        self.tx.try_send(Outbound::Text(payload)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => HubError::ConnectionClosed(self.id.clone()),
        })
    }

    /// Queue a liveness probe without blocking. False when the queue is full or closed.
    pub(crate) fn probe(&self) -> bool {
        !self.is_queue_closed() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    pub(crate) fn insert_group(&self, group: &str) -> bool {
        self.groups.write().insert(group.to_string())
    }

    pub(crate) fn remove_group(&self, group: &str) -> bool {
        self.groups.write().remove(group)
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.read().contains(group)
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    pub fn merge_metadata(&self, update: Map<String, Value>) {
        let mut metadata = self.metadata.write();
        for (k, v) in update {
            metadata.insert(k, v);
        }
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.metadata.read().clone()
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_transitions() {
        let (conn, _rx) = Connection::new("u1", 4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_alive());

        assert!(conn.activate());
        assert!(!conn.activate());
        assert!(conn.is_alive());

        assert!(conn.close(CloseReason::Requested));
        assert!(!conn.close(CloseReason::Requested));
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.is_closed());

        assert!(conn.mark_removed());
        assert!(!conn.mark_removed());
        assert_eq!(conn.state(), ConnectionState::Removed);
        assert!(conn.is_queue_closed());
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = Connection::new("u1", 1);
        let (b, _rb) = Connection::new("u1", 1);
        assert_ne!(a.id(), b.id());
        assert!(!a.is_anonymous());
        let (anon, _r) = Connection::new("", 1);
        assert!(anon.is_anonymous());
    }

    #[tokio::test]
    async fn reply_reports_full_queue() {
        let (conn, mut rx) = Connection::new("u1", 1);
        let msg = WsMessage::error("nope");
        conn.reply(&msg).unwrap();
        assert!(matches!(conn.reply(&msg), Err(HubError::QueueFull(_))));
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));

        conn.mark_removed();
        assert!(matches!(conn.reply(&msg), Err(HubError::ConnectionClosed(_))));
    }

    #[test]
    fn metadata_merges() {
        let (conn, _rx) = Connection::new("u1", 1);
        conn.merge_metadata(json!({"status": "away", "device": "web"}).as_object().unwrap().clone());
        conn.merge_metadata(json!({"status": "online"}).as_object().unwrap().clone());
        let md = conn.metadata();
        assert_eq!(md["status"], "online");
        assert_eq!(md["device"], "web");
    }

    #[test]
    fn staleness() {
        let (conn, _rx) = Connection::new("u1", 1);
        let last = conn.last_heartbeat_ms();
        assert!(!conn.is_stale(last + 500, 1000));
        assert!(conn.is_stale(last + 1500, 1000));
    }
}

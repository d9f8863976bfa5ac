//! The hub: a handle over the registry, the control loop and the worker pools.
//!
//! All membership changes (register, unregister, join/leave group) travel through
//! bounded queues to a single control loop task, which is the only writer of the
//! registry. Fanout reads go through per-shard locks. `Hub` is cheap to clone and
//! is passed explicitly to every collaborator (HTTP handlers, sessions).

mod control;
mod workers;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backpressure::{BackpressurePolicy, SendOutcome};
use crate::config::{ConfigSummary, HeartbeatMode, HubConfig};
use crate::connection::{CloseReason, Connection, OutboundReceiver};
use crate::error::{HubError, HubResult};
use crate::metrics::{HubMetrics, MetricsSnapshot};
use crate::models::{now_unix, Payload, WsMessage};
use crate::ws_registry::ConnectionRegistry;

use control::ControlLoop;
use workers::BroadcastJob;

/// Utilization at or above this percentage reports `warning`.
const WARNING_UTILIZATION: f64 = 90.0;

pub(crate) struct RegisterRequest {
    conn: Arc<Connection>,
    ack: oneshot::Sender<HubResult<()>>,
}

pub(crate) struct UnregisterRequest {
    conn: Arc<Connection>,
    ack: Option<oneshot::Sender<bool>>,
}

pub(crate) enum MembershipChange {
    Join {
        conn: Arc<Connection>,
        group: String,
        ack: oneshot::Sender<HubResult<bool>>,
    },
    Leave {
        conn: Arc<Connection>,
        group: String,
        ack: oneshot::Sender<HubResult<bool>>,
    },
}

/// Which route a delivery came from; broadcast drops are expected and logged quietly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    User,
    Group,
    Broadcast,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Group => "group",
            Scope::Broadcast => "broadcast",
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: HubConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) metrics: HubMetrics,
    pub(crate) policy: BackpressurePolicy,
    pub(crate) cancel: CancellationToken,
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    membership_tx: mpsc::Sender<MembershipChange>,
    dispatch_tx: mpsc::Sender<WsMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: i64,
}

impl Shared {
    /// Offer a serialized frame to one connection under the backpressure policy and
    /// account for the outcome.
    pub(crate) async fn deliver(
        &self,
        conn: &Arc<Connection>,
        payload: Payload,
        scope: Scope,
    ) -> SendOutcome {
        let outcome = self
            .policy
            .try_send(conn, payload, || {
                self.metrics.message_dropped();
                match scope {
                    Scope::Broadcast => {
                        debug!(conn_id = %conn.id(), "outbound queue full, broadcast frame dropped")
                    }
                    Scope::User | Scope::Group => warn!(
                        conn_id = %conn.id(),
                        user_id = %conn.user_id(),
                        scope = scope.as_str(),
                        "outbound queue full, frame dropped"
                    ),
                }
            })
            .await;
        match outcome {
            SendOutcome::Delivered => self.metrics.message_sent(),
            SendOutcome::Evicted => {
                warn!(conn_id = %conn.id(), user_id = %conn.user_id(), "slow consumer closed");
                self.metrics.connection_evicted(CloseReason::Backpressure);
                self.request_unregister(conn);
            }
            SendOutcome::Dropped | SendOutcome::Closed => {}
        }
        outcome
    }

    /// Queue an unregistration without waiting for it.
    pub(crate) fn request_unregister(&self, conn: &Arc<Connection>) {
        let req = UnregisterRequest {
            conn: conn.clone(),
            ack: None,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.unregister_tx.try_send(req) {
            warn!(conn_id = %conn.id(), "unregister queue full, deferring removal to the next heartbeat tick");
        }
    }

    /// Draining -> Removed. Only called from the control loop.
    pub(crate) fn remove_connection(&self, conn: &Connection) -> bool {
        let removed = self.registry.remove(conn);
        conn.mark_removed();
        if removed {
            self.metrics.connection_unregistered();
            info!(
                conn_id = %conn.id(),
                user_id = %conn.user_id(),
                total = self.registry.len(),
                "connection unregistered"
            );
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_connections: usize,
    pub max_connections: usize,
    pub connection_usage: f64,
    pub hub_running: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub max_connections: usize,
    pub connection_usage: f64,
    pub users: usize,
    pub groups: usize,
    pub shard_sizes: Vec<usize>,
    pub node_id: Option<String>,
    pub running: bool,
    pub uptime_secs: i64,
    pub config: ConfigSummary,
    pub metrics: MetricsSnapshot,
}

#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Validate `config` and spawn the control loop and worker pools on the current
    /// Tokio runtime.
    pub fn start(config: HubConfig) -> HubResult<Self> {
        Self::start_with_token(config, CancellationToken::new())
    }

    /// Like [`Hub::start`], but the hub also stops when `parent` is cancelled.
    pub fn start_with_token(config: HubConfig, parent: CancellationToken) -> HubResult<Self> {
        config.validate()?;

        let (register_tx, register_rx) = mpsc::channel(config.control_queue_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.control_queue_capacity);
        let (membership_tx, membership_rx) = mpsc::channel(config.control_queue_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity);
        let (job_tx, job_rx) = flume::bounded::<BroadcastJob>(config.dispatch_queue_capacity);
        let ping = (config.heartbeat_mode == HeartbeatMode::GlobalSweep)
            .then(|| flume::bounded::<usize>(config.shard_count));

        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(config.max_connections, config.shard_count),
            metrics: HubMetrics::new()?,
            policy: BackpressurePolicy::from_config(&config),
            cancel: parent.child_token(),
            register_tx,
            unregister_tx,
            membership_tx,
            dispatch_tx,
            tasks: Mutex::new(Vec::new()),
            started_at: now_unix(),
            config,
        });

        let mut tasks = Vec::new();
        for worker in 0..shared.config.broadcast_workers {
            tasks.push(tokio::spawn(workers::broadcast_worker(
                worker,
                shared.clone(),
                job_rx.clone(),
            )));
        }
        let ping_tx = match ping {
            Some((ping_tx, ping_rx)) => {
                for worker in 0..shared.config.ping_workers {
                    tasks.push(tokio::spawn(workers::ping_worker(
                        worker,
                        shared.clone(),
                        ping_rx.clone(),
                    )));
                }
                Some(ping_tx)
            }
            None => None,
        };

        let control = ControlLoop::new(shared.clone(), job_tx, ping_tx);
        tasks.push(tokio::spawn(control.run(
            register_rx,
            unregister_rx,
            membership_rx,
            dispatch_rx,
        )));
        *shared.tasks.lock() = tasks;

        info!(
            max_connections = shared.config.max_connections,
            shards = shared.config.shard_count,
            broadcast_workers = shared.config.broadcast_workers,
            heartbeat_mode = ?shared.config.heartbeat_mode,
            "hub started"
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.shared.metrics
    }

    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// A connection sized with this hub's outbound queue capacity.
    pub fn new_connection(&self, user_id: impl Into<String>) -> (Arc<Connection>, OutboundReceiver) {
        Connection::new(user_id, self.shared.config.outbound_queue_capacity)
    }

    /// Register through the control loop. On rejection (capacity, stopped hub) the
    /// connection's transport has already been asked to close.
    pub async fn register(&self, conn: Arc<Connection>) -> HubResult<()> {
        let (ack, done) = oneshot::channel();
        let req = RegisterRequest {
            conn: conn.clone(),
            ack,
        };
        if self.shared.register_tx.send(req).await.is_err() {
            conn.close(CloseReason::Shutdown);
            return Err(HubError::Stopped);
        }
        done.await.unwrap_or_else(|_| {
            conn.close(CloseReason::Shutdown);
            Err(HubError::Stopped)
        })
    }

    /// Remove from every index and close the outbound queue. Idempotent; returns
    /// whether this call removed a registered connection.
    pub async fn unregister(&self, conn: Arc<Connection>) -> bool {
        let (ack, done) = oneshot::channel();
        let req = UnregisterRequest {
            conn: conn.clone(),
            ack: Some(ack),
        };
        if self.shared.unregister_tx.send(req).await.is_err() {
            conn.mark_removed();
            return false;
        }
        done.await.unwrap_or(false)
    }

    pub async fn join_group(&self, conn: &Arc<Connection>, group: &str) -> HubResult<bool> {
        let (ack, done) = oneshot::channel();
        let change = MembershipChange::Join {
            conn: conn.clone(),
            group: group.to_string(),
            ack,
        };
        self.membership(change, done).await
    }

    pub async fn leave_group(&self, conn: &Arc<Connection>, group: &str) -> HubResult<bool> {
        let (ack, done) = oneshot::channel();
        let change = MembershipChange::Leave {
            conn: conn.clone(),
            group: group.to_string(),
            ack,
        };
        self.membership(change, done).await
    }

    async fn membership(
        &self,
        change: MembershipChange,
        done: oneshot::Receiver<HubResult<bool>>,
    ) -> HubResult<bool> {
        self.shared
            .membership_tx
            .send(change)
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.unwrap_or(Err(HubError::Stopped))
    }

    /// Queue a message for routing, waiting for room in the dispatch queue.
    pub async fn dispatch(&self, msg: WsMessage) -> HubResult<()> {
        self.shared
            .dispatch_tx
            .send(msg)
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub fn try_dispatch(&self, msg: WsMessage) -> HubResult<()> {
        self.shared.dispatch_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::DispatchQueueFull,
            mpsc::error::TrySendError::Closed(_) => HubError::Stopped,
        })
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.shared.registry.user_connection_count(user_id)
    }

    pub fn group_connection_count(&self, group: &str) -> usize {
        self.shared.registry.group_connection_count(group)
    }

    /// Force-close every connection owned by `user_id`. Returns how many were closed.
    pub fn disconnect_user(&self, user_id: &str) -> usize {
        self.force_close(self.shared.registry.user_connections(user_id))
    }

    pub fn disconnect_group(&self, group: &str) -> usize {
        self.force_close(self.shared.registry.group_connections(group))
    }

    fn force_close(&self, conns: Vec<Arc<Connection>>) -> usize {
        let mut closed = 0;
        for conn in &conns {
            if conn.close(CloseReason::Requested) {
                self.shared.metrics.connection_evicted(CloseReason::Requested);
                closed += 1;
            }
            self.shared.request_unregister(conn);
        }
        closed
    }

    fn usage(&self) -> f64 {
        let max = self.shared.config.max_connections.max(1);
        self.connection_count() as f64 / max as f64 * 100.0
    }

    pub fn stats(&self) -> HubStats {
        let registry = &self.shared.registry;
        HubStats {
            total_connections: registry.len(),
            max_connections: registry.max_connections(),
            connection_usage: self.usage(),
            users: registry.user_total(),
            groups: registry.group_total(),
            shard_sizes: registry.shards().sizes(),
            node_id: self.shared.config.node_id.clone(),
            running: self.is_running(),
            uptime_secs: now_unix() - self.shared.started_at,
            config: self.shared.config.summary(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let running = self.is_running();
        let usage = self.usage();
        let status = if !running {
            HealthStatus::Unhealthy
        } else if usage >= WARNING_UTILIZATION {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            total_connections: self.connection_count(),
            max_connections: self.shared.config.max_connections,
            connection_usage: usage,
            hub_running: running,
            timestamp: now_unix(),
        }
    }

    /// Stop the control loop and workers, then force-close every remaining connection.
    /// The control loop already closes what it holds on cancellation; this also
    /// catches anything registered while it was exiting.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "hub task ended abnormally");
            }
        }
        let remaining = self.shared.registry.all();
        for conn in &remaining {
            conn.close(CloseReason::Shutdown);
        }
        info!(closed = remaining.len(), "hub stopped");
    }
}

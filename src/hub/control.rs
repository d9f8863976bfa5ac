//! The single writer of membership state. Every register, unregister, group change and
//! dispatch decision is made here, in the order the queues deliver them.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::workers::BroadcastJob;
use super::{MembershipChange, RegisterRequest, Scope, Shared, UnregisterRequest};
use crate::connection::{now_millis, CloseReason};
use crate::error::HubError;
use crate::models::{Route, WsMessage};

pub(crate) struct ControlLoop {
    shared: Arc<Shared>,
    jobs: flume::Sender<BroadcastJob>,
    pings: Option<flume::Sender<usize>>,
}

impl ControlLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        jobs: flume::Sender<BroadcastJob>,
        pings: Option<flume::Sender<usize>>,
    ) -> Self {
        Self {
            shared,
            jobs,
            pings,
        }
    }

    pub(crate) async fn run(
        self,
        mut register_rx: mpsc::Receiver<RegisterRequest>,
        mut unregister_rx: mpsc::Receiver<UnregisterRequest>,
        mut membership_rx: mpsc::Receiver<MembershipChange>,
        mut dispatch_rx: mpsc::Receiver<WsMessage>,
    ) {
        let mut ticker = interval(self.shared.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close_all();
                    break;
                }
                _ = ticker.tick() => self.on_heartbeat_tick(),
                Some(req) = unregister_rx.recv() => self.on_unregister(req),
                Some(req) = register_rx.recv() => self.on_register(req),
                Some(change) = membership_rx.recv() => self.on_membership(change),
                Some(msg) = dispatch_rx.recv() => self.on_dispatch(msg).await,
                else => break,
            }
        }
        debug!("control loop stopped");
    }

    /// Cancellation may come from a parent token without `Hub::shutdown`, so the
    /// loop closes every transport itself before exiting.
    fn close_all(&self) {
        let remaining = self.shared.registry.all();
        for conn in &remaining {
            conn.close(CloseReason::Shutdown);
        }
        info!(closed = remaining.len(), "hub cancelled, connections closed");
    }

    fn on_register(&self, req: RegisterRequest) {
        let RegisterRequest { conn, ack } = req;
        let result = match self.shared.registry.insert(conn.clone()) {
            Ok(true) => {
                self.shared.metrics.connection_registered();
                info!(
                    conn_id = %conn.id(),
                    user_id = %conn.user_id(),
                    total = self.shared.registry.len(),
                    "connection registered"
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ HubError::CapacityExceeded { .. }) => {
                self.shared.metrics.connection_rejected();
                warn!(
                    conn_id = %conn.id(),
                    user_id = %conn.user_id(),
                    max = self.shared.registry.max_connections(),
                    "connection limit reached, rejecting"
                );
                conn.close(CloseReason::CapacityExceeded);
                conn.mark_removed();
                Err(e)
            }
            Err(e) => {
                conn.mark_removed();
                Err(e)
            }
        };
        // the caller may have given up waiting
        let _ = ack.send(result);
    }

    fn on_unregister(&self, req: UnregisterRequest) {
        let removed = self.shared.remove_connection(&req.conn);
        if let Some(ack) = req.ack {
            let _ = ack.send(removed);
        }
    }

    fn on_membership(&self, change: MembershipChange) {
        match change {
            MembershipChange::Join { conn, group, ack } => {
                let result = self.shared.registry.join_group(&conn, &group);
                if let Ok(true) = result {
                    debug!(conn_id = %conn.id(), group = %group, "joined group");
                }
                let _ = ack.send(result);
            }
            MembershipChange::Leave { conn, group, ack } => {
                let result = self.shared.registry.leave_group(&conn, &group);
                if let Ok(true) = result {
                    debug!(conn_id = %conn.id(), group = %group, "left group");
                }
                let _ = ack.send(result);
            }
        }
    }

    async fn on_dispatch(&self, mut msg: WsMessage) {
        msg.stamp();
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, kind = %msg.kind, "failed to serialize message, dropping");
                return;
            }
        };

        let (scope, targets) = match msg.route() {
            Route::User(user_id) => (Scope::User, self.shared.registry.user_connections(user_id)),
            Route::Group(group) => (Scope::Group, self.shared.registry.group_connections(group)),
            Route::Broadcast => {
                self.fan_out(payload);
                return;
            }
        };
        // concurrent, so a bounded wait stalls the loop for one send_timeout at most
        let sends = targets
            .iter()
            .filter(|c| c.is_alive())
            .map(|conn| self.shared.deliver(conn, payload.clone(), scope));
        join_all(sends).await;
    }

    /// One job per shard. A full job queue drops the job rather than stalling the loop.
    fn fan_out(&self, payload: crate::models::Payload) {
        for shard in 0..self.shared.registry.shards().len() {
            let job = BroadcastJob {
                shard,
                payload: payload.clone(),
            };
            match self.jobs.try_send(job) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    self.shared.metrics.broadcast_job_dropped();
                    warn!(shard, "broadcast job queue full, dropping shard fanout");
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn on_heartbeat_tick(&self) {
        if let Some(pings) = &self.pings {
            for shard in 0..self.shared.registry.shards().len() {
                if let Err(flume::TrySendError::Full(_)) = pings.try_send(shard) {
                    debug!(shard, "ping sweep still running, skipping shard");
                }
            }
        }

        let timeout_ms = self.shared.config.connection_timeout.as_millis() as i64;
        let stale = self
            .shared
            .registry
            .stale_connections(now_millis(), timeout_ms);
        for conn in stale {
            warn!(
                conn_id = %conn.id(),
                user_id = %conn.user_id(),
                idle_ms = now_millis() - conn.last_heartbeat_ms(),
                "heartbeat timeout, closing connection"
            );
            conn.close(CloseReason::HeartbeatTimeout);
            self.shared
                .metrics
                .connection_evicted(CloseReason::HeartbeatTimeout);
            self.shared.remove_connection(&conn);
        }

        // closed while the unregister queue was full
        for conn in self.shared.registry.closed_connections() {
            self.shared.remove_connection(&conn);
        }
    }
}

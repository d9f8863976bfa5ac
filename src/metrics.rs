//! Prometheus metrics for the hub. Each hub owns its own registry so several hubs
//! (e.g. in tests) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::connection::CloseReason;
use crate::error::HubResult;

pub struct HubMetrics {
    registry: Registry,
    active_connections: IntGauge,
    registered: IntCounter,
    rejected: IntCounter,
    messages_sent: IntCounter,
    messages_dropped: IntCounter,
    broadcast_jobs_dropped: IntCounter,
    evictions: IntCounterVec,
    heartbeat_timeouts: IntCounter,
    malformed_frames: IntCounter,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub registered: u64,
    pub rejected: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub broadcast_jobs_dropped: u64,
    pub heartbeat_timeouts: u64,
    pub malformed_frames: u64,
}

impl HubMetrics {
    pub fn new() -> HubResult<Self> {
        let registry = Registry::new_custom(Some("hub".to_string()), None)?;

        let active_connections =
            IntGauge::new("active_connections", "Currently registered connections")?;
        let registered = IntCounter::new("connections_registered_total", "Accepted registrations")?;
        let rejected = IntCounter::new(
            "connections_rejected_total",
            "Registrations rejected at the connection limit",
        )?;
        let messages_sent = IntCounter::new("messages_sent_total", "Frames queued to connections")?;
        let messages_dropped = IntCounter::new(
            "messages_dropped_total",
            "Frames dropped because an outbound queue was full",
        )?;
        let broadcast_jobs_dropped = IntCounter::new(
            "broadcast_jobs_dropped_total",
            "Shard fanout jobs dropped because the job queue was full",
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("connections_closed_total", "Connections force-closed by the hub"),
            &["reason"],
        )?;
        let heartbeat_timeouts =
            IntCounter::new("heartbeat_timeouts_total", "Connections evicted for missing heartbeats")?;
        let malformed_frames =
            IntCounter::new("malformed_frames_total", "Inbound frames that failed to parse")?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(registered.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(broadcast_jobs_dropped.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(heartbeat_timeouts.clone()))?;
        registry.register(Box::new(malformed_frames.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            registered,
            rejected,
            messages_sent,
            messages_dropped,
            broadcast_jobs_dropped,
            evictions,
            heartbeat_timeouts,
            malformed_frames,
        })
    }

    pub fn connection_registered(&self) {
        self.registered.inc();
        self.active_connections.inc();
    }

    pub fn connection_unregistered(&self) {
        self.active_connections.dec();
    }

    pub fn connection_rejected(&self) {
        self.rejected.inc();
    }

    pub fn message_sent(&self) {
        self.messages_sent.inc();
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.inc();
    }

    pub fn broadcast_job_dropped(&self) {
        self.broadcast_jobs_dropped.inc();
    }

    pub fn connection_evicted(&self, reason: CloseReason) {
        self.evictions.with_label_values(&[reason.as_str()]).inc();
        if reason == CloseReason::HeartbeatTimeout {
            self.heartbeat_timeouts.inc();
        }
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.get(),
            registered: self.registered.get(),
            rejected: self.rejected.get(),
            messages_sent: self.messages_sent.get(),
            messages_dropped: self.messages_dropped.get(),
            broadcast_jobs_dropped: self.broadcast_jobs_dropped.get(),
            heartbeat_timeouts: self.heartbeat_timeouts.get(),
            malformed_frames: self.malformed_frames.get(),
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> HubResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_snapshot_and_text() {
        let metrics = HubMetrics::new().unwrap();
        metrics.connection_registered();
        metrics.connection_registered();
        metrics.connection_unregistered();
        metrics.message_dropped();
        metrics.connection_evicted(CloseReason::HeartbeatTimeout);

        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.registered, 2);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(snap.heartbeat_timeouts, 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("hub_connections_registered_total 2"));
        assert!(text.contains(r#"hub_connections_closed_total{reason="heartbeat_timeout"} 1"#));
    }

    #[test]
    fn independent_registries() {
        let a = HubMetrics::new().unwrap();
        let b = HubMetrics::new().unwrap();
        a.message_sent();
        assert_eq!(b.snapshot().messages_sent, 0);
    }
}

//! Hub configuration: defaults, environment overrides, validation and a serializable summary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_MAX_CONNECTIONS: &str = "WEBSOCKET_MAX_CONNECTIONS";
pub const ENV_HEARTBEAT_INTERVAL: &str = "WEBSOCKET_HEARTBEAT_INTERVAL";
pub const ENV_CONNECTION_TIMEOUT: &str = "WEBSOCKET_CONNECTION_TIMEOUT";
pub const ENV_MESSAGE_BUFFER_SIZE: &str = "WEBSOCKET_MESSAGE_BUFFER_SIZE";
pub const ENV_MESSAGE_QUEUE_SIZE: &str = "WEBSOCKET_MESSAGE_QUEUE_SIZE";
pub const ENV_MAX_MESSAGE_SIZE: &str = "WEBSOCKET_MAX_MESSAGE_SIZE";
pub const ENV_SHARD_COUNT: &str = "WEBSOCKET_SHARD_COUNT";
pub const ENV_BROADCAST_WORKERS: &str = "WEBSOCKET_BROADCAST_WORKERS";
pub const ENV_PING_WORKERS: &str = "WEBSOCKET_PING_WORKERS";
pub const ENV_DROP_ON_FULL: &str = "WEBSOCKET_DROP_ON_FULL";
pub const ENV_SEND_TIMEOUT_MS: &str = "WEBSOCKET_SEND_TIMEOUT_MS";
pub const ENV_CLOSE_ON_BACKPRESSURE: &str = "WEBSOCKET_CLOSE_ON_BACKPRESSURE";
pub const ENV_ENABLE_GLOBAL_PING: &str = "WEBSOCKET_ENABLE_GLOBAL_PING";
pub const ENV_ALLOW_ANONYMOUS: &str = "WEBSOCKET_ALLOW_ANONYMOUS";
pub const ENV_CLUSTER_NODE_ID: &str = "WEBSOCKET_CLUSTER_NODE_ID";

/// What to do when a recipient's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Non-blocking enqueue; drop on failure.
    DropOnFull,
    /// Wait up to `send_timeout` for room in the queue. Targeted sends wait on the
    /// control loop, all recipients of one message concurrently, so a slow group
    /// delays other control events by up to one `send_timeout` per message.
    BoundedWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// Each writer task owns a probe timer.
    PerConnection,
    /// Ping workers sweep shards on the control loop's heartbeat tick.
    GlobalSweep,
}

/// Immutable hub configuration. Validate once with [`HubConfig::validate`] before starting a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    /// Must exceed `heartbeat_interval`.
    pub connection_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub outbound_queue_capacity: usize,
    /// Capacity of the dispatch queue and the broadcast job queue.
    pub dispatch_queue_capacity: usize,
    /// Capacity of the register/unregister/membership queues.
    pub control_queue_capacity: usize,
    /// Largest inbound frame accepted by the transport, in bytes.
    pub max_message_size: usize,
    pub shard_count: usize,
    pub broadcast_workers: usize,
    pub ping_workers: usize,
    pub backpressure: BackpressureMode,
    pub send_timeout: Duration,
    pub close_on_backpressure: bool,
    pub heartbeat_mode: HeartbeatMode,
    pub allow_anonymous: bool,
    /// Informational only; there is no cross-node transport.
    pub node_id: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            outbound_queue_capacity: 256,
            dispatch_queue_capacity: 1000,
            control_queue_capacity: 1000,
            max_message_size: 512,
            shard_count: 16,
            broadcast_workers: 32,
            ping_workers: 8,
            backpressure: BackpressureMode::DropOnFull,
            send_timeout: Duration::from_millis(50),
            close_on_backpressure: false,
            heartbeat_mode: HeartbeatMode::PerConnection,
            allow_anonymous: false,
            node_id: None,
        }
    }
}

/// Partial configuration layered over another config by [`HubConfig::merge`].
/// `None` leaves the base value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub max_connections: Option<usize>,
    pub heartbeat_interval: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub outbound_queue_capacity: Option<usize>,
    pub dispatch_queue_capacity: Option<usize>,
    pub max_message_size: Option<usize>,
    pub shard_count: Option<usize>,
    pub broadcast_workers: Option<usize>,
    pub ping_workers: Option<usize>,
    pub backpressure: Option<BackpressureMode>,
    pub send_timeout: Option<Duration>,
    pub close_on_backpressure: Option<bool>,
    pub heartbeat_mode: Option<HeartbeatMode>,
    pub allow_anonymous: Option<bool>,
    pub node_id: Option<String>,
}

impl ConfigOverrides {
    /// Read overrides through `lookup` (usually the process environment).
    /// Unset or blank variables are skipped; unparseable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| -> Option<(&'static str, String)> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let drop_on_full = get(ENV_DROP_ON_FULL).map(parse_bool).transpose()?;
        let global_ping = get(ENV_ENABLE_GLOBAL_PING).map(parse_bool).transpose()?;

        Ok(Self {
            max_connections: get(ENV_MAX_CONNECTIONS).map(parse_usize).transpose()?,
            heartbeat_interval: get(ENV_HEARTBEAT_INTERVAL)
                .map(parse_usize)
                .transpose()?
                .map(|s| Duration::from_secs(s as u64)),
            connection_timeout: get(ENV_CONNECTION_TIMEOUT)
                .map(parse_usize)
                .transpose()?
                .map(|s| Duration::from_secs(s as u64)),
            outbound_queue_capacity: get(ENV_MESSAGE_BUFFER_SIZE).map(parse_usize).transpose()?,
            dispatch_queue_capacity: get(ENV_MESSAGE_QUEUE_SIZE).map(parse_usize).transpose()?,
            max_message_size: get(ENV_MAX_MESSAGE_SIZE).map(parse_usize).transpose()?,
            shard_count: get(ENV_SHARD_COUNT).map(parse_usize).transpose()?,
            broadcast_workers: get(ENV_BROADCAST_WORKERS).map(parse_usize).transpose()?,
            ping_workers: get(ENV_PING_WORKERS).map(parse_usize).transpose()?,
            backpressure: drop_on_full.map(|drop| {
                if drop {
                    BackpressureMode::DropOnFull
                } else {
                    BackpressureMode::BoundedWait
                }
            }),
            send_timeout: get(ENV_SEND_TIMEOUT_MS)
                .map(parse_usize)
                .transpose()?
                .map(|ms| Duration::from_millis(ms as u64)),
            close_on_backpressure: get(ENV_CLOSE_ON_BACKPRESSURE).map(parse_bool).transpose()?,
            heartbeat_mode: global_ping.map(|global| {
                if global {
                    HeartbeatMode::GlobalSweep
                } else {
                    HeartbeatMode::PerConnection
                }
            }),
            allow_anonymous: get(ENV_ALLOW_ANONYMOUS).map(parse_bool).transpose()?,
            node_id: get(ENV_CLUSTER_NODE_ID).map(|(_, v)| v),
        })
    }
}

fn parse_usize((key, value): (&'static str, String)) -> Result<usize, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_bool((key, value): (&'static str, String)) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

impl HubConfig {
    /// Defaults overlaid with `WEBSOCKET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let overrides = ConfigOverrides::from_lookup(|key| std::env::var(key).ok())?;
        Ok(Self::default().merge(overrides))
    }

    pub fn merge(mut self, o: ConfigOverrides) -> Self {
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = o.$field { self.$field = v; })*
            };
        }
        apply!(
            max_connections,
            heartbeat_interval,
            connection_timeout,
            outbound_queue_capacity,
            dispatch_queue_capacity,
            max_message_size,
            shard_count,
            broadcast_workers,
            ping_workers,
            backpressure,
            send_timeout,
            close_on_backpressure,
            heartbeat_mode,
            allow_anonymous,
        );
        if o.node_id.is_some() {
            self.node_id = o.node_id;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections", self.max_connections),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("dispatch_queue_capacity", self.dispatch_queue_capacity),
            ("control_queue_capacity", self.control_queue_capacity),
            ("max_message_size", self.max_message_size),
            ("shard_count", self.shard_count),
            ("broadcast_workers", self.broadcast_workers),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::NotPositive { field });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::NotPositive { field: "heartbeat_interval" });
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::NotPositive { field: "connection_timeout" });
        }
        if self.heartbeat_interval >= self.connection_timeout {
            return Err(ConfigError::HeartbeatNotBelowTimeout {
                heartbeat: self.heartbeat_interval,
                timeout: self.connection_timeout,
            });
        }
        if self.close_on_backpressure && self.send_timeout.is_zero() {
            return Err(ConfigError::CloseWithoutSendTimeout);
        }
        if self.backpressure == BackpressureMode::BoundedWait && self.send_timeout.is_zero() {
            return Err(ConfigError::BoundedWaitWithoutTimeout);
        }
        if self.heartbeat_mode == HeartbeatMode::GlobalSweep && self.ping_workers == 0 {
            return Err(ConfigError::GlobalPingWithoutWorkers);
        }
        Ok(())
    }

    /// Interval between liveness probes sent by a writer task in per-connection mode.
    pub fn probe_interval(&self) -> Duration {
        self.heartbeat_interval.mul_f64(0.9)
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            max_connections: self.max_connections,
            heartbeat_interval: format!("{:?}", self.heartbeat_interval),
            connection_timeout: format!("{:?}", self.connection_timeout),
            outbound_queue_capacity: self.outbound_queue_capacity,
            dispatch_queue_capacity: self.dispatch_queue_capacity,
            max_message_size: self.max_message_size,
            shard_count: self.shard_count,
            broadcast_workers: self.broadcast_workers,
            ping_workers: self.ping_workers,
            backpressure: self.backpressure,
            send_timeout: format!("{:?}", self.send_timeout),
            close_on_backpressure: self.close_on_backpressure,
            heartbeat_mode: self.heartbeat_mode,
            allow_anonymous: self.allow_anonymous,
            node_id: self.node_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub max_connections: usize,
    pub heartbeat_interval: String,
    pub connection_timeout: String,
    pub outbound_queue_capacity: usize,
    pub dispatch_queue_capacity: usize,
    pub max_message_size: usize,
    pub shard_count: usize,
    pub broadcast_workers: usize,
    pub ping_workers: usize,
    pub backpressure: BackpressureMode,
    pub send_timeout: String,
    pub close_on_backpressure: bool,
    pub heartbeat_mode: HeartbeatMode,
    pub allow_anonymous: bool,
    pub node_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = HubConfig::default();
        assert_eq!(config.max_connections, 100_000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.shard_count, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            ..HubConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatNotBelowTimeout { .. })
        ));

        let equal = HubConfig {
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            ..HubConfig::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn close_on_backpressure_needs_timeout() {
        let config = HubConfig {
            close_on_backpressure: true,
            send_timeout: Duration::ZERO,
            ..HubConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CloseWithoutSendTimeout));
    }

    #[test]
    fn zero_counts_are_rejected() {
        let config = HubConfig {
            shard_count: 0,
            ..HubConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "shard_count" })
        );

        let config = HubConfig {
            heartbeat_mode: HeartbeatMode::GlobalSweep,
            ping_workers: 0,
            ..HubConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::GlobalPingWithoutWorkers));
    }

    #[test]
    fn overrides_from_lookup() {
        let overrides = ConfigOverrides::from_lookup(lookup(&[
            (ENV_MAX_CONNECTIONS, "1000"),
            (ENV_HEARTBEAT_INTERVAL, "10"),
            (ENV_DROP_ON_FULL, "false"),
            (ENV_SEND_TIMEOUT_MS, "250"),
            (ENV_ENABLE_GLOBAL_PING, "1"),
            (ENV_CLUSTER_NODE_ID, "node-a"),
            (ENV_SHARD_COUNT, "  "),
        ]))
        .unwrap();

        let config = HubConfig::default().merge(overrides);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.backpressure, BackpressureMode::BoundedWait);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat_mode, HeartbeatMode::GlobalSweep);
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        // blank values fall back to the default
        assert_eq!(config.shard_count, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unparseable_env_is_an_error() {
        let err = ConfigOverrides::from_lookup(lookup(&[(ENV_MAX_CONNECTIONS, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_MAX_CONNECTIONS,
                value: "lots".to_string()
            }
        );
        assert!(ConfigOverrides::from_lookup(lookup(&[(ENV_DROP_ON_FULL, "maybe")])).is_err());
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let base = HubConfig {
            max_connections: 1000,
            ..HubConfig::default()
        };
        let merged = base.merge(ConfigOverrides {
            heartbeat_interval: Some(Duration::from_secs(20)),
            ..ConfigOverrides::default()
        });
        assert_eq!(merged.max_connections, 1000);
        assert_eq!(merged.heartbeat_interval, Duration::from_secs(20));
    }

    #[test]
    fn summary_formats_durations() {
        let summary = HubConfig::default().summary();
        assert_eq!(summary.heartbeat_interval, "30s");
        assert_eq!(summary.send_timeout, "50ms");
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["backpressure"], "drop_on_full");
        assert_eq!(json["heartbeat_mode"], "per_connection");
    }
}

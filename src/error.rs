//! Error types for configuration loading and hub operations.

use std::time::Duration;

use crate::connection::ConnectionId;

/// Rejected configuration. Produced by `HubConfig::validate` and the env loader.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    NotPositive { field: &'static str },

    #[error("heartbeat interval ({heartbeat:?}) must be shorter than connection timeout ({timeout:?})")]
    HeartbeatNotBelowTimeout { heartbeat: Duration, timeout: Duration },

    #[error("close_on_backpressure requires a non-zero send timeout")]
    CloseWithoutSendTimeout,

    #[error("bounded-wait backpressure requires a non-zero send timeout")]
    BoundedWaitWithoutTimeout,

    #[error("global ping mode requires at least one ping worker")]
    GlobalPingWithoutWorkers,

    #[error("invalid value {value:?} for environment variable {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection limit reached ({max})")]
    CapacityExceeded { max: usize },

    #[error("hub is not running")]
    Stopped,

    #[error("dispatch queue is full")]
    DispatchQueueFull,

    #[error("outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type HubResult<T> = Result<T, HubError>;

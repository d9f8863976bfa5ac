//! Slow-consumer handling: what happens when a recipient's outbound queue is full.

use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::config::{BackpressureMode, HubConfig};
use crate::connection::{CloseReason, Connection, Outbound};
use crate::models::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Queue stayed full; the message was discarded.
    Dropped,
    /// Dropped, and the connection was force-closed.
    Evicted,
    /// The connection's queue is already closed.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressurePolicy {
    pub mode: BackpressureMode,
    pub send_timeout: Duration,
    pub close_on_backpressure: bool,
}

impl BackpressurePolicy {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            mode: config.backpressure,
            send_timeout: config.send_timeout,
            close_on_backpressure: config.close_on_backpressure,
        }
    }

    /// Offer `payload` to `conn`. `on_drop` runs once if the message is discarded
    /// because the queue is full. Never waits longer than `send_timeout`.
    pub async fn try_send<F>(&self, conn: &Connection, payload: Payload, on_drop: F) -> SendOutcome
    where
        F: FnOnce(),
    {
        if conn.is_queue_closed() {
            return SendOutcome::Closed;
        }
        let item = Outbound::Text(payload);
        let full = match self.mode {
            BackpressureMode::DropOnFull => match conn.sender().try_send(item) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => return SendOutcome::Closed,
            },
            BackpressureMode::BoundedWait => {
                match conn.sender().send_timeout(item, self.send_timeout).await {
                    Ok(()) => false,
                    Err(SendTimeoutError::Timeout(_)) => true,
                    Err(SendTimeoutError::Closed(_)) => return SendOutcome::Closed,
                }
            }
        };
        if !full {
            return SendOutcome::Delivered;
        }

        on_drop();
        if self.close_on_backpressure {
            conn.close(CloseReason::Backpressure);
            SendOutcome::Evicted
        } else {
            SendOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn policy(mode: BackpressureMode, close: bool) -> BackpressurePolicy {
        BackpressurePolicy {
            mode,
            send_timeout: Duration::from_millis(30),
            close_on_backpressure: close,
        }
    }

    fn payload() -> Payload {
        Payload::from(r#"{"type":"chat"}"#)
    }

    #[tokio::test]
    async fn drop_mode_does_not_block() {
        let (conn, _rx) = Connection::new("u1", 1);
        conn.activate();
        let drops = AtomicUsize::new(0);
        let p = policy(BackpressureMode::DropOnFull, false);

        assert_eq!(p.try_send(&conn, payload(), || {}).await, SendOutcome::Delivered);

        let started = Instant::now();
        let outcome = p
            .try_send(&conn, payload(), || {
                drops.fetch_add(1, Ordering::Relaxed);
            })
            .await;
        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn bounded_wait_times_out_then_evicts() {
        let (conn, _rx) = Connection::new("u1", 1);
        conn.activate();
        let p = policy(BackpressureMode::BoundedWait, true);
        assert_eq!(p.try_send(&conn, payload(), || {}).await, SendOutcome::Delivered);

        let started = Instant::now();
        let outcome = p.try_send(&conn, payload(), || {}).await;
        assert_eq!(outcome, SendOutcome::Evicted);
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn bounded_wait_succeeds_when_reader_catches_up() {
        let (conn, mut rx) = Connection::new("u1", 1);
        conn.activate();
        let p = BackpressurePolicy {
            send_timeout: Duration::from_millis(500),
            ..policy(BackpressureMode::BoundedWait, false)
        };
        p.try_send(&conn, payload(), || {}).await;

        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            rx.recv().await;
            rx
        });
        assert_eq!(p.try_send(&conn, payload(), || {}).await, SendOutcome::Delivered);
        drop(drain.await.unwrap());
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (conn, rx) = Connection::new("u1", 4);
        conn.activate();
        drop(rx);
        let p = policy(BackpressureMode::DropOnFull, true);
        assert_eq!(p.try_send(&conn, payload(), || panic!("not a drop")).await, SendOutcome::Closed);
    }
}

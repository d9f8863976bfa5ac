//! Per-connection reader and writer tasks.
//!
//! The transport is any frame stream/sink pair, so an axum `WebSocket` split in two
//! and a pair of in-memory channels are driven by the same code.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HeartbeatMode;
use crate::connection::{CloseReason, Connection, Outbound, OutboundReceiver};
use crate::hub::Hub;
use crate::models::{MessageType, WsMessage};

/// Upper bound on a single flush to the client.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a session for an upgraded socket owned by `user_id`.
pub async fn run_session(hub: Hub, socket: WebSocket, user_id: String) {
    let (sink, stream) = socket.split();
    let (conn, rx) = hub.new_connection(user_id);
    drive(hub, conn, rx, sink, stream).await;
}

/// Register `conn`, then read until the transport ends or the hub closes the
/// connection. Unregisters and waits for the writer before returning.
pub async fn drive<S, R, E>(
    hub: Hub,
    conn: Arc<Connection>,
    rx: OutboundReceiver,
    mut sink: S,
    stream: R,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    if let Err(e) = hub.register(conn.clone()).await {
        warn!(conn_id = %conn.id(), user_id = %conn.user_id(), error = %e, "registration failed");
        let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
        return;
    }

    let probe = match hub.config().heartbeat_mode {
        HeartbeatMode::PerConnection => Some(hub.config().probe_interval()),
        HeartbeatMode::GlobalSweep => None,
    };
    let writer = tokio::spawn(write_loop(conn.clone(), rx, sink, probe));

    let reason = read_loop(&hub, &conn, stream).await;
    conn.close(reason);
    hub.unregister(conn.clone()).await;
    if let Err(e) = writer.await {
        warn!(conn_id = %conn.id(), error = %e, "writer task failed");
    }
    info!(conn_id = %conn.id(), user_id = %conn.user_id(), reason = reason.as_str(), "session ended");
}

async fn read_loop<R, E>(hub: &Hub, conn: &Arc<Connection>, mut stream: R) -> CloseReason
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let max_size = hub.config().max_message_size;
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => return CloseReason::Requested,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                let text = text.as_str();
                if text.len() > max_size {
                    warn!(conn_id = %conn.id(), size = text.len(), max_size, "frame exceeds size limit");
                    return CloseReason::ReadError;
                }
                handle_frame(hub, conn, text).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                if bytes.len() > max_size {
                    warn!(conn_id = %conn.id(), size = bytes.len(), max_size, "frame exceeds size limit");
                    return CloseReason::ReadError;
                }
                match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_frame(hub, conn, text).await,
                    Err(_) => reject(hub, conn, "invalid message format"),
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
            Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
            Some(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "read error");
                return CloseReason::ReadError;
            }
        }
    }
}

/// Malformed input: counted, logged and answered with an `error` frame.
fn reject(hub: &Hub, conn: &Connection, reason: &str) {
    hub.metrics().malformed_frame();
    warn!(conn_id = %conn.id(), user_id = %conn.user_id(), reason, "invalid message");
    reply(conn, WsMessage::error(reason));
}

fn reply(conn: &Connection, msg: WsMessage) {
    if let Err(e) = conn.reply(&msg) {
        debug!(conn_id = %conn.id(), error = %e, kind = %msg.kind, "reply not queued");
    }
}

fn group_name(data: &Value) -> Option<&str> {
    data.as_str().map(str::trim).filter(|g| !g.is_empty())
}

async fn handle_frame(hub: &Hub, conn: &Arc<Connection>, text: &str) {
    let mut msg = match WsMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(conn_id = %conn.id(), error = %e, "undecodable frame");
            reject(hub, conn, "invalid message format");
            return;
        }
    };
    msg.from = Some(conn.user_id().to_string()).filter(|u| !u.is_empty());

    match msg.kind {
        MessageType::Ping => {
            conn.touch();
            reply(conn, WsMessage::new(MessageType::Pong, Value::Null));
        }
        MessageType::Pong => conn.touch(),
        MessageType::JoinGroup => {
            let Some(group) = group_name(&msg.data) else {
                reject(hub, conn, "join_group requires a group name");
                return;
            };
            match hub.join_group(conn, group).await {
                Ok(_) => reply(conn, WsMessage::new(MessageType::GroupJoined, Value::from(group))),
                Err(e) => warn!(conn_id = %conn.id(), group, error = %e, "join_group failed"),
            }
        }
        MessageType::LeaveGroup => {
            let Some(group) = group_name(&msg.data) else {
                reject(hub, conn, "leave_group requires a group name");
                return;
            };
            match hub.leave_group(conn, group).await {
                Ok(_) => reply(conn, WsMessage::new(MessageType::GroupLeft, Value::from(group))),
                Err(e) => warn!(conn_id = %conn.id(), group, error = %e, "leave_group failed"),
            }
        }
        MessageType::Chat => {
            if !msg.data.is_object() {
                reject(hub, conn, "chat data must be an object");
                return;
            }
            if msg.to.is_none() && msg.group.is_none() {
                reject(hub, conn, "chat requires a recipient or group");
                return;
            }
            forward(hub, conn, msg).await;
        }
        MessageType::Notification => {
            if !msg.data.is_object() {
                reject(hub, conn, "notification data must be an object");
                return;
            }
            forward(hub, conn, msg).await;
        }
        MessageType::Status => {
            let Value::Object(update) = msg.data else {
                reject(hub, conn, "status data must be an object");
                return;
            };
            conn.merge_metadata(update);
            reply(
                conn,
                WsMessage::new(MessageType::StatusUpdated, Value::Object(conn.metadata())),
            );
        }
        other => {
            warn!(conn_id = %conn.id(), user_id = %conn.user_id(), kind = %other, "unknown message type");
        }
    }
}

async fn forward(hub: &Hub, conn: &Connection, msg: WsMessage) {
    if let Err(e) = hub.dispatch(msg).await {
        warn!(conn_id = %conn.id(), error = %e, "dispatch failed");
    }
}

async fn write_loop<S>(conn: Arc<Connection>, mut rx: OutboundReceiver, mut sink: S, probe: Option<Duration>)
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    let mut ticker = probe.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let first = tokio::select! {
            biased;
            _ = conn.queue_closed() => break,
            _ = conn.closed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => Outbound::Ping,
        };

        match timeout(WRITE_TIMEOUT, write_batch(&mut sink, &mut rx, first)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "write error");
                conn.close(CloseReason::WriteError);
                return;
            }
            Err(_) => {
                warn!(conn_id = %conn.id(), user_id = %conn.user_id(), "write timed out");
                conn.close(CloseReason::WriteError);
                return;
            }
        }
    }

    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
    let _ = sink.close().await;
}

/// Feed `first` and everything already queued behind it, then flush once.
async fn write_batch<S>(sink: &mut S, rx: &mut OutboundReceiver, first: Outbound) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    sink.feed(frame(first)).await?;
    while let Ok(next) = rx.try_recv() {
        sink.feed(frame(next)).await?;
    }
    sink.flush().await
}

fn frame(item: Outbound) -> Message {
    match item {
        Outbound::Text(payload) => Message::Text(payload),
        Outbound::Ping => Message::Ping(Bytes::new()),
    }
}

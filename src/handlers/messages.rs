use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::models::{MessageType, WsMessage};
use crate::AppState;

#[derive(Deserialize)]
pub struct SendMessageBody {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Value,
    #[serde(default, deserialize_with = "crate::serde_compat::empty_as_none")]
    to: Option<String>,
    #[serde(default, deserialize_with = "crate::serde_compat::empty_as_none")]
    group: Option<String>,
    #[serde(default, deserialize_with = "crate::serde_compat::empty_as_none")]
    from: Option<String>,
}

#[derive(Deserialize)]
pub struct BroadcastBody {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
pub struct Accepted {
    status: &'static str,
    timestamp: i64,
}

#[derive(Serialize)]
pub struct Disconnected {
    disconnected: usize,
}

fn dispatch_error(e: HubError) -> (StatusCode, &'static str) {
    match e {
        HubError::DispatchQueueFull => (StatusCode::SERVICE_UNAVAILABLE, "Dispatch queue is full"),
        HubError::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "Hub is not running"),
        other => {
            tracing::error!("dispatch: {:?}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to dispatch message")
        }
    }
}

/// POST /ws/message: direct or group send on behalf of the server.
pub async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    if body.to.is_none() && body.group.is_none() {
        return Err((StatusCode::BAD_REQUEST, "Either 'to' or 'group' must be specified"));
    }
    let mut msg = WsMessage::new(body.kind, body.data);
    msg.to = body.to;
    msg.group = body.group;
    msg.from = body.from;
    let timestamp = msg.timestamp;

    state.hub.try_dispatch(msg).map_err(dispatch_error)?;
    Ok(Json(Accepted {
        status: "sent",
        timestamp,
    }))
}

/// POST /ws/broadcast: every connection on this node.
pub async fn post_broadcast(
    State(state): State<AppState>,
    Json(body): Json<BroadcastBody>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    let msg = WsMessage::new(body.kind, body.data);
    let timestamp = msg.timestamp;

    state.hub.try_dispatch(msg).map_err(dispatch_error)?;
    Ok(Json(Accepted {
        status: "broadcast",
        timestamp,
    }))
}

pub async fn disconnect_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    match state.hub.disconnect_user(&user_id) {
        0 => Err((StatusCode::NOT_FOUND, "User has no connections")),
        disconnected => Ok(Json(Disconnected { disconnected })),
    }
}

pub async fn disconnect_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    match state.hub.disconnect_group(&group) {
        0 => Err((StatusCode::NOT_FOUND, "Group has no connections")),
        disconnected => Ok(Json(Disconnected { disconnected })),
    }
}

//! WebSocket upgrade: identity from the `uid` query param, then hand the socket to a session.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::session;
use crate::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    uid: Option<String>,
}

/// Resolve the caller's identity. Missing or blank `uid` is anonymous when the hub allows it.
fn resolve_uid(uid: Option<&str>, allow_anonymous: bool) -> Result<String, (StatusCode, &'static str)> {
    match uid.map(str::trim).filter(|u| !u.is_empty()) {
        Some(uid) => Ok(uid.to_string()),
        None if allow_anonymous => Ok(String::new()),
        None => Err((StatusCode::UNAUTHORIZED, "Missing uid query param")),
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = state.hub.config();
    let uid = match resolve_uid(q.uid.as_deref(), config.allow_anonymous) {
        Ok(uid) => uid,
        Err(rejection) => return rejection.into_response(),
    };
    if !state.hub.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Hub is not running").into_response();
    }

    let hub = state.hub.clone();
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| session::run_session(hub, socket, uid))
}

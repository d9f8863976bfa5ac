//! Read-only introspection: stats, health, per-user/group counts and Prometheus text.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::hub::{HealthStatus, HubStats};
use crate::AppState;

pub async fn get_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

pub async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.hub.health();
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
    };
    (code, Json(report))
}

#[derive(Serialize)]
pub struct UserConnections {
    user_id: String,
    connections: usize,
    online: bool,
}

pub async fn get_user_connections(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserConnections> {
    let connections = state.hub.user_connection_count(&user_id);
    Json(UserConnections {
        user_id,
        connections,
        online: connections > 0,
    })
}

#[derive(Serialize)]
pub struct GroupConnections {
    group: String,
    connections: usize,
}

pub async fn get_group_connections(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Json<GroupConnections> {
    let connections = state.hub.group_connection_count(&group);
    Json(GroupConnections { group, connections })
}

pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.hub.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("render metrics: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics").into_response()
        }
    }
}

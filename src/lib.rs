//! Real-time connection and message fanout hub.
//!
//! [`hub::Hub`] owns the registry, the control loop and the worker pools. The HTTP
//! surface in [`handlers`] is thin glue around it.

pub mod backpressure;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod serde_compat;
pub mod session;
pub mod shard;
pub mod ws_registry;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;

/// Largest JSON body accepted by the send endpoints.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/ws/stats", get(handlers::stats::get_stats))
        .route("/ws/health", get(handlers::stats::get_health))
        .route(
            "/ws/user/{user_id}",
            get(handlers::stats::get_user_connections).delete(handlers::messages::disconnect_user),
        )
        .route(
            "/ws/group/{group}",
            get(handlers::stats::get_group_connections).delete(handlers::messages::disconnect_group),
        )
        .route("/ws/message", post(handlers::messages::post_message))
        .route("/ws/broadcast", post(handlers::messages::post_broadcast))
        .route("/metrics", get(handlers::stats::get_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

use std::net::SocketAddr;

use fanout_hub::{router, AppState, Hub, HubConfig};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let config = HubConfig::from_env().expect("invalid WEBSOCKET_* configuration");
    let hub = Hub::start(config).expect("failed to start hub");
    let state = AppState { hub: hub.clone() };
    let app = router(state);

    let addr: SocketAddr = std::env::var("HUB_LISTEN_ADDR")
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .expect("HUB_LISTEN_ADDR must be a socket address");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tracing::info!(%addr, "listening");

    // upgraded sockets outlive the HTTP connection, so the hub closes them itself
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            hub.shutdown().await;
        })
        .await
        .unwrap();
}

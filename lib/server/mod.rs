pub mod credentials;
pub mod error;
pub mod handlers;
pub mod monitoring;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use monitoring::INSIGHTS_METRICS;
use prometheus_client::encoding::text::encode;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::state::AppState;

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Registers the process metrics once. Later calls reuse the first registration.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    if INSIGHTS_METRICS.initialized() {
        return;
    }
    INSIGHTS_METRICS
        .get_or_init(|| async { monitoring::InsightsMetrics::register(&mut registry, "insights") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "worker");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route(
            "/api/instagram/daily-snapshot",
            get(handlers::daily_snapshot),
        )
        .route("/api/instagram/prewarm", post(handlers::prewarm))
        .route("/api/instagram/repair", post(handlers::repair))
        .route("/api/instagram/backfill", post(handlers::backfill))
        .route("/api/cron/prewarm", post(handlers::cron_prewarm))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `addr` and serves the API until the state's shutdown token is cancelled.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "http_server_listening", bind = %addr, "serving insights api");

    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "http_server_failed", error = %err, "http server exited with error");
        }
    });

    Ok(server_handle)
}

//! HTTP server setup: router and API routes.

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::state::ApiState;
use super::{rebuild, search};

/// Build the application router over `state`.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/rebuild", post(rebuild::trigger_rebuild))
        .route("/rebuild/status", get(rebuild::rebuild_status))
        .route("/search", post(search::search))
        .route("/stats", get(search::stats));

    Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the given address.
///
/// Returns a handle that resolves when the server shuts down. The caller
/// passes a `tokio::sync::watch::Receiver<bool>` for graceful shutdown.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    Ok(serve_on(listener, state, shutdown_rx))
}

/// Serve the API on an already bound listener until `shutdown_rx` flips to
/// `true`.
pub fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let app = router(state);
    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "HTTP server listening"),
        Err(error) => tracing::warn!(%error, "HTTP server listening on an unknown address"),
    }

    tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server stopped with an error");
        }
    })
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let uptime = state.started_at.elapsed();
    Json(serde_json::json!({
        "status": "ok",
        "pid": std::process::id(),
        "uptime_seconds": uptime.as_secs(),
        "index_loaded": state.rebuilder.serving_index().is_some(),
    }))
}

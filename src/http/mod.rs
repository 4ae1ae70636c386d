//! HTTP surface: session-creating POSTs, SSE streams, artifact downloads,
//! and cache administration.

mod handlers;

pub use handlers::AppState;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::create_chat))
        .route("/api/chat/stream/:session_id", get(handlers::stream_chat))
        .route("/stream-analysis", post(handlers::stream_analysis))
        .route("/download/", get(handlers::download))
        .route("/health", get(handlers::health))
        .route("/cache/ping", get(handlers::cache_ping))
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/delete", post(handlers::cache_delete))
        .route("/cache/clear-l1", post(handlers::cache_clear_l1))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until ctrl-c.
pub async fn serve(bind_addr: &str, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::Config(format!("binding {bind_addr}: {e}")))?;
    info!(%bind_addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| Error::Internal(format!("server error: {e}")))
}

//! Request handlers.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::cache::LlmCacheGateway;
use crate::pipeline::{AnalysisRequest, Pipeline};
use crate::session::{AttachError, SessionRegistry, SessionStream};

/// Shared application state; every collaborator is an explicit injected
/// value, never a global.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<LlmCacheGateway>,
    pub analysis_dir: PathBuf,
}

fn cache_key_headers(gateway: &LlmCacheGateway) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(key) = gateway.last_cache_key() {
        if let Ok(value) = key.parse() {
            headers.insert(HeaderName::from_static("x-llm-cache-key"), value);
        }
    }
    headers
}

// ==================== Analysis sessions ====================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    pub project: String,
    pub env: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: Uuid,
    #[serde(rename = "streamUrl")]
    pub stream_url: String,
}

/// POST /api/chat — create a session and start its pipeline.
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> Response {
    let session = state.registry.create();
    let request = AnalysisRequest {
        text: body.prompt,
        project: body.project,
        env: body.env,
        domain: body.domain,
    };
    info!(session_id = %session.id, project = %request.project, "analysis session created");

    tokio::spawn(Arc::clone(&state.pipeline).run(Arc::clone(&session), request));

    let response = ChatResponse {
        session_id: session.id,
        stream_url: format!("/api/chat/stream/{}", session.id),
    };
    (cache_key_headers(&state.gateway), Json(response)).into_response()
}

fn sse_stream(stream: SessionStream) -> impl Stream<Item = std::result::Result<SseEvent, Infallible>> {
    futures::stream::unfold(stream, |mut stream| async move {
        let event = stream.next_event().await?;
        let sse = SseEvent::default()
            .event(event.kind.wire_name())
            .data(event.data.to_string());
        Some((Ok(sse), stream))
    })
}

/// GET /api/chat/stream/{session_id} — the session's SSE stream.
pub async fn stream_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "SESSION_NOT_FOUND"})),
        )
            .into_response();
    };
    match state.registry.attach(id) {
        Ok(stream) => Sse::new(sse_stream(stream))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(AttachError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "SESSION_NOT_FOUND"})),
        )
            .into_response(),
        Err(AttachError::Busy) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "SESSION_BUSY"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamAnalysisRequest {
    pub text: String,
    pub project: String,
    pub env: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// POST /stream-analysis — same pipeline, SSE in one shot.
pub async fn stream_analysis(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StreamAnalysisRequest>,
) -> Response {
    let session = state.registry.create();
    let request = AnalysisRequest {
        text: body.text,
        project: body.project,
        env: body.env,
        domain: body.domain,
    };

    let stream = match state.registry.attach(session.id) {
        Ok(stream) => stream,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "INTERNAL_ERROR: fresh session not attachable"})),
            )
                .into_response();
        }
    };
    tokio::spawn(Arc::clone(&state.pipeline).run(Arc::clone(&session), request));

    Sse::new(sse_stream(stream))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ==================== Artifacts ====================

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub filename: String,
}

fn is_servable_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !name.split('.').all(|part| part.is_empty())
        && name != "."
        && name != ".."
}

/// GET /download/?filename= — serve a generated artifact.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    if !is_servable_filename(&query.filename) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "filename fails the safety pattern"})),
        )
            .into_response();
    }
    let path = state.analysis_dir.join(&query.filename);
    match tokio::fs::read(&path).await {
        Ok(content) => (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", query.filename),
                ),
            ],
            content,
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "artifact not found"})),
        )
            .into_response(),
    }
}

// ==================== Liveness & cache administration ====================

/// GET /health — liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// GET /cache/ping — L2 round-trip probe.
pub async fn cache_ping(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.ping_l2().await {
        Ok(latency_ms) => Json(json!({"ok": true, "latency_ms": latency_ms})).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}

/// GET /cache/stats — counters and configuration echo.
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Response {
    (
        cache_key_headers(&state.gateway),
        Json(state.gateway.stats()),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CacheDeleteRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// POST /cache/delete — remove one or more keys from both tiers.
pub async fn cache_delete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CacheDeleteRequest>,
) -> Json<serde_json::Value> {
    let mut keys = body.keys;
    if let Some(key) = body.key {
        keys.push(key);
    }
    let removed = state.gateway.delete_many(&keys).await;
    Json(json!({"removed": removed}))
}

/// POST /cache/clear-l1 — drop the in-process tier.
pub async fn cache_clear_l1(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.gateway.clear_l1();
    Json(json!({"cleared": true}))
}

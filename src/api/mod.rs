//! Loopback control API.
//!
//! Bound to `127.0.0.1` only. Every request must carry the stored token as
//! `Authorization: Bearer <token>` or `X-ZDMR-Token: <token>`; comparison is
//! constant-time. State-mutating endpoints are idempotent per download ID.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument};

use crate::engine::{Engine, EngineError};
use crate::events::EventHub;
use crate::model::{AddDownloadsRequest, NewBatchRequest};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    engine: Engine,
    hub: EventHub,
    token: Arc<String>,
}

/// Builds the API router.
#[must_use]
pub fn router(engine: Engine, hub: EventHub, token: String) -> Router {
    let state = ApiState {
        engine,
        hub,
        token: Arc::new(token),
    };
    Router::new()
        .route("/downloads", post(post_downloads))
        .route("/batches", post(post_batches))
        .route("/downloads/{id}/pause", post(post_pause))
        .route("/downloads/{id}/resume", post(post_resume))
        .route("/downloads/{id}/retry", post(post_retry))
        .route("/downloads/{id}", delete(delete_download))
        .route("/events", get(get_events))
        .with_state(state)
}

/// Binds the loopback listener and serves until shutdown.
///
/// # Errors
///
/// Returns the bind or serve error.
#[instrument(skip(engine, hub, token))]
pub async fn serve(
    engine: Engine,
    hub: EventHub,
    token: String,
    port: u16,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control api listening");
    axum::serve(listener, router(engine, hub, token)).await
}

/// Constant-time byte comparison; unequal lengths short-circuit, which leaks
/// only the token length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return constant_time_eq(bearer.trim().as_bytes(), token.as_bytes());
        }
    }
    if let Some(value) = headers.get("x-zdmr-token").and_then(|v| v.to_str().ok()) {
        return constant_time_eq(value.trim().as_bytes(), token.as_bytes());
    }
    false
}

fn unauthorized() -> Response {
    StatusCode::UNAUTHORIZED.into_response()
}

fn engine_error(e: &EngineError) -> Response {
    match e {
        EngineError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("download not found: {id}")})),
        )
            .into_response(),
        EngineError::InvalidState { .. } => (
            StatusCode::CONFLICT,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn bad_request(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": detail})),
    )
        .into_response()
}

async fn post_downloads(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    let Ok(req) = serde_json::from_value::<AddDownloadsRequest>(body) else {
        return bad_request("expected {\"urls\": [..], \"dest_dir\"?}");
    };
    if req.urls.is_empty() {
        return bad_request("urls must not be empty");
    }

    match st.engine.add_downloads(req.urls, req.dest_dir, None, false).await {
        Ok(ids) => (StatusCode::CREATED, Json(json!({ "ids": ids }))).into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn post_batches(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    let Ok(req) = serde_json::from_value::<NewBatchRequest>(body) else {
        return bad_request("expected {\"dest_dir\", \"urls\"? , \"raw_url_list\"?, ..}");
    };
    if req.effective_urls().is_empty() {
        return bad_request("batch contains no http(s) URLs");
    }

    match st.engine.add_batch(&req).await {
        Ok((batch_id, ids)) => (
            StatusCode::CREATED,
            Json(json!({ "batch_id": batch_id, "ids": ids })),
        )
            .into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn post_pause(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    match st.engine.pause(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn post_resume(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    match st.engine.resume(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn post_retry(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    match st.engine.retry(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn delete_download(
    State(st): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }
    match st.engine.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}

/// Server-sent events: each event is one JSON line of
/// `{"type": "ProgressBatch" | "DownloadsChanged", "data": ...}`.
async fn get_events(State(st): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &st.token) {
        return unauthorized();
    }

    let rx = st.hub.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => {
                let json = serde_json::to_string(&event)
                    .unwrap_or_else(|_| r#"{"type":"DownloadsChanged"}"#.to_string());
                Some(Ok::<Event, std::convert::Infallible>(
                    Event::default().data(json),
                ))
            }
            // Lagged subscribers just skip ahead.
            Err(_) => None,
        }
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(!constant_time_eq(b"secret-token", b"secret-tokex"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_authorized_accepts_both_header_forms() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok-123".parse().unwrap());
        assert!(authorized(&headers, "tok-123"));

        let mut headers = HeaderMap::new();
        headers.insert("x-zdmr-token", "tok-123".parse().unwrap());
        assert!(authorized(&headers, "tok-123"));
    }

    #[test]
    fn test_authorized_rejects_wrong_or_missing_token() {
        let headers = HeaderMap::new();
        assert!(!authorized(&headers, "tok-123"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(!authorized(&headers, "tok-123"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic tok-123".parse().unwrap());
        assert!(!authorized(&headers, "tok-123"));
    }

    #[test]
    fn test_authorized_trims_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer  tok-123 ".parse().unwrap());
        assert!(authorized(&headers, "tok-123"));
    }
}

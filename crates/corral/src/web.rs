//! HTTP control surface.
//!
//! Four GET endpoints with query parameters, kept intentionally dumb:
//! include/exclude/delete only *express an intention* by enqueuing a
//! pending request - the inclusion list itself changes on the next cycle.
//! `/models` serves the read-only snapshot the last cycle published.

use crate::capture::SessionSet;
use crate::store::{Mode, PendingRequest, SourceKey};
use crate::supervisor::{RequestQueue, Snapshot};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;

/// Shared state for web handlers.
#[derive(Clone)]
pub struct WebState {
    pub queue: RequestQueue,
    pub snapshot: Snapshot,
    pub sessions: SessionSet,
    pub started: Instant,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/include", get(include_model))
        .route("/models/exclude", get(exclude_model))
        .route("/models/delete", get(delete_model))
        .route("/health", get(health))
        .with_state(state)
}

/// Return the cached read-only snapshot of current sources.
async fn list_models(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.snapshot.get())
}

async fn include_model(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // An invalid expire_after falls back to a permanent include rather
    // than rejecting the request.
    let mode = match params.get("expire_after").and_then(|v| v.parse::<f64>().ok()) {
        Some(hours) if hours > 0.0 => {
            Mode::Until(Utc::now().timestamp() + (hours * 3600.0) as i64)
        }
        _ => Mode::Included,
    };
    enqueue(&state, &params, mode)
}

async fn exclude_model(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    enqueue(&state, &params, Mode::Excluded)
}

async fn delete_model(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    enqueue(&state, &params, Mode::Deleted)
}

/// Validate `uid`/`nm`, enqueue the pending request, echo the key back.
fn enqueue(state: &WebState, params: &HashMap<String, String>, mode: Mode) -> Response {
    // A supplied uid must parse; it never falls back to nm.
    let key = match params.get("uid") {
        Some(raw) => raw.parse::<u64>().ok().map(SourceKey::ById),
        None => params
            .get("nm")
            .filter(|nm| !nm.is_empty())
            .map(|nm| SourceKey::ByName(nm.clone())),
    };

    let Some(key) = key else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": "Invalid request"})),
        )
            .into_response();
    };

    let echo = match &key {
        SourceKey::ById(uid) => serde_json::json!({"uid": uid}),
        SourceKey::ByName(nm) => serde_json::json!({"nm": nm}),
    };

    tracing::debug!(key = ?key, mode = ?mode, "Request queued");
    state.queue.push(PendingRequest { key, mode });

    Json(echo).into_response()
}

/// Health and basic statistics.
async fn health(State(state): State<WebState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.started.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": { "active": state.sessions.len() },
        "queue": { "pending": state.queue.len() },
    }))
}

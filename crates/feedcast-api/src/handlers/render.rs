//! /render and /screenshot — build a task, hand it to the coordinator.

use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::Instant;

use feedcast_core::{Task, TaskEnvelope, TaskKind};
use feedcast_services::FetchError;

use super::{result_response, ApiState};

// ── /render (POST) ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RenderRequest {
    pub task: Task,
    /// Maximum acceptable age of a cached result.
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
}

pub async fn handle_render(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RenderRequest>,
) -> Result<Response, (StatusCode, String)> {
    if req.task.kind != TaskKind::Extract {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("/render takes extract tasks, got {}", req.task.kind),
        ));
    }
    let lifetime = state
        .freshness
        .clamp(req.lifetime_secs.map(Duration::from_secs));
    let task = with_request_headers(req.task, &headers);
    run_task(&state, task, lifetime).await
}

// ── /screenshot (POST) ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ScreenshotRequest {
    pub url: String,
}

/// Screenshots are always taken at the shortest allowed lifetime.
pub async fn handle_screenshot(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ScreenshotRequest>,
) -> Result<Response, (StatusCode, String)> {
    let task = with_request_headers(Task::screenshot(req.url), &headers);
    let lifetime = state.freshness.min;
    run_task(&state, task, lifetime).await
}

// ── Shared ────────────────────────────────────────────────────────────────────

/// Replace any headers in the body with the rendering-relevant request headers.
fn with_request_headers(mut task: Task, headers: &HeaderMap) -> Task {
    task.headers.clear();
    task.with_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    )
}

async fn run_task(
    state: &ApiState,
    task: Task,
    lifetime: Duration,
) -> Result<Response, (StatusCode, String)> {
    task.validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let fingerprint = task.fingerprint();
    let payload = TaskEnvelope::new(task)
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let deadline = Instant::now() + state.task_timeout;
    let result = state
        .coordinator
        .fetch_or_compute(deadline, lifetime, &fingerprint, Bytes::from(payload))
        .await;

    match result {
        Ok(body) => Ok(result_response(&fingerprint, body, false)),
        Err(e @ (FetchError::StoreUnavailable(_) | FetchError::WatchClosed(_))) => {
            tracing::warn!(fingerprint = %fingerprint, error = %e, "render failed");
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(e) => {
            let message = e.to_string();
            match e.into_stale() {
                Some(entry) => {
                    tracing::info!(fingerprint = %fingerprint, "serving stale result");
                    Ok(result_response(&fingerprint, entry.payload, true))
                }
                None => Err((StatusCode::GATEWAY_TIMEOUT, message)),
            }
        }
    }
}

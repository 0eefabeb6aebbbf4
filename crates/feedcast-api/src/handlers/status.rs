//! /status, /cache/{fingerprint}, /daemon/shutdown handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use feedcast_core::Fingerprint;
use feedcast_services::{CacheError, QueueStats, ResultCache};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub queue: QueueStats,
    pub cache: CacheInfo,
    /// Fingerprints with callers waiting in this process.
    pub inflight: usize,
    pub dedup_window_secs: u64,
}

#[derive(Serialize)]
pub struct CacheInfo {
    pub bucket: String,
    pub entries: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        queue: state.queue.stats().await,
        cache: CacheInfo {
            bucket: state.cache.bucket().to_string(),
            entries: state.cache.len(),
        },
        inflight: state.coordinator.inflight_count(),
        dedup_window_secs: state.coordinator.dedup_window().as_secs(),
    })
}

// ── /cache/{fingerprint} ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CacheEntryResponse {
    pub fingerprint: String,
    pub written_at: u64,
    pub age_ms: u64,
    /// The payload as JSON, or as a string if it isn't JSON.
    pub payload: serde_json::Value,
}

pub async fn handle_cache_entry(
    State(state): State<ApiState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<CacheEntryResponse>, (StatusCode, String)> {
    let key = Fingerprint::new(fingerprint);
    let entry = state.cache.get(&key).await.map_err(|e| match e {
        CacheError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        CacheError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    })?;

    let payload = serde_json::from_slice(&entry.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&entry.payload).into_owned())
    });

    Ok(Json(CacheEntryResponse {
        fingerprint: key.to_string(),
        written_at: entry.written_at,
        age_ms: entry.age(state.cache.now_ms()).as_millis() as u64,
        payload,
    }))
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    // No receivers just means everything has already stopped.
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}

//! HTTP API handlers — the coordinator API plus broker status as JSON.

pub mod render;
pub mod status;

use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use feedcast_core::config::ApiConfig;
use feedcast_core::Fingerprint;
use feedcast_services::{Coordinator, FreshnessPolicy, MemoryResultCache, MemoryWorkQueue};

pub const FINGERPRINT_HEADER: &str = "x-feedcast-fingerprint";
pub const STALE_HEADER: &str = "x-feedcast-stale";

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
    pub queue: MemoryWorkQueue,
    pub cache: MemoryResultCache,
    pub freshness: FreshnessPolicy,
    /// How long a request may wait for a computation.
    pub task_timeout: Duration,
    /// Fires once to stop workers and the API.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl ApiState {
    pub fn new(
        config: &ApiConfig,
        queue: MemoryWorkQueue,
        cache: MemoryResultCache,
        shutdown_tx: tokio::sync::broadcast::Sender<()>,
    ) -> Self {
        let coordinator = Coordinator::new(
            std::sync::Arc::new(cache.clone()),
            std::sync::Arc::new(queue.clone()),
        );
        Self {
            coordinator,
            queue,
            cache,
            freshness: FreshnessPolicy::from(config),
            task_timeout: config.task_timeout(),
            shutdown_tx,
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// A result payload as returned to the client.
fn result_response(fingerprint: &Fingerprint, body: Bytes, stale: bool) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(fingerprint.as_str()) {
        headers.insert(HeaderName::from_static(FINGERPRINT_HEADER), value);
    }
    if stale {
        headers.insert(
            HeaderName::from_static(STALE_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    response
}

// Re-export handler functions for use in router setup.
pub use render::{handle_render, handle_screenshot};
pub use status::{handle_cache_entry, handle_shutdown, handle_status};

//! Work admission coordinator — cache-aside with single-flight over the broker.
//!
//! `fetch_or_compute` serves a fingerprint from the result cache when the
//! cached entry is young enough, and otherwise admits one computation into
//! the work queue and waits for the worker's write to arrive on the watch.
//!
//! Ordering:
//!   1. open the watch before anything else, so a write racing the check
//!      is delivered rather than lost;
//!   2. judge the replayed entry (if any) against the freshness window;
//!   3. on `Live`, publish with the fingerprint as idempotency token;
//!   4. the first write after `Live` is the answer.
//!
//! The freshness window is clamped up to the broker's dedup window. A
//! shorter window would let a caller see a stale entry, have its publish
//! collapsed into one that already completed, and then wait for a write
//! that never comes.
//!
//! Concurrent callers for the same fingerprint converge on the broker's
//! dedup and the same cache write. The process-local registry only
//! suppresses redundant publishes; correctness never depends on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::time::Instant;

use feedcast_core::config::ApiConfig;
use feedcast_core::Fingerprint;

use crate::result_cache::{CacheEntry, CacheError, ResultCache, WatchEvent};
use crate::work_queue::{QueueError, WorkItem, WorkQueue};

// ── Freshness ─────────────────────────────────────────────────────────────────

/// Operator bounds on caller-supplied freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl FreshnessPolicy {
    /// Clamp a requested window into `[min, max]`. No request means `min`.
    pub fn clamp(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.min).clamp(self.min, self.max.max(self.min))
    }
}

impl From<&ApiConfig> for FreshnessPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            min: config.min_lifetime(),
            max: config.max_lifetime(),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Deadline,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("deadline exceeded waiting for {fingerprint}")]
    DeadlineExceeded {
        fingerprint: Fingerprint,
        /// Last value seen on the watch, however old.
        stale: Option<CacheEntry>,
    },
    #[error("cancelled while waiting for {fingerprint}")]
    Cancelled {
        fingerprint: Fingerprint,
        stale: Option<CacheEntry>,
    },
    #[error("watch on {0} closed by the store")]
    WatchClosed(Fingerprint),
}

impl FetchError {
    pub fn stale(&self) -> Option<&CacheEntry> {
        match self {
            Self::DeadlineExceeded { stale, .. } | Self::Cancelled { stale, .. } => stale.as_ref(),
            _ => None,
        }
    }

    pub fn into_stale(self) -> Option<CacheEntry> {
        match self {
            Self::DeadlineExceeded { stale, .. } | Self::Cancelled { stale, .. } => stale,
            _ => None,
        }
    }
}

impl From<CacheError> for FetchError {
    fn from(e: CacheError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<QueueError> for FetchError {
    fn from(e: QueueError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

// ── In-flight registry ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct InFlight {
    waiters: usize,
    published_at: Option<Instant>,
}

/// Counts one waiter on a fingerprint; removed again on drop.
struct Registration {
    inflight: Arc<DashMap<Fingerprint, InFlight>>,
    fingerprint: Fingerprint,
}

impl Registration {
    fn new(inflight: &Arc<DashMap<Fingerprint, InFlight>>, fingerprint: &Fingerprint) -> Self {
        inflight.entry(fingerprint.clone()).or_default().waiters += 1;
        Self {
            inflight: inflight.clone(),
            fingerprint: fingerprint.clone(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(mut entry) = self.inflight.get_mut(&self.fingerprint) {
            entry.waiters = entry.waiters.saturating_sub(1);
        }
        self.inflight
            .remove_if(&self.fingerprint, |_, f| f.waiters == 0);
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Coordinator {
    cache: Arc<dyn ResultCache>,
    queue: Arc<dyn WorkQueue>,
    inflight: Arc<DashMap<Fingerprint, InFlight>>,
}

impl Coordinator {
    pub fn new(cache: Arc<dyn ResultCache>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            cache,
            queue,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        self.queue.dedup_window()
    }

    /// The window actually used for the publish decision.
    pub fn effective_window(&self, freshness: Duration) -> Duration {
        freshness.max(self.dedup_window())
    }

    /// Fingerprints with at least one caller waiting in this process.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn waiters(&self, fingerprint: &Fingerprint) -> usize {
        self.inflight.get(fingerprint).map(|f| f.waiters).unwrap_or(0)
    }

    /// Serve `fingerprint` from the cache or compute it, giving up at `deadline`.
    pub async fn fetch_or_compute(
        &self,
        deadline: Instant,
        freshness: Duration,
        fingerprint: &Fingerprint,
        payload: Bytes,
    ) -> Result<Bytes, FetchError> {
        let timeout = async move {
            tokio::time::sleep_until(deadline).await;
            Interrupt::Deadline
        };
        self.fetch_or_compute_until(timeout, freshness, fingerprint, payload)
            .await
    }

    /// Like [`fetch_or_compute`](Self::fetch_or_compute), but the wait ends
    /// when `interrupt` resolves. Dropping the returned future is also safe:
    /// the watch and the registration are released, and any admitted
    /// computation keeps running.
    pub async fn fetch_or_compute_until<F>(
        &self,
        interrupt: F,
        freshness: Duration,
        fingerprint: &Fingerprint,
        payload: Bytes,
    ) -> Result<Bytes, FetchError>
    where
        F: Future<Output = Interrupt>,
    {
        let window = self.effective_window(freshness);
        let mut watch = self.cache.watch(fingerprint).await?;
        let _registration = Registration::new(&self.inflight, fingerprint);
        tokio::pin!(interrupt);

        let started = Instant::now();
        let mut last_seen: Option<CacheEntry> = None;
        let mut live = false;

        loop {
            tokio::select! {
                biased;

                event = watch.next() => match event {
                    Some(WatchEvent::Entry(entry)) if !live => {
                        let age = entry.age(self.cache.now_ms());
                        if age <= window {
                            tracing::debug!(
                                fingerprint = fingerprint.short(),
                                age_ms = age.as_millis() as u64,
                                "cache hit"
                            );
                            return Ok(entry.payload);
                        }
                        tracing::debug!(
                            fingerprint = fingerprint.short(),
                            age_ms = age.as_millis() as u64,
                            window_ms = window.as_millis() as u64,
                            "cached entry is stale"
                        );
                        last_seen = Some(entry);
                    }
                    Some(WatchEvent::Entry(entry)) => {
                        tracing::debug!(
                            fingerprint = fingerprint.short(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "computed result arrived"
                        );
                        return Ok(entry.payload);
                    }
                    Some(WatchEvent::Live) => {
                        live = true;
                        self.admit(fingerprint, &payload).await?;
                    }
                    None => return Err(FetchError::WatchClosed(fingerprint.clone())),
                },

                reason = &mut interrupt => {
                    tracing::debug!(
                        fingerprint = fingerprint.short(),
                        ?reason,
                        stale = last_seen.is_some(),
                        "wait interrupted"
                    );
                    let fingerprint = fingerprint.clone();
                    return Err(match reason {
                        Interrupt::Deadline => FetchError::DeadlineExceeded { fingerprint, stale: last_seen },
                        Interrupt::Cancelled => FetchError::Cancelled { fingerprint, stale: last_seen },
                    });
                }
            }
        }
    }

    /// Publish the work item unless a caller in this process already did
    /// so inside the dedup window.
    async fn admit(&self, fingerprint: &Fingerprint, payload: &Bytes) -> Result<(), FetchError> {
        let window = self.dedup_window();
        let now = Instant::now();
        let recently_published = self
            .inflight
            .get(fingerprint)
            .and_then(|f| f.published_at)
            .is_some_and(|at| now.duration_since(at) < window);
        if recently_published {
            tracing::debug!(
                fingerprint = fingerprint.short(),
                "computation already admitted by this process"
            );
            return Ok(());
        }

        let ack = self
            .queue
            .publish(WorkItem {
                fingerprint: fingerprint.clone(),
                payload: payload.clone(),
            })
            .await?;

        if ack.duplicate {
            tracing::debug!(
                fingerprint = fingerprint.short(),
                seq = ack.seq,
                "publish collapsed by dedup window"
            );
        } else {
            // Only an accepted publish starts a window. A duplicate's token
            // was set earlier, at a time this process does not know.
            if let Some(mut f) = self.inflight.get_mut(fingerprint) {
                f.published_at = Some(now);
            }
            tracing::info!(
                fingerprint = %fingerprint,
                seq = ack.seq,
                "render task published"
            );
        }
        Ok(())
    }
}

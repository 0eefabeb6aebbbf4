//! Result cache — the most recent rendered payload per fingerprint.
//!
//! Entries are stamped with the store's clock at write time; callers decide
//! what "fresh" means. `watch` replays the current value (if any), then emits
//! [`WatchEvent::Live`], then every later write in order. The snapshot and
//! the subscription are taken under the same per-key guard as `put`, so no
//! write can fall between them.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;

use feedcast_core::{Clock, Fingerprint, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cached entry for {0}")]
    NotFound(Fingerprint),
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
}

/// A cached payload and when the store accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    /// Unix ms, store clock.
    pub written_at: u64,
}

impl CacheEntry {
    /// Age relative to `now_ms`. Entries stamped in the future count as age 0.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.written_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The current value (during replay) or a new write (after `Live`).
    Entry(CacheEntry),
    /// Replay finished; every later event is a write that happened after
    /// the watch was opened.
    Live,
}

/// Live subscription to one key. Dropping it closes the subscription.
pub type Watch = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<CacheEntry, CacheError>;

    /// Overwrite the entry for `key`, stamping it with the store's clock.
    async fn put(&self, key: &Fingerprint, payload: Bytes) -> Result<(), CacheError>;

    async fn watch(&self, key: &Fingerprint) -> Result<Watch, CacheError>;

    /// Current time as the store sees it.
    fn now_ms(&self) -> u64;
}

// ── In-process store ──────────────────────────────────────────────────────────

const WATCH_CAPACITY: usize = 16;

struct Slot {
    entry: Option<CacheEntry>,
    updates: broadcast::Sender<CacheEntry>,
}

impl Slot {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            entry: None,
            updates,
        }
    }
}

/// In-memory result cache bucket.
#[derive(Clone)]
pub struct MemoryResultCache {
    bucket: Arc<str>,
    slots: Arc<DashMap<Fingerprint, Slot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryResultCache {
    pub fn new(bucket: &str) -> Self {
        Self::with_clock(bucket, Arc::new(SystemClock))
    }

    pub fn with_clock(bucket: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket: Arc::from(bucket),
            slots: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open watches on `key`.
    pub fn watcher_count(&self, key: &Fingerprint) -> usize {
        self.slots
            .get(key)
            .map(|s| s.updates.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &Fingerprint) -> Result<CacheEntry, CacheError> {
        self.slots
            .get(key)
            .and_then(|s| s.entry.clone())
            .ok_or_else(|| CacheError::NotFound(key.clone()))
    }

    async fn put(&self, key: &Fingerprint, payload: Bytes) -> Result<(), CacheError> {
        let entry = CacheEntry {
            payload,
            written_at: self.clock.now_ms(),
        };
        let mut slot = self.slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.entry = Some(entry.clone());
        // No receivers is fine: nobody is watching.
        let _ = slot.updates.send(entry);
        tracing::trace!(bucket = %self.bucket, key = key.short(), "cache entry written");
        Ok(())
    }

    async fn watch(&self, key: &Fingerprint) -> Result<Watch, CacheError> {
        let (current, rx) = {
            let slot = self.slots.entry(key.clone()).or_insert_with(Slot::new);
            (slot.entry.clone(), slot.updates.subscribe())
        };

        let replay = stream::iter(
            current
                .map(WatchEvent::Entry)
                .into_iter()
                .chain(std::iter::once(WatchEvent::Live)),
        );

        let key = key.clone();
        let updates = stream::unfold(rx, move |mut rx| {
            let key = key.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(entry) => return Some((WatchEvent::Entry(entry), rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(key = key.short(), skipped, "watch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(replay.chain(updates)))
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

//! Durable work queue — at-least-once delivery of render tasks to workers.
//!
//! Publishing carries an idempotency token (the fingerprint). A second
//! publish with the same token inside the dedup window is acknowledged but
//! not enqueued. The window runs from the first publish and is independent
//! of whether the item has been consumed yet.
//!
//! Consumers compete for items under one durable name. A delivery stays
//! in flight until it is acked, nak'd or terminated; if none of those
//! happen within `ack_wait` it goes back to the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use feedcast_core::config::BrokerConfig;
use feedcast_core::Fingerprint;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("work queue unavailable: {0}")]
    Unavailable(String),
    #[error("delivery {0} is no longer in flight")]
    UnknownDelivery(u64),
}

/// One admitted computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub fingerprint: Fingerprint,
    /// Encoded task envelope. Opaque to the queue.
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream sequence of the queued item (the original one for duplicates).
    pub seq: u64,
    /// True if the token was already seen inside the dedup window.
    pub duplicate: bool,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish `item` with `item.fingerprint` as the idempotency token.
    async fn publish(&self, item: WorkItem) -> Result<PublishAck, QueueError>;

    /// How long the broker remembers an idempotency token.
    fn dedup_window(&self) -> Duration;
}

/// Delivery bookkeeping, implemented by the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Reset the redelivery timer.
    async fn in_progress(&self, seq: u64) -> Result<(), QueueError>;
    /// Done, remove from the queue.
    async fn ack(&self, seq: u64) -> Result<(), QueueError>;
    /// Redeliver after `delay`.
    async fn nak(&self, seq: u64, delay: Duration) -> Result<(), QueueError>;
    /// Remove without redelivery, regardless of attempts left.
    async fn term(&self, seq: u64) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Wait for the next item. Cancel-safe: dropping the future loses nothing.
    async fn next(&self) -> Result<Delivery, QueueError>;

    /// Leave the durable subscription.
    async fn deregister(&self);
}

/// A delivered item plus the handle used to settle it.
pub struct Delivery {
    pub seq: u64,
    /// 1 on first delivery.
    pub attempt: u32,
    pub subject: String,
    pub item: WorkItem,
    pub ack_wait: Duration,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        seq: u64,
        attempt: u32,
        subject: String,
        item: WorkItem,
        ack_wait: Duration,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            seq,
            attempt,
            subject,
            item,
            ack_wait,
            acker,
        }
    }

    pub async fn in_progress(&self) -> Result<(), QueueError> {
        self.acker.in_progress(self.seq).await
    }

    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack(self.seq).await
    }

    pub async fn nak(&self, delay: Duration) -> Result<(), QueueError> {
        self.acker.nak(self.seq, delay).await
    }

    pub async fn term(&self) -> Result<(), QueueError> {
        self.acker.term(self.seq).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("seq", &self.seq)
            .field("attempt", &self.attempt)
            .field("subject", &self.subject)
            .finish()
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub subject_prefix: String,
    pub dedup_window: Duration,
    pub ack_wait: Duration,
    /// 0 = unlimited.
    pub max_deliver: u32,
}

impl From<&BrokerConfig> for QueueSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            subject_prefix: config.subject_prefix.clone(),
            dedup_window: config.dedup_window(),
            ack_wait: config.ack_wait(),
            max_deliver: config.max_deliver,
        }
    }
}

impl QueueSettings {
    pub fn subject(&self, fingerprint: &Fingerprint) -> String {
        format!("{}.{}", self.subject_prefix, fingerprint)
    }
}

// ── In-process broker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub consumers: usize,
    /// Items accepted into the queue.
    pub published: u64,
    /// Publishes dropped by the dedup window.
    pub duplicates: u64,
    pub redelivered: u64,
    /// Items dropped after `max_deliver` attempts.
    pub dead_lettered: u64,
}

struct Pending {
    seq: u64,
    item: WorkItem,
    /// Deliveries so far.
    attempt: u32,
    not_before: Option<Instant>,
}

struct InFlight {
    item: WorkItem,
    attempt: u32,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    /// token → (seq, first publish)
    dedup: HashMap<Fingerprint, (u64, Instant)>,
    pending: VecDeque<Pending>,
    in_flight: HashMap<u64, InFlight>,
    stats: QueueStats,
}

struct Shared {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Work-queue stream held in process memory.
#[derive(Clone)]
pub struct MemoryWorkQueue {
    shared: Arc<Shared>,
}

impl MemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.shared.settings
    }

    /// Join the durable subscription `durable`.
    pub async fn consumer(&self, durable: &str) -> MemoryConsumer {
        let mut state = self.shared.state.lock().await;
        state.stats.consumers += 1;
        tracing::debug!(durable, consumers = state.stats.consumers, "consumer registered");
        MemoryConsumer {
            shared: self.shared.clone(),
            durable: durable.to_string(),
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            ..state.stats.clone()
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, item: WorkItem) -> Result<PublishAck, QueueError> {
        let settings = &self.shared.settings;
        let now = Instant::now();
        let mut state = self.shared.state.lock().await;

        state
            .dedup
            .retain(|_, (_, at)| now.duration_since(*at) < settings.dedup_window);

        if let Some((seq, _)) = state.dedup.get(&item.fingerprint) {
            let seq = *seq;
            state.stats.duplicates += 1;
            return Ok(PublishAck {
                seq,
                duplicate: true,
            });
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.dedup.insert(item.fingerprint.clone(), (seq, now));
        state.pending.push_back(Pending {
            seq,
            item,
            attempt: 0,
            not_before: None,
        });
        state.stats.published += 1;
        drop(state);

        self.shared.notify.notify_one();
        Ok(PublishAck {
            seq,
            duplicate: false,
        })
    }

    fn dedup_window(&self) -> Duration {
        self.shared.settings.dedup_window
    }
}

impl Shared {
    /// Pop a deliverable item, or report when to look again.
    fn try_take(&self, state: &mut QueueState, now: Instant) -> Result<Pending, Option<Instant>> {
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(f) = state.in_flight.remove(&seq) {
                tracing::debug!(seq, attempt = f.attempt, "ack wait expired, redelivering");
                state.stats.redelivered += 1;
                state.pending.push_front(Pending {
                    seq,
                    item: f.item,
                    attempt: f.attempt,
                    not_before: None,
                });
            }
        }

        let max_deliver = self.settings.max_deliver;
        let mut i = 0;
        while i < state.pending.len() {
            let ready = state.pending[i].not_before.map_or(true, |t| t <= now);
            if !ready {
                i += 1;
                continue;
            }
            let Some(p) = state.pending.remove(i) else {
                break;
            };
            if max_deliver > 0 && p.attempt >= max_deliver {
                tracing::warn!(
                    seq = p.seq,
                    fingerprint = p.item.fingerprint.short(),
                    attempts = p.attempt,
                    "max deliveries reached, dropping item"
                );
                state.stats.dead_lettered += 1;
                continue;
            }
            return Ok(p);
        }

        let next_deadline = state.in_flight.values().map(|f| f.deadline).min();
        let next_ready = state.pending.iter().filter_map(|p| p.not_before).min();
        Err(match (next_deadline, next_ready) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}

#[async_trait]
impl Acker for Shared {
    async fn in_progress(&self, seq: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let f = state
            .in_flight
            .get_mut(&seq)
            .ok_or(QueueError::UnknownDelivery(seq))?;
        f.deadline = Instant::now() + self.settings.ack_wait;
        Ok(())
    }

    async fn ack(&self, seq: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&seq)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(seq))
    }

    async fn nak(&self, seq: u64, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let f = state
            .in_flight
            .remove(&seq)
            .ok_or(QueueError::UnknownDelivery(seq))?;
        state.stats.redelivered += 1;
        state.pending.push_back(Pending {
            seq,
            item: f.item,
            attempt: f.attempt,
            not_before: Some(Instant::now() + delay),
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn term(&self, seq: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&seq)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(seq))
    }
}

/// One member of a durable subscription on a [`MemoryWorkQueue`].
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    durable: String,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&self) -> Result<Delivery, QueueError> {
        loop {
            let wake_at = {
                let now = Instant::now();
                let mut state = self.shared.state.lock().await;
                match self.shared.try_take(&mut state, now) {
                    Ok(p) => {
                        let attempt = p.attempt + 1;
                        state.in_flight.insert(
                            p.seq,
                            InFlight {
                                item: p.item.clone(),
                                attempt,
                                deadline: now + self.shared.settings.ack_wait,
                            },
                        );
                        return Ok(Delivery::new(
                            p.seq,
                            attempt,
                            self.shared.settings.subject(&p.item.fingerprint),
                            p.item,
                            self.shared.settings.ack_wait,
                            self.shared.clone(),
                        ));
                    }
                    Err(wake_at) => wake_at,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.shared.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.shared.notify.notified().await,
            }
        }
    }

    async fn deregister(&self) {
        let mut state = self.shared.state.lock().await;
        state.stats.consumers = state.stats.consumers.saturating_sub(1);
        tracing::debug!(
            durable = %self.durable,
            consumers = state.stats.consumers,
            "consumer deregistered"
        );
    }
}

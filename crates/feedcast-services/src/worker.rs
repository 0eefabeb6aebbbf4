//! Worker consumption loop — pulls render tasks, runs them, settles the
//! delivery and publishes the result.
//!
//! Per item:
//!   Delivered → InProgress → Completed | Discarded | Requeued
//!
//! The delivery is settled as soon as the executor returns. A successful
//! result is then written to the cache; a failed write is logged but the
//! item is not redelivered, since the computation already happened.
//!
//! The executor runs on its own task so a panic is contained to the item
//! that caused it. While it runs, the delivery is marked in-progress at
//! half the ack wait so the broker doesn't hand it to another worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use feedcast_core::TaskEnvelope;

use crate::cookies::{CookieStore, NoCookies};
use crate::executor::{truncate, TaskExecutor, TaskFailure, TaskOutcome, TaskRequest};
use crate::limiter::{Admission, RateLimiter, Unlimited};
use crate::result_cache::ResultCache;
use crate::work_queue::{Delivery, QueueConsumer};

const PULL_BACKOFF: Duration = Duration::from_secs(1);
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Lifecycle of one delivered item inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Delivered,
    InProgress,
    /// Result computed and handed to the cache.
    Completed,
    /// Failed, removed from the queue.
    Discarded,
    /// Failed or deferred, scheduled for redelivery.
    Requeued,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Discarded | Self::Requeued)
    }

    pub fn can_advance_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Delivered, InProgress)
                | (Delivered, Discarded)
                | (InProgress, Completed)
                | (InProgress, Discarded)
                | (InProgress, Requeued)
        )
    }

    fn advance(&mut self, next: ItemState) {
        debug_assert!(self.can_advance_to(next), "{self:?} -> {next:?}");
        *self = next;
    }
}

pub struct Worker {
    name: String,
    consumer: Arc<dyn QueueConsumer>,
    cache: Arc<dyn ResultCache>,
    executor: Arc<dyn TaskExecutor>,
    limiter: Arc<dyn RateLimiter>,
    cookies: Arc<dyn CookieStore>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<dyn QueueConsumer>,
        cache: Arc<dyn ResultCache>,
        executor: Arc<dyn TaskExecutor>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            cache,
            executor,
            limiter: Arc::new(Unlimited),
            cookies: Arc::new(NoCookies),
            shutdown,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_cookie_store(mut self, cookies: Arc<dyn CookieStore>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Pull until shutdown. An item already being processed is finished
    /// before the loop exits.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(worker = %self.name, "worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(worker = %self.name, "worker shutting down");
                    break;
                }
                delivery = self.consumer.next() => match delivery {
                    Ok(delivery) => {
                        self.process(delivery).await;
                    }
                    Err(e) => {
                        tracing::warn!(worker = %self.name, error = %e, "pull failed");
                        tokio::time::sleep(PULL_BACKOFF).await;
                    }
                },
            }
        }
        self.consumer.deregister().await;
        Ok(())
    }

    /// Run one delivery to a terminal state.
    pub async fn process(&self, delivery: Delivery) -> ItemState {
        let mut state = ItemState::Delivered;
        let fingerprint = delivery.item.fingerprint.clone();

        let envelope = match TaskEnvelope::decode(&delivery.item.payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(
                    worker = %self.name,
                    fingerprint = fingerprint.short(),
                    seq = delivery.seq,
                    error = %e,
                    "undecodable task payload, terminating"
                );
                self.settle(&delivery, Settle::Term).await;
                state.advance(ItemState::Discarded);
                return state;
            }
        };

        // A mismatch means edge and worker disagree on the wire format;
        // a result stored under either key would be wrong.
        let recomputed = envelope.task.fingerprint();
        if recomputed != fingerprint {
            tracing::error!(
                worker = %self.name,
                published = %fingerprint,
                recomputed = %recomputed,
                "fingerprint mismatch, terminating"
            );
            self.settle(&delivery, Settle::Term).await;
            state.advance(ItemState::Discarded);
            return state;
        }

        if let Err(e) = delivery.in_progress().await {
            tracing::warn!(seq = delivery.seq, error = %e, "failed to mark in progress");
        }
        state.advance(ItemState::InProgress);

        let origin = match envelope.task.origin() {
            Ok(origin) => {
                if let Admission::Wait(delay) = self.limiter.admit(&origin).await {
                    tracing::debug!(
                        worker = %self.name,
                        fingerprint = fingerprint.short(),
                        origin = %origin,
                        delay_ms = delay.as_millis() as u64,
                        "origin over budget, deferring"
                    );
                    self.settle(&delivery, Settle::Nak(delay)).await;
                    state.advance(ItemState::Requeued);
                    return state;
                }
                origin
            }
            Err(e) => {
                tracing::warn!(fingerprint = fingerprint.short(), error = %e, "invalid task target");
                self.settle(&delivery, Settle::Term).await;
                state.advance(ItemState::Discarded);
                return state;
            }
        };

        // A cookie sent with the request wins over the jar.
        let cookies = if envelope.task.headers.contains_key("Cookie") {
            None
        } else {
            self.cookies.cookies_for(&origin).await
        };
        let request = TaskRequest {
            fingerprint: fingerprint.clone(),
            task: envelope.task,
            attempt: delivery.attempt,
            cookies,
        };
        tracing::info!(
            worker = %self.name,
            fingerprint = %fingerprint,
            attempt = delivery.attempt,
            "executing task"
        );
        let start = Instant::now();
        let outcome = self.execute_with_heartbeat(&delivery, request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(TaskOutcome::Completed(result)) => {
                self.settle(&delivery, Settle::Ack).await;
                state.advance(ItemState::Completed);
                let bytes = result.len();
                match self.cache.put(&fingerprint, result).await {
                    Ok(()) => tracing::info!(
                        worker = %self.name,
                        fingerprint = %fingerprint,
                        elapsed_ms,
                        bytes,
                        "task completed"
                    ),
                    Err(e) => tracing::error!(
                        worker = %self.name,
                        fingerprint = %fingerprint,
                        error = %e,
                        "failed to store result"
                    ),
                }
            }
            Ok(TaskOutcome::Failed(TaskFailure {
                reason,
                retry_after: Some(delay),
            })) => {
                tracing::warn!(
                    worker = %self.name,
                    fingerprint = %fingerprint,
                    elapsed_ms,
                    reason = %truncate(&reason, 100),
                    retry_ms = delay.as_millis() as u64,
                    "task failed, requeueing"
                );
                self.settle(&delivery, Settle::Nak(delay)).await;
                state.advance(ItemState::Requeued);
            }
            Ok(TaskOutcome::Failed(TaskFailure { reason, .. })) => {
                tracing::warn!(
                    worker = %self.name,
                    fingerprint = %fingerprint,
                    elapsed_ms,
                    reason = %truncate(&reason, 100),
                    "task failed"
                );
                self.settle(&delivery, Settle::Ack).await;
                state.advance(ItemState::Discarded);
            }
            Err(fault) => {
                tracing::error!(
                    worker = %self.name,
                    fingerprint = %fingerprint,
                    fault = %fault,
                    "executor fault, terminating item"
                );
                self.settle(&delivery, Settle::Term).await;
                state.advance(ItemState::Discarded);
            }
        }
        state
    }

    /// Run the executor on its own task, refreshing the ack deadline while
    /// it runs. `Err` carries a description of a panic or abort.
    async fn execute_with_heartbeat(
        &self,
        delivery: &Delivery,
        request: TaskRequest,
    ) -> Result<TaskOutcome, String> {
        let executor = self.executor.clone();
        let mut job = tokio::spawn(async move { executor.execute(request).await });

        let period = (delivery.ack_wait / 2).max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                joined = &mut job => {
                    return joined.map_err(|e| {
                        if e.is_panic() {
                            panic_message(e.into_panic())
                        } else {
                            "executor task aborted".to_string()
                        }
                    });
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = delivery.in_progress().await {
                        tracing::debug!(seq = delivery.seq, error = %e, "in-progress refresh failed");
                    }
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, how: Settle) {
        let result = match how {
            Settle::Ack => delivery.ack().await,
            Settle::Nak(delay) => delivery.nak(delay).await,
            Settle::Term => delivery.term().await,
        };
        if let Err(e) = result {
            tracing::warn!(
                worker = %self.name,
                seq = delivery.seq,
                ?how,
                error = %e,
                "failed to settle delivery"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Nak(Duration),
    Term,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

//! feedcast integration test harness.
//!
//! Tests run the coordinator, broker and workers together in one process.
//! Most use paused tokio time: the cache is stamped by [`PausedClock`],
//! so `tokio::time::advance` moves queue deadlines, dedup windows and
//! cache ages together.
//!
//!   cargo test --test integration

mod coordinator;
mod end_to_end;
mod worker;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use feedcast_core::{Clock, Fingerprint, Selectors, Task, TaskEnvelope};
use feedcast_services::{
    Coordinator, FetchError, MemoryResultCache, MemoryWorkQueue, QueueSettings, TaskExecutor,
    TaskOutcome, TaskRequest, Worker,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const START_MS: u64 = 1_700_000_000_000;

/// Store clock that follows tokio's (pausable) clock.
#[derive(Clone)]
pub struct PausedClock {
    origin: Instant,
}

impl PausedClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now_ms(&self) -> u64 {
        START_MS + self.origin.elapsed().as_millis() as u64
    }
}

/// One broker, one coordinator, any number of workers.
pub struct Cluster {
    pub queue: MemoryWorkQueue,
    pub cache: MemoryResultCache,
    pub coordinator: Coordinator,
    pub shutdown: broadcast::Sender<()>,
}

impl Cluster {
    pub fn new(dedup_window: Duration) -> Self {
        let queue = MemoryWorkQueue::new(QueueSettings {
            subject_prefix: "render_tasks".to_string(),
            dedup_window,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        });
        let cache = MemoryResultCache::with_clock("render_cache", Arc::new(PausedClock::new()));
        let coordinator = Coordinator::new(Arc::new(cache.clone()), Arc::new(queue.clone()));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            queue,
            cache,
            coordinator,
            shutdown,
        }
    }

    pub async fn spawn_worker(
        &self,
        name: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> JoinHandle<anyhow::Result<()>> {
        let worker = Worker::new(
            name,
            Arc::new(self.queue.consumer("worker").await),
            Arc::new(self.cache.clone()),
            executor,
            self.shutdown.subscribe(),
        );
        tokio::spawn(worker.run())
    }

    /// Start a caller on its own task with a 30s deadline.
    pub fn fetch(
        &self,
        freshness: Duration,
        fingerprint: &Fingerprint,
        payload: Bytes,
    ) -> JoinHandle<Result<Bytes, FetchError>> {
        let coordinator = self.coordinator.clone();
        let fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(30);
            coordinator
                .fetch_or_compute(deadline, freshness, &fingerprint, payload)
                .await
        })
    }

    /// Wait until `n` callers are watching `fingerprint`.
    pub async fn until_waiting(&self, fingerprint: &Fingerprint, n: usize) {
        while self.coordinator.waiters(fingerprint) < n {
            tokio::task::yield_now().await;
        }
    }
}

/// An extract task for `url` and its encoded envelope.
pub fn extract_task(url: &str) -> (Fingerprint, Bytes) {
    let task = Task::extract(
        url,
        Selectors {
            post: "article".to_string(),
            title: "h1".to_string(),
            link: "a".to_string(),
            ..Selectors::default()
        },
    );
    let fingerprint = task.fingerprint();
    let payload = TaskEnvelope::new(task).encode().expect("encode task");
    (fingerprint, Bytes::from(payload))
}

type Respond = dyn Fn(&TaskRequest, u32) -> TaskOutcome + Send + Sync;

/// Executor driven by a closure; sleeps `delay` before answering.
pub struct ScriptedExecutor {
    delay: Duration,
    respond: Box<Respond>,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(
        delay: Duration,
        respond: impl Fn(&TaskRequest, u32) -> TaskOutcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            delay,
            respond: Box::new(respond),
            calls: AtomicU32::new(0),
        })
    }

    /// Always answers `body`.
    pub fn constant(delay: Duration, body: &'static str) -> Arc<Self> {
        Self::new(delay, move |_, _| TaskOutcome::Completed(Bytes::from_static(body.as_bytes())))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: TaskRequest) -> TaskOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&request, call)
    }
}

//! feedcast-services — broker primitives and the protocol built on them.
//!
//! `result_cache` and `work_queue` define the broker contract and ship an
//! in-process implementation. `coordinator` is the caller side of the
//! protocol, `worker` the consumer side; `executor`, `limiter` and
//! `cookies` are the seams the worker calls out through.

pub mod cookies;
pub mod coordinator;
pub mod executor;
pub mod limiter;
pub mod result_cache;
pub mod work_queue;
pub mod worker;

pub use cookies::{CookieStore, MemoryCookieStore, NoCookies};
pub use coordinator::{Coordinator, FetchError, FreshnessPolicy, Interrupt};
pub use executor::{CommandExecutor, TaskExecutor, TaskFailure, TaskOutcome, TaskRequest};
pub use limiter::{Admission, RateLimiter, Unlimited};
pub use result_cache::{CacheEntry, CacheError, MemoryResultCache, ResultCache, Watch, WatchEvent};
pub use work_queue::{
    Delivery, MemoryConsumer, MemoryWorkQueue, PublishAck, QueueConsumer, QueueError,
    QueueSettings, QueueStats, WorkItem, WorkQueue,
};
pub use worker::{ItemState, Worker};

//! feedcast-core — task model, fingerprints, wire envelope, clock and configuration.
//! All other feedcast crates depend on this one.

pub mod clock;
pub mod config;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use task::{
    ExtractFrom, FeedItem, FeedResult, Fingerprint, ScreenshotResult, Selectors, Task,
    TaskEnvelope, TaskError, TaskKind,
};

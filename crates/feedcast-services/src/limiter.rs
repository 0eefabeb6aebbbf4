//! Per-origin admission control seam.
//!
//! The worker asks before executing; a `Wait` turns into a delayed
//! redelivery instead of a render. Real limiters (leaky bucket shared
//! between workers) plug in here.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Origin is over its budget; try again after this long.
    Wait(Duration),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn admit(&self, origin: &str) -> Admission;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn admit(&self, _origin: &str) -> Admission {
        Admission::Granted
    }
}

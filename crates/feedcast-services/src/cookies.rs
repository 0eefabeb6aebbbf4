//! Per-origin cookie jar seam.
//!
//! The worker asks for an origin's cookies when a task carries none of its
//! own, and hands them to the executor next to the task. They are never
//! part of the task itself, so they never change its fingerprint.

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for `origin`, if any is stored.
    async fn cookies_for(&self, origin: &str) -> Option<String>;

    async fn remember(&self, origin: &str, cookie: String);
}

/// Stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCookies;

#[async_trait]
impl CookieStore for NoCookies {
    async fn cookies_for(&self, _origin: &str) -> Option<String> {
        None
    }

    async fn remember(&self, _origin: &str, _cookie: String) {}
}

/// Process-local jar keyed by origin. The last write wins.
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    jar: DashMap<String, String>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CookieStore for MemoryCookieStore {
    async fn cookies_for(&self, origin: &str) -> Option<String> {
        self.jar.get(origin).map(|c| c.value().clone())
    }

    async fn remember(&self, origin: &str, cookie: String) {
        if cookie.is_empty() {
            self.jar.remove(origin);
        } else {
            self.jar.insert(origin.to_string(), cookie);
        }
    }
}

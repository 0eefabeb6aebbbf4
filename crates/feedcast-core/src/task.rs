//! Render tasks, their fingerprints, and the payload envelope that travels
//! through the work queue.
//!
//! The fingerprint is both the cache key and the queue idempotency token,
//! so it must cover every field that changes what the renderer produces.
//! Adding a field to [`Task`] means adding it to [`Task::fingerprint`].

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Request headers that change what a page renders. Everything else is
/// dropped by the edge before the task is built.
pub const RENDER_HEADERS: [&str; 2] = ["Accept-Language", "Cookie"];

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to encode task: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode task payload: {0}")]
    Decode(serde_json::Error),
    #[error("unsupported task envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid task url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("missing required selector: {0}")]
    MissingSelector(&'static str),
}

// ── Task ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Extract,
    PageScreenshot,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Extract => "extract",
            TaskKind::PageScreenshot => "page_screenshot",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the "created" timestamp of a post is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractFrom {
    #[default]
    InnerText,
    Attribute,
}

impl ExtractFrom {
    fn as_str(&self) -> &'static str {
        match self {
            ExtractFrom::InnerText => "inner_text",
            ExtractFrom::Attribute => "attribute",
        }
    }
}

/// CSS selectors for an extract task. Empty string means "not used".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub post: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub created: String,
    pub created_extract_from: ExtractFrom,
    pub created_attribute_name: String,
    pub content: String,
    pub enclosure: String,
}

/// One unit of render work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub url: String,
    #[serde(default)]
    pub selectors: Selectors,
    /// Per-request headers that alter rendering (see [`RENDER_HEADERS`]).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Task {
    pub fn extract(url: impl Into<String>, selectors: Selectors) -> Self {
        Self {
            kind: TaskKind::Extract,
            url: url.into(),
            selectors,
            headers: BTreeMap::new(),
        }
    }

    pub fn screenshot(url: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::PageScreenshot,
            url: url.into(),
            selectors: Selectors::default(),
            headers: BTreeMap::new(),
        }
    }

    /// Keep only headers listed in [`RENDER_HEADERS`] with non-empty values.
    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (name, value) in headers {
            if value.is_empty() {
                continue;
            }
            if let Some(canonical) = RENDER_HEADERS
                .iter()
                .find(|h| h.eq_ignore_ascii_case(name))
            {
                self.headers.insert((*canonical).to_string(), value.to_string());
            }
        }
        self
    }

    /// Structural checks. Selector syntax is the renderer's business.
    pub fn validate(&self) -> Result<(), TaskError> {
        self.parsed_url()?;
        if self.kind == TaskKind::Extract {
            let required = [
                ("post", &self.selectors.post),
                ("title", &self.selectors.title),
                ("link", &self.selectors.link),
            ];
            for (name, value) in required {
                if value.trim().is_empty() {
                    return Err(TaskError::MissingSelector(name));
                }
            }
        }
        Ok(())
    }

    /// Host of the target URL. Used as the per-origin rate-limit key.
    pub fn origin(&self) -> Result<String, TaskError> {
        let url = self.parsed_url()?;
        url.host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| TaskError::InvalidUrl {
                url: self.url.clone(),
                reason: "no host".to_string(),
            })
    }

    fn parsed_url(&self) -> Result<url::Url, TaskError> {
        let url = url::Url::parse(&self.url).map_err(|e| TaskError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(TaskError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// Stable cache key / idempotency token for this task.
    ///
    ///   fingerprint = "{kind}_" + hex(BLAKE3(len || field, ...))
    ///
    /// Every field is length-prefixed (u64 LE) so adjacent fields can't
    /// bleed into each other ("ab" + "c" vs "a" + "bc"). Headers are hashed
    /// in key order, which `BTreeMap` guarantees.
    pub fn fingerprint(&self) -> Fingerprint {
        let s = &self.selectors;
        let mut h = blake3::Hasher::new();
        write_field(&mut h, self.kind.as_str().as_bytes());
        write_field(&mut h, self.url.as_bytes());
        write_field(&mut h, s.post.as_bytes());
        write_field(&mut h, s.title.as_bytes());
        write_field(&mut h, s.link.as_bytes());
        write_field(&mut h, s.description.as_bytes());
        write_field(&mut h, s.author.as_bytes());
        write_field(&mut h, s.created.as_bytes());
        write_field(&mut h, s.created_extract_from.as_str().as_bytes());
        write_field(&mut h, s.created_attribute_name.as_bytes());
        write_field(&mut h, s.content.as_bytes());
        write_field(&mut h, s.enclosure.as_bytes());
        h.update(&(self.headers.len() as u64).to_le_bytes());
        for (name, value) in &self.headers {
            write_field(&mut h, name.as_bytes());
            write_field(&mut h, value.as_bytes());
        }
        Fingerprint(format!("{}_{}", self.kind, hex::encode(h.finalize().as_bytes())))
    }
}

fn write_field(h: &mut blake3::Hasher, bytes: &[u8]) {
    h.update(&(bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

// ── Fingerprint ───────────────────────────────────────────────────────────────

/// Cache key and queue idempotency token for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed fingerprint, e.g. one received over the wire.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(24)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Versioned queue payload. The coordinator treats the encoded bytes as
/// opaque; only the worker decodes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub version: u32,
    pub task: Task,
}

impl TaskEnvelope {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(task: Task) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            task,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(self).map_err(TaskError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, TaskError> {
        let envelope: TaskEnvelope = serde_json::from_slice(data).map_err(TaskError::Decode)?;
        if envelope.version != Self::CURRENT_VERSION {
            return Err(TaskError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Result of an extract task, as written to the cache by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedResult {
    pub title: String,
    pub items: Vec<FeedItem>,
    pub icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedItem {
    pub title: String,
    /// RFC 3339, empty if the page had no parseable date.
    pub created: String,
    pub updated: String,
    pub author_name: String,
    pub author_link: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub enclosure: String,
}

/// Result of a page screenshot task. The image travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotResult {
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub image: Vec<u8>,
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    BASE64.decode(text).map_err(serde::de::Error::custom)
}

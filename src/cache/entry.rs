//! Stored page entries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// An entry without a positive TTL never expires.
pub fn is_fresh(created: i64, ttl: Option<i64>, now: i64) -> bool {
    match ttl {
        Some(ttl) if ttl > 0 => now - created < ttl,
        _ => true,
    }
}

/// Metadata persisted alongside a cached body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    200
}

impl EntryMeta {
    pub fn age(&self, now: i64) -> i64 {
        (now - self.created).max(0)
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        is_fresh(self.created, self.ttl, now)
    }
}

/// A cached response: metadata plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub body: Bytes,
}

impl CacheEntry {
    pub fn key(&self) -> &str {
        &self.meta.key
    }

    pub fn uri(&self) -> &str {
        &self.meta.uri
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.meta.headers
    }

    pub fn tags(&self) -> &[String] {
        &self.meta.tags
    }

    pub fn age(&self, now: i64) -> i64 {
        self.meta.age(now)
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.meta.is_fresh(now)
    }
}

/// Response data handed to a backend for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
    pub status: u16,
    /// Absolute URL the response was rendered for.
    pub uri: String,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>, uri: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: Vec::new(),
            status: 200,
            uri: uri.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

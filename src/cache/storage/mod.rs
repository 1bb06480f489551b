//! Storage backends for cached pages.
//!
//! Every backend keeps secondary indexes by tag and by URI so entries can be
//! invalidated selectively. The public contract is deliberately infallible:
//! lookups that fail are misses, writes that fail return `false`, and purges
//! log their problems and carry on.

mod disk;
mod factory;
mod index;
mod kv;

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::entry::{CacheEntry, Payload};
use super::tags::TagSet;

pub use disk::{DiskLayout, DiskStorage};
pub use factory::{BackendKind, BackendOptions, StorageFactory};
pub use index::{IndexBookkeeper, IndexKind, IndexStore};
pub use kv::{DEFAULT_NAMESPACE, KeyValueStorage, KvClient, MemcachedKv, MemoryKv, RedisKv};

/// A cache storage backend.
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store `payload` under `key`, replacing any existing entry.
    ///
    /// `ttl` of `None` or `<= 0` means the entry never expires by time.
    fn set(&self, key: &str, payload: Payload, tags: &TagSet, ttl: Option<i64>) -> bool;

    fn delete(&self, key: &str);

    /// Remove every entry and index, leaving the backend ready for reuse.
    fn clear(&self);

    fn purge_tags(&self, tags: &TagSet);

    fn purge_uri(&self, uri: &str);

    /// Remove entries whose TTL has elapsed and return how many went away.
    fn sweep_expired(&self) -> usize {
        0
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode cache record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cache record `{name}`: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn decode(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            name: name.into(),
            source,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<memcache::MemcacheError> for StorageError {
    fn from(err: memcache::MemcacheError) -> Self {
        Self::Backend(err.to_string())
    }
}

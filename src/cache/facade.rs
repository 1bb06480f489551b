//! Cache facade.
//!
//! Owns one storage backend and layers the bookkeeping callers expect on
//! top of it: tag adjustment before writes, hit/miss statistics and a short
//! log of recent purges. Statistics and the purge log live in a state
//! directory next to the cache, so they survive `purge_all`.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, instrument, warn};

use super::entry::{CacheEntry, Payload, unix_now};
use super::fsutil::{read_json, write_atomic};
use super::lock::mutex_lock;
use super::storage::StorageBackend;
use super::tags::TagSet;

pub const METRIC_CACHE_HIT: &str = "pagehold_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "pagehold_cache_miss_total";
pub const METRIC_CACHE_BYPASS: &str = "pagehold_cache_bypass_total";
pub const METRIC_CACHE_STORE: &str = "pagehold_cache_store_total";
pub const METRIC_CACHE_STORE_FAILED: &str = "pagehold_cache_store_failed_total";
pub const METRIC_CACHE_PURGE: &str = "pagehold_cache_purge_total";

pub const PURGE_LOG_CAPACITY: usize = 10;
const STATS_FILE: &str = "stats.json";
const PURGES_FILE: &str = "purges.json";

pub type TagAdjustHook = Arc<dyn Fn(&str, &mut TagSet) + Send + Sync>;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn ratio(&self) -> HitRatio {
        let total = self.hits + self.misses;
        if total == 0 {
            HitRatio::NoData
        } else {
            HitRatio::Percent(self.hits as f64 / total as f64 * 100.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitRatio {
    NoData,
    Percent(f64),
}

impl fmt::Display for HitRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => f.write_str("?"),
            Self::Percent(value) => write!(f, "{value:.2}%"),
        }
    }
}

#[derive(Debug, Default)]
struct StateSnapshot {
    stats: CacheStats,
    purges: VecDeque<String>,
}

/// Statistics and purge log, persisted when a directory is configured.
///
/// Every update re-reads the files so several processes sharing one state
/// directory accumulate into the same counters.
#[derive(Debug, Default)]
pub struct FacadeState {
    dir: Option<PathBuf>,
    memory: Mutex<StateSnapshot>,
}

impl FacadeState {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            memory: Mutex::new(StateSnapshot::default()),
        }
    }

    fn path(&self, file: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(file))
    }

    fn persist<T: Serialize>(path: &Path, value: &T) {
        let result = serde_json::to_vec(value)
            .map_err(std::io::Error::other)
            .and_then(|encoded| write_atomic(path, &encoded));
        if let Err(err) = result {
            warn!(
                op = "facade::persist",
                path = %path.display(),
                error = %err,
                "Failed to persist cache state"
            );
        }
    }

    fn update_stats(&self, apply: impl FnOnce(&mut CacheStats)) {
        let mut memory = mutex_lock(&self.memory, "cache::facade", "update_stats");
        if let Some(path) = self.path(STATS_FILE) {
            memory.stats = read_json(&path).unwrap_or_default();
            apply(&mut memory.stats);
            Self::persist(&path, &memory.stats);
        } else {
            apply(&mut memory.stats);
        }
    }

    fn push_purge(&self, line: String) {
        let mut memory = mutex_lock(&self.memory, "cache::facade", "push_purge");
        if let Some(path) = self.path(PURGES_FILE) {
            memory.purges = read_json(&path).unwrap_or_default();
        }
        memory.purges.push_front(line);
        memory.purges.truncate(PURGE_LOG_CAPACITY);
        if let Some(path) = self.path(PURGES_FILE) {
            Self::persist(&path, &memory.purges);
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self.path(STATS_FILE) {
            Some(path) => read_json(&path).unwrap_or_default(),
            None => mutex_lock(&self.memory, "cache::facade", "stats").stats,
        }
    }

    /// Recent purge records, newest first.
    pub fn purges(&self) -> Vec<String> {
        match self.path(PURGES_FILE) {
            Some(path) => read_json(&path).unwrap_or_default(),
            None => mutex_lock(&self.memory, "cache::facade", "purges")
                .purges
                .iter()
                .cloned()
                .collect(),
        }
    }
}

fn purge_record(subject: &str) -> String {
    let stamp = OffsetDateTime::from_unix_timestamp(unix_now())
        .ok()
        .and_then(|now| now.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix_now().to_string());
    format!("{subject} @ {stamp}")
}

/// Single entry point for cache reads, writes and purges.
pub struct CacheFacade {
    backend: Arc<dyn StorageBackend>,
    state: FacadeState,
    tag_hooks: Vec<TagAdjustHook>,
}

impl fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFacade")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("tag_hooks", &self.tag_hooks.len())
            .finish()
    }
}

impl CacheFacade {
    pub fn new(backend: Arc<dyn StorageBackend>, state: FacadeState) -> Self {
        Self {
            backend,
            state,
            tag_hooks: Vec::new(),
        }
    }

    /// Register a callback that may adjust an entry's tags before storage.
    pub fn with_tag_hook(
        mut self,
        hook: impl Fn(&str, &mut TagSet) + Send + Sync + 'static,
    ) -> Self {
        self.tag_hooks.push(Arc::new(hook));
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.backend.get(key)
    }

    pub fn set(&self, key: &str, payload: Payload, mut tags: TagSet, ttl: Option<i64>) -> bool {
        for hook in &self.tag_hooks {
            hook(key, &mut tags);
        }

        let stored = self.backend.set(key, payload, &tags, ttl);
        if stored {
            counter!(METRIC_CACHE_STORE).increment(1);
            debug!(backend = self.backend.name(), tags = tags.len(), ?ttl, "Stored cache entry");
        } else {
            counter!(METRIC_CACHE_STORE_FAILED).increment(1);
            warn!(
                backend = self.backend.name(),
                "Cache write failed; serving uncached response"
            );
        }
        stored
    }

    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub fn purge_url(&self, url: &str) {
        self.backend.purge_uri(url);
        counter!(METRIC_CACHE_PURGE, "kind" => "url").increment(1);
        self.state.push_purge(purge_record(url));
        info!("Purged cached URL");
    }

    pub fn purge_tag(&self, tag: &str) {
        self.purge_tags(&TagSet::from([tag.to_string()]));
    }

    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub fn purge_tags(&self, tags: &TagSet) {
        if tags.is_empty() {
            return;
        }
        self.backend.purge_tags(tags);
        for tag in tags {
            counter!(METRIC_CACHE_PURGE, "kind" => "tag").increment(1);
            self.state.push_purge(purge_record(&format!("tag:{tag}")));
        }
        info!(count = tags.len(), "Purged cache tags");
    }

    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub fn purge_all(&self) {
        self.backend.clear();
        counter!(METRIC_CACHE_PURGE, "kind" => "all").increment(1);
        self.state.push_purge(purge_record("all"));
        info!("Purged entire cache");
    }

    /// Drop every entry for a URI without logging a purge.
    pub fn evict_uri(&self, uri: &str) {
        self.backend.purge_uri(uri);
    }

    pub fn sweep_expired(&self) -> usize {
        self.backend.sweep_expired()
    }

    pub fn record_hit(&self) {
        counter!(METRIC_CACHE_HIT).increment(1);
        self.state.update_stats(|stats| stats.hits += 1);
    }

    pub fn record_miss(&self) {
        counter!(METRIC_CACHE_MISS).increment(1);
        self.state.update_stats(|stats| stats.misses += 1);
    }

    pub fn stats(&self) -> CacheStats {
        self.state.stats()
    }

    pub fn recent_purges(&self) -> Vec<String> {
        self.state.purges()
    }
}

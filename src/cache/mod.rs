//! Pagehold page cache.
//!
//! Stores fully rendered HTTP responses and serves them to later visitors:
//!
//! - **Request path**: [`RequestController`] decides BYPASS / MISS / STALE / HIT
//!   and captures rendered pages; [`page_cache_layer`] wires it into axum.
//! - **Edge path**: [`EdgeReader`] serves fresh disk entries from the config
//!   snapshot alone, before the application is built.
//! - **Invalidation**: entries carry tags; [`InvalidationTriggers`] maps content
//!   events to tag purges.
//! - **Storage**: [`StorageBackend`] with disk and key-value implementations,
//!   chosen by [`StorageFactory`] with a fallback to disk.
//!
//! ## Configuration
//!
//! Cache policy lives under `[cache]` in `pagehold.toml`:
//!
//! ```toml
//! [cache]
//! backend = "disk"
//! ttl_default = 3600
//! exclude_urls = ["/checkout*"]
//! # ... see config.rs for all options
//! ```

mod config;
mod controller;
mod edge;
mod entry;
mod facade;
mod fsutil;
mod key;
mod lock;
mod middleware;
pub mod pattern;
mod preload;
mod probe;
mod request;
mod snapshot;
pub mod storage;
mod tags;
mod triggers;

pub use config::{
    CachePolicy, DEFAULT_LANGUAGE_COOKIE, DEFAULT_LOGGED_IN_COOKIE_PREFIX, DEFAULT_MIN_BODY_BYTES,
    DEFAULT_TTL, DEFAULT_TTL_FEED, DEFAULT_TTL_FRONT_PAGE, LoggedInMode,
};
pub use controller::{
    CacheState, Capture, CaptureOutcome, CapturedResponse, Diagnostics, HEADER_AGE, HEADER_KEY,
    HEADER_STATE, HitResponse, Lookup, RequestController,
};
pub use edge::{EdgeHit, EdgeOutcome, EdgeReader};
pub use entry::{CacheEntry, EntryMeta, Payload, is_fresh, unix_now};
pub use facade::{
    CacheFacade, CacheStats, FacadeState, HitRatio, METRIC_CACHE_BYPASS, METRIC_CACHE_HIT,
    METRIC_CACHE_MISS, METRIC_CACHE_PURGE, METRIC_CACHE_STORE, METRIC_CACHE_STORE_FAILED,
    PURGE_LOG_CAPACITY,
};
pub use key::{KeyBuilder, VaryContext, hash_key};
pub use middleware::{DEFAULT_MAX_BODY_BYTES, PageCacheState, ViewMarker, page_cache_layer, request_context};
pub use preload::{PRELOAD_QUEUE_FILE, PreloadQueue};
pub use probe::{DirectorySizeProbe, DiskUsageProbe};
pub use request::{RequestContext, RequestFlags, Session, is_mobile_user_agent, parse_cookie_header};
pub use snapshot::{ConfigSnapshot, SNAPSHOT_FILE};
pub use storage::{
    BackendKind, BackendOptions, DiskStorage, KeyValueStorage, MemcachedKv, MemoryKv, RedisKv,
    StorageBackend, StorageError, StorageFactory,
};
pub use tags::{ContentEntity, GLOBAL_TAG, QueryContext, TagDeriver, TagSet};
pub use triggers::{
    ContentEvent, ContentResolver, ContentStatus, InvalidationTriggers, TriggerOutcome,
    TriggerToggles,
};

//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    BackendKind, BackendOptions, CachePolicy, ConfigSnapshot, LoggedInMode, SNAPSHOT_FILE,
    storage::DEFAULT_NAMESPACE,
};

mod cli;

pub use cli::{
    CacheOverrides, CliArgs, Command, PreloadEnqueueArgs, PreloadRunArgs, PurgeTagArgs,
    PurgeUrlArgs, WriteSnapshotArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagehold";
const DEFAULT_CACHE_DIR: &str = "cache/pagehold";
const STATE_DIR_NAME: &str = "pagehold-state";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_PRELOAD_CONCURRENCY: u64 = 2;
const DEFAULT_PRELOAD_USER_AGENT: &str = "pagehold-preload/1.0";
const DEFAULT_PRELOAD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PRELOAD_BATCH_SIZE: u64 = 20;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: BackendKind,
    pub directory: PathBuf,
    /// Holds stats, the purge log, the preload queue and the config snapshot.
    pub state_directory: PathBuf,
    pub redis_url: Option<String>,
    pub memcached_url: Option<String>,
    pub namespace: String,
    pub connect_timeout: Duration,
    pub preload: PreloadSettings,
    pub policy: CachePolicy,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub concurrency: NonZeroUsize,
    pub user_agent: String,
    pub timeout: Duration,
    pub batch_size: NonZeroUsize,
}

impl CacheSettings {
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            directory: self.directory.clone(),
            redis_url: self.redis_url.clone(),
            memcached_url: self.memcached_url.clone(),
            namespace: self.namespace.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::new(self.policy.clone(), Some(self.directory.clone()))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_directory.join(SNAPSHOT_FILE)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PAGEHOLD").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(directory) = overrides.cache_dir.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(directory) = overrides.cache_state_dir.as_ref() {
            self.cache.state_directory = Some(directory.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref() {
        Some(name) => BackendKind::from_str(name)
            .map_err(|reason| LoadError::invalid("cache.backend", reason))?,
        None => BackendKind::Disk,
    };

    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.directory", "must not be empty"));
    }
    let state_directory = cache
        .state_directory
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| default_state_directory(&directory));

    let namespace = cache
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    if namespace.is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }

    let connect_timeout_ms = cache
        .connect_timeout_ms
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    if connect_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.connect_timeout_ms",
            "must be greater than zero",
        ));
    }

    let logged_in_mode = match cache.logged_in_mode.as_deref() {
        Some(mode) => LoggedInMode::from_str(mode)
            .map_err(|reason| LoadError::invalid("cache.logged_in_mode", reason))?,
        None => LoggedInMode::Bypass,
    };

    let preload_timeout_secs = cache
        .preload_timeout_secs
        .unwrap_or(DEFAULT_PRELOAD_TIMEOUT_SECS);
    if preload_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "cache.preload_timeout_secs",
            "must be greater than zero",
        ));
    }
    let preload = PreloadSettings {
        concurrency: non_zero_usize(
            cache
                .preload_concurrency
                .unwrap_or(DEFAULT_PRELOAD_CONCURRENCY),
            "cache.preload_concurrency",
        )?,
        user_agent: cache
            .preload_user_agent
            .filter(|agent| !agent.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PRELOAD_USER_AGENT.to_string()),
        timeout: Duration::from_secs(preload_timeout_secs),
        batch_size: non_zero_usize(
            cache
                .preload_batch_size
                .unwrap_or(DEFAULT_PRELOAD_BATCH_SIZE),
            "cache.preload_batch_size",
        )?,
    };

    let defaults = CachePolicy::default();
    let policy = CachePolicy {
        ttl_default: cache.ttl_default.unwrap_or(defaults.ttl_default),
        ttl_front_page: cache.ttl_front_page.unwrap_or(defaults.ttl_front_page),
        ttl_feed: cache.ttl_feed.unwrap_or(defaults.ttl_feed),
        stale_while_revalidate: cache
            .stale_while_revalidate
            .unwrap_or(defaults.stale_while_revalidate),
        stale_if_error: cache.stale_if_error.unwrap_or(defaults.stale_if_error),
        exclude_urls: cache.exclude_urls.unwrap_or_default(),
        exclude_cookies: cache.exclude_cookies.unwrap_or_default(),
        exclude_user_agents: cache.exclude_user_agents.unwrap_or_default(),
        exclude_query_args: cache.exclude_query_args.unwrap_or_default(),
        vary_device: cache.vary_device.unwrap_or(defaults.vary_device),
        vary_role: cache.vary_role.unwrap_or(defaults.vary_role),
        vary_language: cache.vary_language.unwrap_or(defaults.vary_language),
        vary_cookie_allowlist: cache.vary_cookie_allowlist.unwrap_or_default(),
        language_cookie: cache.language_cookie.unwrap_or(defaults.language_cookie),
        logged_in_cookie_prefix: cache
            .logged_in_cookie_prefix
            .unwrap_or(defaults.logged_in_cookie_prefix),
        logged_in_mode,
        cache_api: cache.cache_api.unwrap_or(defaults.cache_api),
        purge_on_update: cache.purge_on_update.unwrap_or(defaults.purge_on_update),
        purge_on_comment: cache.purge_on_comment.unwrap_or(defaults.purge_on_comment),
        purge_cdn: cache.purge_cdn.unwrap_or(defaults.purge_cdn),
        min_body_bytes: cache.min_body_bytes.unwrap_or(defaults.min_body_bytes),
    };

    Ok(CacheSettings {
        backend,
        directory,
        state_directory,
        redis_url: non_blank(cache.redis_url),
        memcached_url: non_blank(cache.memcached_url),
        namespace,
        connect_timeout: Duration::from_millis(connect_timeout_ms),
        preload,
        policy,
    })
}

/// Sibling of the cache directory, so `purge_all` never touches it.
fn default_state_directory(cache_dir: &Path) -> PathBuf {
    match cache_dir.parent() {
        Some(parent) => parent.join(STATE_DIR_NAME),
        None => PathBuf::from(STATE_DIR_NAME),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    directory: Option<PathBuf>,
    state_directory: Option<PathBuf>,
    redis_url: Option<String>,
    memcached_url: Option<String>,
    namespace: Option<String>,
    connect_timeout_ms: Option<u64>,
    ttl_default: Option<i64>,
    ttl_front_page: Option<i64>,
    ttl_feed: Option<i64>,
    stale_while_revalidate: Option<i64>,
    stale_if_error: Option<i64>,
    exclude_urls: Option<Vec<String>>,
    exclude_cookies: Option<Vec<String>>,
    exclude_user_agents: Option<Vec<String>>,
    exclude_query_args: Option<Vec<String>>,
    vary_device: Option<bool>,
    vary_role: Option<bool>,
    vary_language: Option<bool>,
    vary_cookie_allowlist: Option<Vec<String>>,
    language_cookie: Option<String>,
    logged_in_cookie_prefix: Option<String>,
    logged_in_mode: Option<String>,
    cache_api: Option<bool>,
    purge_on_update: Option<bool>,
    purge_on_comment: Option<bool>,
    purge_cdn: Option<bool>,
    min_body_bytes: Option<usize>,
    preload_concurrency: Option<u64>,
    preload_user_agent: Option<String>,
    preload_timeout_secs: Option<u64>,
    preload_batch_size: Option<u64>,
}

#[cfg(test)]
mod tests;

//! Cache policy.
//!
//! The subset of settings that drives cacheability, key variation, TTL
//! selection and invalidation. Built from `pagehold.toml` by the config layer
//! and mirrored into the on-disk config snapshot for the edge reader.

use serde::{Deserialize, Serialize};

// Default values for the cache policy
pub const DEFAULT_TTL: i64 = 3600;
pub const DEFAULT_TTL_FRONT_PAGE: i64 = 600;
pub const DEFAULT_TTL_FEED: i64 = 900;
pub const DEFAULT_MIN_BODY_BYTES: usize = 255;
pub const DEFAULT_LANGUAGE_COOKIE: &str = "lang";
pub const DEFAULT_LOGGED_IN_COOKIE_PREFIX: &str = "session_";

/// How authenticated sessions participate in caching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggedInMode {
    /// Authenticated requests never touch the cache.
    #[default]
    Bypass,
    /// Authenticated requests get a per-user cache entry.
    Private,
}

impl std::str::FromStr for LoggedInMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bypass" => Ok(Self::Bypass),
            "private" => Ok(Self::Private),
            other => Err(format!("unknown logged-in mode `{other}`")),
        }
    }
}

/// Cache policy resolved from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// TTL in seconds for ordinary pages. `0` disables expiry.
    pub ttl_default: i64,
    /// TTL in seconds for the front page.
    pub ttl_front_page: i64,
    /// TTL in seconds for feeds.
    pub ttl_feed: i64,
    /// Advisory only; persisted but not acted on by the serving path.
    pub stale_while_revalidate: i64,
    /// Advisory only; persisted but not acted on by the serving path.
    pub stale_if_error: i64,
    pub exclude_urls: Vec<String>,
    pub exclude_cookies: Vec<String>,
    pub exclude_user_agents: Vec<String>,
    pub exclude_query_args: Vec<String>,
    pub vary_device: bool,
    pub vary_role: bool,
    pub vary_language: bool,
    pub vary_cookie_allowlist: Vec<String>,
    /// Cookie the edge reader consults for the visitor locale.
    pub language_cookie: String,
    /// Cookie-name prefix the edge reader treats as an authenticated session.
    pub logged_in_cookie_prefix: String,
    pub logged_in_mode: LoggedInMode,
    /// Allow caching of JSON/API responses.
    pub cache_api: bool,
    pub purge_on_update: bool,
    pub purge_on_comment: bool,
    pub purge_cdn: bool,
    /// Bodies shorter than this are never stored.
    pub min_body_bytes: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl_default: DEFAULT_TTL,
            ttl_front_page: DEFAULT_TTL_FRONT_PAGE,
            ttl_feed: DEFAULT_TTL_FEED,
            stale_while_revalidate: 0,
            stale_if_error: 0,
            exclude_urls: Vec::new(),
            exclude_cookies: Vec::new(),
            exclude_user_agents: Vec::new(),
            exclude_query_args: Vec::new(),
            vary_device: true,
            vary_role: false,
            vary_language: false,
            vary_cookie_allowlist: Vec::new(),
            language_cookie: DEFAULT_LANGUAGE_COOKIE.to_string(),
            logged_in_cookie_prefix: DEFAULT_LOGGED_IN_COOKIE_PREFIX.to_string(),
            logged_in_mode: LoggedInMode::Bypass,
            cache_api: true,
            purge_on_update: true,
            purge_on_comment: true,
            purge_cdn: true,
            min_body_bytes: DEFAULT_MIN_BODY_BYTES,
        }
    }
}

impl CachePolicy {
    /// Returns true when authenticated sessions get their own entries.
    pub fn serves_private_cache(&self) -> bool {
        self.logged_in_mode == LoggedInMode::Private
    }

    /// Lowercased exclude-list for query argument names.
    pub fn excluded_query_args(&self) -> Vec<String> {
        self.exclude_query_args
            .iter()
            .map(|arg| arg.trim().to_ascii_lowercase())
            .filter(|arg| !arg.is_empty())
            .collect()
    }
}

//! Backend selection with guaranteed fallback to disk.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::kv::{DEFAULT_NAMESPACE, KeyValueStorage, KvClient, MemcachedKv, RedisKv};
use super::{DiskStorage, StorageBackend};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Disk,
    Redis,
    Memcached,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Redis => "redis",
            Self::Memcached => "memcached",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disk" | "file" | "filesystem" => Ok(Self::Disk),
            "redis" => Ok(Self::Redis),
            "memcached" => Ok(Self::Memcached),
            other => Err(format!("unknown cache backend `{other}`")),
        }
    }
}

/// Everything the factory needs to build any backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub directory: PathBuf,
    pub redis_url: Option<String>,
    pub memcached_url: Option<String>,
    pub namespace: String,
    pub connect_timeout: Duration,
}

impl BackendOptions {
    pub fn disk(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            redis_url: None,
            memcached_url: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub struct StorageFactory;

impl StorageFactory {
    /// Build a backend by name. Unknown names degrade to disk like
    /// unavailable ones.
    pub fn create_named(name: &str, options: &BackendOptions) -> Arc<dyn StorageBackend> {
        match name.parse::<BackendKind>() {
            Ok(kind) => Self::create(kind, options),
            Err(reason) => Self::fallback(name, &reason, options),
        }
    }

    /// Build the requested backend, falling back to disk when it cannot be
    /// reached. Never fails.
    pub fn create(kind: BackendKind, options: &BackendOptions) -> Arc<dyn StorageBackend> {
        match kind {
            BackendKind::Disk => Arc::new(DiskStorage::new(options.directory.clone())),
            BackendKind::Redis => match Self::redis(options) {
                Ok(backend) => {
                    info!(backend = "redis", namespace = %options.namespace, "Using key-value cache backend");
                    backend
                }
                Err(reason) => Self::fallback(kind.as_str(), &reason, options),
            },
            BackendKind::Memcached => match Self::memcached(options) {
                Ok(backend) => {
                    info!(backend = "memcached", namespace = %options.namespace, "Using key-value cache backend");
                    backend
                }
                Err(reason) => Self::fallback(kind.as_str(), &reason, options),
            },
        }
    }

    fn redis(options: &BackendOptions) -> Result<Arc<dyn StorageBackend>, String> {
        let url = configured(options.redis_url.as_deref(), "redis_url")?;
        let client = RedisKv::connect(url, options.connect_timeout).map_err(|err| err.to_string())?;
        Self::key_value(client, options)
    }

    fn memcached(options: &BackendOptions) -> Result<Arc<dyn StorageBackend>, String> {
        let url = configured(options.memcached_url.as_deref(), "memcached_url")?;
        let client =
            MemcachedKv::connect(url, options.connect_timeout).map_err(|err| err.to_string())?;
        Self::key_value(client, options)
    }

    fn key_value<C: KvClient + 'static>(
        client: C,
        options: &BackendOptions,
    ) -> Result<Arc<dyn StorageBackend>, String> {
        let storage = KeyValueStorage::new(client, options.namespace.clone());
        if !storage.is_available() {
            return Err("server did not answer a liveness check".to_string());
        }
        Ok(Arc::new(storage))
    }

    fn fallback(
        requested: &str,
        reason: &str,
        options: &BackendOptions,
    ) -> Arc<dyn StorageBackend> {
        warn!(
            requested,
            fallback = "disk",
            reason,
            "Cache backend unavailable; degrading to disk storage"
        );
        Arc::new(DiskStorage::new(options.directory.clone()))
    }
}

fn configured<'a>(url: Option<&'a str>, setting: &str) -> Result<&'a str, String> {
    url.filter(|url| !url.trim().is_empty())
        .ok_or_else(|| format!("{setting} is not configured"))
}

//! Config snapshot for the edge reader.
//!
//! A flat JSON copy of the cache policy, rewritten whenever settings change,
//! so the edge path can make decisions without loading the configuration
//! system. Reading never fails: a missing or malformed file yields defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::CachePolicy;
use super::entry::unix_now;
use super::fsutil::write_atomic;

pub const SNAPSHOT_FILE: &str = "config_snapshot.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub version: u32,
    pub written_at: i64,
    /// Cache root the snapshot was written for.
    pub cache_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub policy: CachePolicy,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            written_at: 0,
            cache_dir: None,
            policy: CachePolicy::default(),
        }
    }
}

impl ConfigSnapshot {
    pub fn new(policy: CachePolicy, cache_dir: Option<PathBuf>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            written_at: unix_now(),
            cache_dir,
            policy,
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let encoded = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomic(path, &encoded)?;
        debug!(op = "snapshot::write", path = %path.display(), "Wrote config snapshot");
        Ok(())
    }

    pub fn load_or_default(path: &Path) -> Self {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(
                    op = "snapshot::load",
                    path = %path.display(),
                    error = %err,
                    "Config snapshot unavailable; using defaults"
                );
                return Self::default();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|err| {
            warn!(
                op = "snapshot::load",
                path = %path.display(),
                error = %err,
                "Config snapshot is malformed; using defaults"
            );
            Self::default()
        })
    }
}

impl From<CachePolicy> for ConfigSnapshot {
    fn from(policy: CachePolicy) -> Self {
        Self::new(policy, None)
    }
}

impl From<ConfigSnapshot> for CachePolicy {
    fn from(snapshot: ConfigSnapshot) -> Self {
        snapshot.policy
    }
}

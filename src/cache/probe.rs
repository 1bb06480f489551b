//! Cache size accounting for dashboards. The cache core never calls this.

use std::io;
use std::path::PathBuf;

use tracing::debug;
use walkdir::WalkDir;

pub trait DirectorySizeProbe: Send + Sync {
    /// Total size in bytes of the files below the probed directory.
    fn total_bytes(&self) -> io::Result<u64>;
}

/// Recursively sums regular file sizes below a directory.
///
/// A missing directory counts as empty; symlinks are not followed.
#[derive(Debug, Clone)]
pub struct DiskUsageProbe {
    root: PathBuf,
}

impl DiskUsageProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DirectorySizeProbe for DiskUsageProbe {
    fn total_bytes(&self) -> io::Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                // Files may vanish mid-scan while entries are purged.
                Err(err) => {
                    debug!(error = %err, "Skipping cache path");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => total += meta.len(),
                Err(err) => debug!(path = %entry.path().display(), error = %err, "Skipping file"),
            }
        }
        Ok(total)
    }
}

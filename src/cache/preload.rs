//! Preload queue.
//!
//! URLs waiting to be fetched so their pages are cached before a visitor asks
//! for them. The queue is a de-duplicated FIFO persisted as a JSON array;
//! every operation re-reads the file so a CLI process and a long-running
//! warmer can share it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::fsutil::{read_json, write_atomic};
use super::lock::mutex_lock;

pub const PRELOAD_QUEUE_FILE: &str = "preload_queue.json";

#[derive(Debug)]
pub struct PreloadQueue {
    path: PathBuf,
    guard: Mutex<()>,
}

impl PreloadQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Queue stored as `preload_queue.json` inside a state directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PRELOAD_QUEUE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append URLs that are not already queued. Returns how many were added.
    pub fn enqueue<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = mutex_lock(&self.guard, "cache::preload", "enqueue");
        let mut queue = self.load();
        let mut added = 0;
        for url in urls {
            let url = url.into();
            let url = url.trim();
            if url.is_empty() || queue.iter().any(|queued| queued == url) {
                continue;
            }
            queue.push_back(url.to_string());
            added += 1;
        }
        if added > 0 {
            self.save(&queue);
        }
        debug!(op = "preload::enqueue", added, queued = queue.len(), "Preload queue updated");
        added
    }

    /// Remove and return up to `limit` URLs from the front of the queue.
    pub fn take_batch(&self, limit: usize) -> Vec<String> {
        let _guard = mutex_lock(&self.guard, "cache::preload", "take_batch");
        let mut queue = self.load();
        let take = limit.min(queue.len());
        let batch: Vec<String> = queue.drain(..take).collect();
        if !batch.is_empty() {
            self.save(&queue);
        }
        batch
    }

    pub fn len(&self) -> usize {
        let _guard = mutex_lock(&self.guard, "cache::preload", "len");
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self) -> VecDeque<String> {
        read_json(&self.path).unwrap_or_default()
    }

    fn save(&self, queue: &VecDeque<String>) {
        let result = serde_json::to_vec(queue)
            .map_err(std::io::Error::other)
            .and_then(|encoded| write_atomic(&self.path, &encoded));
        if let Err(err) = result {
            warn!(
                op = "preload::save",
                path = %self.path.display(),
                error = %err,
                "Failed to persist preload queue"
            );
        }
    }
}

//! Filesystem storage backend.
//!
//! Layout under the cache root:
//!
//! ```text
//! pages/<digest>.html   entry bodies
//! meta/<digest>.json    entry metadata (everything but the body)
//! tags/<id>.json        tag index, JSON array of digests
//! uris/<id>.json        URI index, same shape
//! ```
//!
//! Bodies are written before metadata, so a reader that finds metadata can
//! expect a body. Index files are updated read-modify-write under an advisory
//! lock on a sibling `.lock` file.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs4::FileExt;
use tracing::{debug, warn};

use super::index::{IndexBookkeeper, IndexKind, IndexStore};
use super::{StorageBackend, StorageError};
use crate::cache::entry::{CacheEntry, EntryMeta, Payload, unix_now};
use crate::cache::fsutil::write_atomic;
use crate::cache::key::hash_key;
use crate::cache::tags::TagSet;

const PAGES_DIR: &str = "pages";
const META_DIR: &str = "meta";
const TAGS_DIR: &str = "tags";
const URIS_DIR: &str = "uris";

/// Paths of the on-disk cache format. Shared with the edge reader.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    root: PathBuf,
}

impl DiskLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn body_path(&self, digest: &str) -> PathBuf {
        self.root.join(PAGES_DIR).join(format!("{digest}.html"))
    }

    pub fn meta_path(&self, digest: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{digest}.json"))
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    fn index_path(&self, kind: IndexKind, id: &str) -> PathBuf {
        let dir = match kind {
            IndexKind::Tag => TAGS_DIR,
            IndexKind::Uri => URIS_DIR,
            IndexKind::All => TAGS_DIR,
        };
        self.root.join(dir).join(format!("{id}.json"))
    }

    fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [PAGES_DIR, META_DIR, TAGS_DIR, URIS_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|err| StorageError::io(&path, err))?;
        }
        Ok(())
    }

    /// Read an entry's metadata, if present and decodable.
    pub fn read_meta(&self, digest: &str) -> Result<Option<EntryMeta>, StorageError> {
        let path = self.meta_path(digest);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(&path, err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StorageError::decode(path.display().to_string(), err))
    }

    /// Remove an entry's metadata and body files, ignoring absent ones.
    pub fn remove_files(&self, digest: &str) {
        for path in [self.meta_path(digest), self.body_path(digest)] {
            remove_if_present(&path);
        }
    }
}

fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        warn!(
            op = "disk::remove",
            path = %path.display(),
            error = %err,
            "Failed to remove cache file"
        );
    }
}

/// Advisory lock on `<index>.lock`, held until the guard drops or the
/// holding process exits.
struct IndexLock {
    _file: File,
}

impl IndexLock {
    fn acquire(target: &Path) -> Result<Self, StorageError> {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| StorageError::io(&path, err))?;
        file.lock_exclusive()
            .map_err(|err| StorageError::io(&path, err))?;
        Ok(Self { _file: file })
    }
}

/// Index files stored as JSON arrays next to the entries.
#[derive(Debug)]
pub struct DiskIndexes {
    layout: DiskLayout,
}

impl DiskIndexes {
    fn read(&self, path: &Path) -> Result<Vec<String>, StorageError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(path, err)),
        };
        match serde_json::from_slice(&raw) {
            Ok(members) => Ok(members),
            Err(err) => {
                warn!(
                    op = "disk::index_read",
                    path = %path.display(),
                    error = %err,
                    "Discarding corrupt index file"
                );
                Ok(Vec::new())
            }
        }
    }

    fn write(&self, path: &Path, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            remove_if_present(path);
            return Ok(());
        }
        let encoded = serde_json::to_vec(members).map_err(StorageError::Encode)?;
        write_atomic(path, &encoded).map_err(|err| StorageError::io(path, err))
    }

    fn update(
        &self,
        kind: IndexKind,
        id: &str,
        apply: impl FnOnce(&mut Vec<String>),
    ) -> Result<(), StorageError> {
        let path = self.layout.index_path(kind, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
        }
        let _lock = IndexLock::acquire(&path)?;
        let mut members = self.read(&path)?;
        apply(&mut members);
        self.write(&path, &members)
    }
}

impl IndexStore for DiskIndexes {
    fn add_member(&self, kind: IndexKind, id: &str, digest: &str) -> Result<(), StorageError> {
        self.update(kind, id, |members| {
            if !members.iter().any(|member| member == digest) {
                members.push(digest.to_string());
            }
        })
    }

    fn remove_member(
        &self,
        kind: IndexKind,
        id: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        self.update(kind, id, |members| members.retain(|member| member != digest))
    }

    fn members(&self, kind: IndexKind, id: &str) -> Result<Vec<String>, StorageError> {
        self.read(&self.layout.index_path(kind, id))
    }

    fn remove_index(&self, kind: IndexKind, id: &str) -> Result<(), StorageError> {
        remove_if_present(&self.layout.index_path(kind, id));
        Ok(())
    }
}

/// Cache entries as plain files under one directory.
#[derive(Debug)]
pub struct DiskStorage {
    layout: DiskLayout,
    indexes: IndexBookkeeper<DiskIndexes>,
}

impl DiskStorage {
    /// Open (and create if needed) a cache directory.
    ///
    /// Never fails: an uncreatable directory surfaces later as failed writes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let layout = DiskLayout::new(root);
        if let Err(err) = layout.ensure_dirs() {
            warn!(
                op = "disk::open",
                root = %layout.root().display(),
                error = %err,
                "Cache directory is not writable; entries will not be stored"
            );
        }
        let indexes = IndexBookkeeper::new(
            DiskIndexes {
                layout: layout.clone(),
            },
            false,
        );
        Self { layout, indexes }
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    /// Remove an entry whose metadata the caller already holds, unlinking it
    /// from its tag and URI indexes.
    pub fn evict(&self, digest: &str, meta: EntryMeta) {
        self.remove_entry(digest, Some(meta));
    }

    fn store(
        &self,
        digest: &str,
        key: &str,
        payload: Payload,
        tags: &TagSet,
        ttl: Option<i64>,
    ) -> Result<(), StorageError> {
        let meta = EntryMeta {
            key: key.to_string(),
            uri: payload.uri,
            created: unix_now(),
            ttl,
            headers: payload.headers,
            tags: tags.iter().cloned().collect(),
            status: payload.status,
        };
        let encoded = serde_json::to_vec(&meta).map_err(StorageError::Encode)?;

        let body_path = self.layout.body_path(digest);
        write_atomic(&body_path, &payload.body).map_err(|err| StorageError::io(&body_path, err))?;
        let meta_path = self.layout.meta_path(digest);
        write_atomic(&meta_path, &encoded).map_err(|err| StorageError::io(&meta_path, err))?;

        self.indexes.link(digest, tags, &meta.uri)
    }

    fn load(&self, digest: &str) -> Result<Option<CacheEntry>, StorageError> {
        let meta = match self.layout.read_meta(digest) {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(None),
            Err(err @ StorageError::Decode { .. }) => {
                warn!(op = "disk::get", digest, error = %err, "Removing corrupt cache entry");
                self.layout.remove_files(digest);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let body_path = self.layout.body_path(digest);
        match fs::read(&body_path) {
            Ok(body) => Ok(Some(CacheEntry {
                meta,
                body: Bytes::from(body),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(op = "disk::get", digest, "Metadata without body; self-healing");
                self.remove_entry(digest, Some(meta));
                Ok(None)
            }
            Err(err) => Err(StorageError::io(&body_path, err)),
        }
    }

    /// Metadata first, then body, then index references.
    fn remove_entry(&self, digest: &str, meta: Option<EntryMeta>) {
        let meta = meta.or_else(|| self.layout.read_meta(digest).ok().flatten());
        self.layout.remove_files(digest);
        if let Some(meta) = meta {
            // unlink logs each failed removal itself.
            let _ = self.indexes.unlink(digest, &meta.tags, &meta.uri);
        }
    }

    fn purge_index(&self, kind: IndexKind, subject: &str) {
        for digest in self.indexes.members(kind, subject) {
            self.remove_entry(&digest, None);
        }
        self.indexes.drop_index(kind, subject);
    }
}

impl StorageBackend for DiskStorage {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let digest = hash_key(key);
        match self.load(&digest) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(op = "disk::get", digest = %digest, error = %err, "Cache read failed");
                None
            }
        }
    }

    fn set(&self, key: &str, payload: Payload, tags: &TagSet, ttl: Option<i64>) -> bool {
        let digest = hash_key(key);
        // Entries are write-once; a refresh replaces the old entry wholesale.
        self.remove_entry(&digest, None);

        match self.store(&digest, key, payload, tags, ttl) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    op = "disk::set",
                    digest = %digest,
                    error = %err,
                    "Failed to store cache entry"
                );
                self.remove_entry(&digest, None);
                false
            }
        }
    }

    fn delete(&self, key: &str) {
        self.remove_entry(&hash_key(key), None);
    }

    fn clear(&self) {
        let root = self.layout.root();
        if let Err(err) = fs::remove_dir_all(root)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(
                op = "disk::clear",
                root = %root.display(),
                error = %err,
                "Failed to remove cache directory"
            );
        }
        if let Err(err) = self.layout.ensure_dirs() {
            warn!(op = "disk::clear", error = %err, "Failed to recreate cache directory");
        }
    }

    fn purge_tags(&self, tags: &TagSet) {
        for tag in tags {
            self.purge_index(IndexKind::Tag, tag);
        }
    }

    fn purge_uri(&self, uri: &str) {
        self.purge_index(IndexKind::Uri, uri);
    }

    fn sweep_expired(&self) -> usize {
        let dir = self.layout.meta_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        let now = unix_now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(digest) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.layout.read_meta(digest) {
                Ok(Some(meta)) if !meta.is_fresh(now) => {
                    self.remove_entry(digest, Some(meta));
                    removed += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    self.layout.remove_files(digest);
                    removed += 1;
                }
            }
        }

        debug!(op = "disk::sweep", removed, "Swept expired cache entries");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::index::index_id;

    fn tags(values: &[&str]) -> TagSet {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn body() -> Vec<u8> {
        vec![b'x'; 512]
    }

    #[test]
    fn set_writes_body_meta_and_indexes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        let digest = hash_key("k1");

        assert!(storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["post_5"]), Some(60)));

        assert!(storage.layout.body_path(&digest).exists());
        assert!(storage.layout.meta_path(&digest).exists());
        assert_eq!(
            storage.indexes.members(IndexKind::Tag, "post_5"),
            vec![digest.clone()]
        );
        assert_eq!(storage.indexes.members(IndexKind::Uri, "http://h/a"), vec![digest]);
    }

    #[test]
    fn metadata_without_body_is_a_miss_and_self_heals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        let digest = hash_key("k1");
        storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["t"]), None);

        fs::remove_file(storage.layout.body_path(&digest)).expect("remove body");

        assert!(storage.get("k1").is_none());
        assert!(!storage.layout.meta_path(&digest).exists());
        assert!(storage.indexes.members(IndexKind::Tag, "t").is_empty());
    }

    #[test]
    fn corrupt_metadata_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        let digest = hash_key("k1");
        storage.set("k1", Payload::new(body(), "http://h/a"), &TagSet::new(), None);

        fs::write(storage.layout.meta_path(&digest), b"{broken").expect("corrupt");

        assert!(storage.get("k1").is_none());
        assert!(!storage.layout.body_path(&digest).exists());
    }

    #[test]
    fn replacing_an_entry_drops_stale_tag_membership() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["old"]), None);
        storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["new"]), None);

        assert!(storage.indexes.members(IndexKind::Tag, "old").is_empty());
        assert_eq!(storage.indexes.members(IndexKind::Tag, "new").len(), 1);
    }

    #[test]
    fn leftover_lockfile_does_not_block_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        let index = storage
            .layout
            .index_path(IndexKind::Tag, &index_id(IndexKind::Tag, "t"));
        let lock = PathBuf::from(format!("{}.lock", index.display()));
        fs::write(&lock, b"").expect("lockfile");

        assert!(storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["t"]), None));
        assert_eq!(storage.indexes.members(IndexKind::Tag, "t"), vec![hash_key("k1")]);
    }

    #[test]
    fn writer_waits_for_a_held_index_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = std::sync::Arc::new(DiskStorage::new(dir.path()));
        let index = storage
            .layout
            .index_path(IndexKind::Tag, &index_id(IndexKind::Tag, "t"));
        let held = IndexLock::acquire(&index).expect("hold lock");

        let writer = {
            let storage = std::sync::Arc::clone(&storage);
            std::thread::spawn(move || {
                storage.set("k1", Payload::new(body(), "http://h/a"), &tags(&["t"]), None)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(storage.indexes.members(IndexKind::Tag, "t").is_empty());

        drop(held);
        assert!(writer.join().expect("writer thread"));
        assert_eq!(storage.indexes.members(IndexKind::Tag, "t"), vec![hash_key("k1")]);
    }

    #[test]
    fn concurrent_writers_keep_every_index_member() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = std::sync::Arc::new(DiskStorage::new(dir.path()));

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let storage = std::sync::Arc::clone(&storage);
                std::thread::spawn(move || {
                    let key = format!("k{n}");
                    let uri = format!("http://h/{n}");
                    storage.set(&key, Payload::new(body(), uri), &tags(&["shared"]), None)
                })
            })
            .collect();
        for writer in writers {
            assert!(writer.join().expect("writer thread"));
        }

        assert_eq!(storage.indexes.members(IndexKind::Tag, "shared").len(), 8);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DiskStorage::new(dir.path());
        storage.set("fresh", Payload::new(body(), "http://h/a"), &TagSet::new(), Some(3600));
        storage.set("forever", Payload::new(body(), "http://h/b"), &TagSet::new(), None);
        storage.set("old", Payload::new(body(), "http://h/c"), &TagSet::new(), Some(60));

        let digest = hash_key("old");
        let mut meta = storage
            .layout
            .read_meta(&digest)
            .expect("read")
            .expect("present");
        meta.created -= 120;
        write_atomic(
            &storage.layout.meta_path(&digest),
            &serde_json::to_vec(&meta).expect("encode"),
        )
        .expect("rewrite meta");

        assert_eq!(storage.sweep_expired(), 1);
        assert!(storage.get("old").is_none());
        assert!(storage.get("fresh").is_some());
        assert!(storage.get("forever").is_some());
    }
}

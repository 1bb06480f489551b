//! Secondary index bookkeeping shared by the storage backends.
//!
//! An index maps a tag or an absolute URI to the set of entry digests that
//! carry it. Backends only provide the membership primitives through
//! [`IndexStore`]; [`IndexBookkeeper`] decides which indexes an entry belongs
//! to and keeps them consistent on write and delete.

use tracing::warn;

use super::StorageError;
use crate::cache::key::hash_key;
use crate::cache::tags::TagSet;

/// Id of the registry listing every live entry.
pub const ALL_INDEX_ID: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKind {
    Tag,
    Uri,
    /// Registry of every live digest, for backends that cannot enumerate.
    All,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Uri => "uri",
            Self::All => "all",
        }
    }
}

/// Membership primitives a backend provides for its indexes.
///
/// Implementations must de-duplicate members and delete an index once its
/// last member is removed.
pub trait IndexStore: Send + Sync {
    fn add_member(&self, kind: IndexKind, id: &str, digest: &str) -> Result<(), StorageError>;

    fn remove_member(&self, kind: IndexKind, id: &str, digest: &str)
    -> Result<(), StorageError>;

    fn members(&self, kind: IndexKind, id: &str) -> Result<Vec<String>, StorageError>;

    fn remove_index(&self, kind: IndexKind, id: &str) -> Result<(), StorageError>;
}

/// Index id for a tag or URI subject.
pub fn index_id(kind: IndexKind, subject: &str) -> String {
    match kind {
        IndexKind::All => ALL_INDEX_ID.to_string(),
        IndexKind::Tag | IndexKind::Uri => hash_key(subject),
    }
}

/// Keeps tag, URI and (optionally) global registries in step with entries.
#[derive(Debug)]
pub struct IndexBookkeeper<S> {
    store: S,
    track_all: bool,
}

impl<S: IndexStore> IndexBookkeeper<S> {
    pub fn new(store: S, track_all: bool) -> Self {
        Self { store, track_all }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register `digest` in every index the entry belongs to.
    pub fn link(&self, digest: &str, tags: &TagSet, uri: &str) -> Result<(), StorageError> {
        for tag in tags {
            self.store
                .add_member(IndexKind::Tag, &index_id(IndexKind::Tag, tag), digest)?;
        }
        if !uri.is_empty() {
            self.store
                .add_member(IndexKind::Uri, &index_id(IndexKind::Uri, uri), digest)?;
        }
        if self.track_all {
            self.store.add_member(IndexKind::All, ALL_INDEX_ID, digest)?;
        }
        Ok(())
    }

    /// Remove `digest` from every index the entry belonged to.
    ///
    /// Keeps going after a failure so one broken index never strands the
    /// others; the first error is returned.
    pub fn unlink<'a>(
        &self,
        digest: &str,
        tags: impl IntoIterator<Item = &'a String>,
        uri: &str,
    ) -> Result<(), StorageError> {
        let mut first_error = None;
        let mut record = |result: Result<(), StorageError>| {
            if let Err(err) = result {
                warn!(
                    op = "index::unlink",
                    digest,
                    error = %err,
                    "Failed to remove entry from index"
                );
                first_error.get_or_insert(err);
            }
        };

        for tag in tags {
            record(
                self.store
                    .remove_member(IndexKind::Tag, &index_id(IndexKind::Tag, tag), digest),
            );
        }
        if !uri.is_empty() {
            record(
                self.store
                    .remove_member(IndexKind::Uri, &index_id(IndexKind::Uri, uri), digest),
            );
        }
        if self.track_all {
            record(
                self.store
                    .remove_member(IndexKind::All, ALL_INDEX_ID, digest),
            );
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Digests currently registered under a tag or URI subject.
    pub fn members(&self, kind: IndexKind, subject: &str) -> Vec<String> {
        match self.store.members(kind, &index_id(kind, subject)) {
            Ok(members) => members,
            Err(err) => {
                warn!(
                    op = "index::members",
                    index = kind.as_str(),
                    error = %err,
                    "Failed to read index; treating as empty"
                );
                Vec::new()
            }
        }
    }

    pub fn drop_index(&self, kind: IndexKind, subject: &str) {
        if let Err(err) = self.store.remove_index(kind, &index_id(kind, subject)) {
            warn!(
                op = "index::drop",
                index = kind.as_str(),
                error = %err,
                "Failed to remove index"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MapIndexes {
        sets: Mutex<BTreeMap<(IndexKind, String), BTreeSet<String>>>,
    }

    impl MapIndexes {
        fn index_count(&self) -> usize {
            self.sets.lock().expect("lock").len()
        }
    }

    impl IndexStore for MapIndexes {
        fn add_member(&self, kind: IndexKind, id: &str, digest: &str) -> Result<(), StorageError> {
            self.sets
                .lock()
                .expect("lock")
                .entry((kind, id.to_string()))
                .or_default()
                .insert(digest.to_string());
            Ok(())
        }

        fn remove_member(
            &self,
            kind: IndexKind,
            id: &str,
            digest: &str,
        ) -> Result<(), StorageError> {
            let mut sets = self.sets.lock().expect("lock");
            let key = (kind, id.to_string());
            if let Some(set) = sets.get_mut(&key) {
                set.remove(digest);
                if set.is_empty() {
                    sets.remove(&key);
                }
            }
            Ok(())
        }

        fn members(&self, kind: IndexKind, id: &str) -> Result<Vec<String>, StorageError> {
            Ok(self
                .sets
                .lock()
                .expect("lock")
                .get(&(kind, id.to_string()))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        }

        fn remove_index(&self, kind: IndexKind, id: &str) -> Result<(), StorageError> {
            self.sets.lock().expect("lock").remove(&(kind, id.to_string()));
            Ok(())
        }
    }

    fn tags(values: &[&str]) -> TagSet {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn link_then_unlink_leaves_no_indexes() {
        let keeper = IndexBookkeeper::new(MapIndexes::default(), true);
        let entry_tags = tags(&["global", "post_5"]);

        keeper
            .link("d1", &entry_tags, "http://h/a")
            .expect("link");
        assert_eq!(keeper.members(IndexKind::Tag, "post_5"), vec!["d1"]);
        assert_eq!(keeper.members(IndexKind::Uri, "http://h/a"), vec!["d1"]);
        assert_eq!(keeper.members(IndexKind::All, ""), vec!["d1"]);

        keeper
            .unlink("d1", &entry_tags, "http://h/a")
            .expect("unlink");
        assert_eq!(keeper.store().index_count(), 0);
    }

    #[test]
    fn shared_tag_keeps_other_members() {
        let keeper = IndexBookkeeper::new(MapIndexes::default(), false);
        keeper.link("d1", &tags(&["global"]), "").expect("link d1");
        keeper.link("d2", &tags(&["global"]), "").expect("link d2");

        keeper.unlink("d1", &tags(&["global"]), "").expect("unlink");
        assert_eq!(keeper.members(IndexKind::Tag, "global"), vec!["d2"]);
        assert!(keeper.members(IndexKind::All, "").is_empty());
    }

    #[test]
    fn tag_ids_are_digests() {
        assert_eq!(index_id(IndexKind::Tag, "post_1").len(), 64);
        assert_eq!(index_id(IndexKind::All, "ignored"), ALL_INDEX_ID);
    }
}

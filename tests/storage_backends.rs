//! Behaviour every storage backend must share, plus factory degradation.

use std::sync::Arc;
use std::time::Duration;

use pagehold::cache::{
    BackendKind, BackendOptions, DiskStorage, KeyValueStorage, MemoryKv, Payload, StorageBackend,
    StorageFactory, TagSet, unix_now,
};

fn tags(values: &[&str]) -> TagSet {
    values.iter().map(|value| value.to_string()).collect()
}

fn page(uri: &str) -> Payload {
    Payload::new(format!("<p>{}</p>", "b".repeat(300)), uri)
        .with_status(203)
        .with_header("content-type", "text/html")
}

fn backends(dir: &std::path::Path) -> Vec<Arc<dyn StorageBackend>> {
    vec![
        Arc::new(DiskStorage::new(dir.join("disk"))),
        Arc::new(KeyValueStorage::new(MemoryKv::new(), "contract")),
    ]
}

#[test]
fn stored_entries_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        let before = unix_now();
        assert!(backend.set("k1", page("http://h/a"), &tags(&["global"]), Some(60)));
        let after = unix_now();

        let entry = backend.get("k1").expect("entry");
        assert!(
            (before..=after).contains(&entry.meta.created),
            "{}: created {} outside {before}..={after}",
            backend.name(),
            entry.meta.created
        );
        assert_eq!(entry.status(), 203, "{}", backend.name());
        assert_eq!(entry.uri(), "http://h/a");
        assert_eq!(entry.headers(), &[("content-type".to_string(), "text/html".to_string())]);
        assert_eq!(entry.tags(), &["global".to_string()]);
        assert!(entry.body.starts_with(b"<p>"));

        backend.delete("k1");
        assert!(backend.get("k1").is_none(), "{}", backend.name());
    }
}

#[test]
fn tag_purge_only_touches_tagged_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        backend.set("post", page("http://h/post"), &tags(&["global", "post_1"]), None);
        backend.set("term", page("http://h/term"), &tags(&["global", "term_2"]), None);

        backend.purge_tags(&tags(&["post_1", "unknown"]));
        assert!(backend.get("post").is_none(), "{}", backend.name());
        assert!(backend.get("term").is_some(), "{}", backend.name());

        backend.purge_tags(&tags(&["global"]));
        assert!(backend.get("term").is_none(), "{}", backend.name());
    }
}

#[test]
fn tag_index_stays_usable_after_a_purge() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        backend.set("k1", page("http://h/1"), &tags(&["t"]), None);
        backend.set("k2", page("http://h/2"), &tags(&["t"]), None);
        backend.purge_tags(&tags(&["t"]));

        assert!(backend.set("k3", page("http://h/3"), &tags(&["t"]), None));
        assert!(backend.get("k3").is_some(), "{}", backend.name());
        assert!(backend.get("k1").is_none(), "{}", backend.name());

        backend.purge_tags(&tags(&["t"]));
        assert!(backend.get("k3").is_none(), "{}", backend.name());
    }
}

#[test]
fn uri_purge_drops_every_variant() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        backend.set("desktop", page("http://h/a"), &TagSet::new(), None);
        backend.set("mobile", page("http://h/a"), &TagSet::new(), None);
        backend.set("other", page("http://h/b"), &TagSet::new(), None);

        backend.purge_uri("http://h/a");
        assert!(backend.get("desktop").is_none(), "{}", backend.name());
        assert!(backend.get("mobile").is_none(), "{}", backend.name());
        assert!(backend.get("other").is_some(), "{}", backend.name());
    }
}

#[test]
fn clear_empties_the_backend_and_leaves_it_usable() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        backend.set("a", page("http://h/a"), &tags(&["x"]), None);
        backend.set("b", page("http://h/b"), &tags(&["y"]), Some(30));

        backend.clear();
        backend.clear();
        assert!(backend.get("a").is_none(), "{}", backend.name());
        assert!(backend.get("b").is_none(), "{}", backend.name());

        assert!(backend.set("c", page("http://h/c"), &tags(&["x"]), None));
        assert!(backend.get("c").is_some(), "{}", backend.name());
    }
}

#[test]
fn retagging_an_entry_removes_old_index_membership() {
    let dir = tempfile::tempdir().expect("tempdir");
    for backend in backends(dir.path()) {
        backend.set("k", page("http://h/k"), &tags(&["old"]), None);
        backend.set("k", page("http://h/k"), &tags(&["new"]), None);

        backend.purge_tags(&tags(&["old"]));
        assert!(backend.get("k").is_some(), "{}", backend.name());
        backend.purge_tags(&tags(&["new"]));
        assert!(backend.get("k").is_none(), "{}", backend.name());
    }
}

#[test]
fn factory_degrades_to_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut options = BackendOptions::disk(dir.path().join("cache"));
    options.connect_timeout = Duration::from_millis(200);

    assert_eq!(StorageFactory::create(BackendKind::Disk, &options).name(), "disk");
    assert_eq!(StorageFactory::create(BackendKind::Redis, &options).name(), "disk");
    assert_eq!(StorageFactory::create(BackendKind::Memcached, &options).name(), "disk");
    assert_eq!(StorageFactory::create_named("couchbase", &options).name(), "disk");

    options.redis_url = Some("not a url".to_string());
    let backend = StorageFactory::create(BackendKind::Redis, &options);
    assert_eq!(backend.name(), "disk");
    assert!(backend.set("k", page("http://h/"), &TagSet::new(), None));
}

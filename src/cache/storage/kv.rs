//! Key-value storage backend.
//!
//! Wraps a shared cache service that only offers get/set/delete with expiry
//! plus set primitives. Indexes are synthesized as sets: one per tag, one per
//! URI and a global registry of live digests used by `clear`. Every key lives
//! under a namespace prefix so one server can host several caches.

use std::collections::{BTreeSet, HashMap};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use redis::Commands;
use tracing::{debug, warn};

use super::index::{ALL_INDEX_ID, IndexBookkeeper, IndexKind, IndexStore};
use super::{StorageBackend, StorageError};
use crate::cache::entry::{CacheEntry, EntryMeta, Payload, unix_now};
use crate::cache::key::hash_key;
use crate::cache::lock::mutex_lock;
use crate::cache::tags::TagSet;

pub const DEFAULT_NAMESPACE: &str = "pagehold";

/// Minimal client surface the key-value backend needs.
pub trait KvClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value, expiring after `ttl` seconds when given.
    fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError>;

    /// Remove a set member; an emptied set disappears.
    fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError>;

    fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Cheap liveness check.
    fn ping(&self) -> bool;
}

/// Redis client over one synchronous connection.
pub struct RedisKv {
    conn: Mutex<redis::Connection>,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// Connect with bounded connect, read and write timeouts.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_with_timeout(timeout)?;
        conn.set_read_timeout(Some(timeout))?;
        conn.set_write_timeout(Some(timeout))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        op: &'static str,
        run: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StorageError> {
        let mut conn = mutex_lock(&self.conn, "cache::storage::kv", op);
        run(&mut conn).map_err(StorageError::from)
    }
}

impl KvClient for RedisKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_conn("redis.get", |conn| conn.get(key))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), StorageError> {
        self.with_conn("redis.set", |conn| match ttl {
            Some(seconds) => conn.set_ex(key, value, seconds),
            None => conn.set(key, value),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.with_conn("redis.del", |conn| conn.del(key))
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.with_conn("redis.sadd", |conn| conn.sadd(key, member))
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.with_conn("redis.srem", |conn| conn.srem(key, member))
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.with_conn("redis.smembers", |conn| conn.smembers(key))
    }

    fn ping(&self) -> bool {
        self.with_conn("redis.ping", |conn| {
            redis::cmd("PING").query::<String>(conn)
        })
        .is_ok()
    }
}

/// Longest relative expiry memcached accepts; larger values are read as
/// absolute unix timestamps.
const MEMCACHED_RELATIVE_TTL_MAX: u64 = 60 * 60 * 24 * 30;

const MEMCACHED_DEFAULT_PORT: u16 = 11211;

/// Memcached client.
///
/// Memcached has no set type, so set keys hold a JSON array of members that
/// is rewritten under a process-wide lock.
pub struct MemcachedKv {
    client: memcache::Client,
    sets: Mutex<()>,
}

impl std::fmt::Debug for MemcachedKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedKv").finish_non_exhaustive()
    }
}

impl MemcachedKv {
    /// Connect with bounded connect, read and write timeouts.
    ///
    /// Accepts `memcache://host:port` or a bare `host:port`.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, StorageError> {
        let url = memcached_url(url);
        ensure_reachable(&url, timeout)?;
        let client = memcache::Client::connect(url.as_str())?;
        client.set_read_timeout(Some(timeout))?;
        client.set_write_timeout(Some(timeout))?;
        Ok(Self {
            client,
            sets: Mutex::new(()),
        })
    }

    fn read_set(&self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        match self.client.get::<Vec<u8>>(key)? {
            Some(raw) => decode_members(key, &raw),
            None => Ok(BTreeSet::new()),
        }
    }

    fn write_set(&self, key: &str, members: &BTreeSet<String>) -> Result<(), StorageError> {
        if members.is_empty() {
            self.client.delete(key)?;
            return Ok(());
        }
        let encoded = serde_json::to_vec(members).map_err(StorageError::Encode)?;
        self.client.set(key, encoded.as_slice(), 0)?;
        Ok(())
    }
}

fn memcached_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("memcache://{trimmed}")
    }
}

/// Fail fast when nothing listens at the server address; the client's own
/// pool otherwise waits far longer than `timeout`.
fn ensure_reachable(url: &str, timeout: Duration) -> Result<(), StorageError> {
    let parsed = url::Url::parse(url)
        .map_err(|err| StorageError::backend(format!("invalid memcached url `{url}`: {err}")))?;
    let Some(host) = parsed.host_str().filter(|host| !host.is_empty()) else {
        return Ok(());
    };
    let port = parsed.port().unwrap_or(MEMCACHED_DEFAULT_PORT);
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| StorageError::backend(format!("cannot resolve `{host}`: {err}")))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(err) => last_error = Some(err),
        }
    }
    Err(StorageError::backend(match last_error {
        Some(err) => format!("memcached at {host}:{port} is unreachable: {err}"),
        None => format!("`{host}` resolved to no addresses"),
    }))
}

/// Memcached expiration for a TTL: `0` never expires, `None` means the value
/// is already expired and must not be stored.
fn memcached_expiration(ttl: Option<u64>, now: u64) -> Option<u32> {
    match ttl {
        None => Some(0),
        Some(0) => None,
        Some(seconds) if seconds <= MEMCACHED_RELATIVE_TTL_MAX => Some(seconds as u32),
        Some(seconds) => Some(u32::try_from(now.saturating_add(seconds)).unwrap_or(u32::MAX)),
    }
}

fn decode_members(key: &str, raw: &[u8]) -> Result<BTreeSet<String>, StorageError> {
    serde_json::from_slice(raw).map_err(|err| StorageError::decode(key, err))
}

impl KvClient for MemcachedKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.client.get::<Vec<u8>>(key)?)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), StorageError> {
        match memcached_expiration(ttl, u64::try_from(unix_now()).unwrap_or(0)) {
            Some(expiration) => self.client.set(key, value, expiration)?,
            None => {
                self.client.delete(key)?;
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client.delete(key)?;
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let _guard = mutex_lock(&self.sets, "cache::storage::kv", "memcached.sadd");
        let mut members = self.read_set(key)?;
        if members.insert(member.to_string()) {
            self.write_set(key, &members)?;
        }
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let _guard = mutex_lock(&self.sets, "cache::storage::kv", "memcached.srem");
        let mut members = self.read_set(key)?;
        if members.remove(member) {
            self.write_set(key, &members)?;
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.read_set(key)?.into_iter().collect())
    }

    fn ping(&self) -> bool {
        self.client.version().is_ok()
    }
}

#[derive(Debug, Clone)]
enum MemoryValue {
    Bytes {
        data: Vec<u8>,
        expires_at: Option<Instant>,
    },
    Set(BTreeSet<String>),
}

/// In-process client with the same semantics as the Redis one.
#[derive(Debug)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, MemoryValue>>,
    available: bool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            available: true,
        }
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose server is unreachable: every call fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    /// Number of live keys, for tests and diagnostics.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        mutex_lock(&self.values, "cache::storage::kv", "memory.len")
            .values()
            .filter(|value| !is_expired(value, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<(), StorageError> {
        if self.available {
            Ok(())
        } else {
            Err(StorageError::backend("memory kv marked unavailable"))
        }
    }
}

fn is_expired(value: &MemoryValue, now: Instant) -> bool {
    matches!(value, MemoryValue::Bytes { expires_at: Some(at), .. } if *at <= now)
}

impl KvClient for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.guard()?;
        let mut values = mutex_lock(&self.values, "cache::storage::kv", "memory.get");
        match values.get(key) {
            Some(value) if is_expired(value, Instant::now()) => {
                values.remove(key);
                Ok(None)
            }
            Some(MemoryValue::Bytes { data, .. }) => Ok(Some(data.clone())),
            Some(MemoryValue::Set(_)) => Err(StorageError::backend(format!(
                "key `{key}` holds a set, not a value"
            ))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), StorageError> {
        self.guard()?;
        let expires_at = ttl.map(|seconds| Instant::now() + Duration::from_secs(seconds));
        mutex_lock(&self.values, "cache::storage::kv", "memory.set").insert(
            key.to_string(),
            MemoryValue::Bytes {
                data: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.guard()?;
        mutex_lock(&self.values, "cache::storage::kv", "memory.delete").remove(key);
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.guard()?;
        let mut values = mutex_lock(&self.values, "cache::storage::kv", "memory.sadd");
        let entry = values
            .entry(key.to_string())
            .or_insert_with(|| MemoryValue::Set(BTreeSet::new()));
        match entry {
            MemoryValue::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            MemoryValue::Bytes { .. } => Err(StorageError::backend(format!(
                "key `{key}` holds a value, not a set"
            ))),
        }
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.guard()?;
        let mut values = mutex_lock(&self.values, "cache::storage::kv", "memory.srem");
        if let Some(MemoryValue::Set(members)) = values.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                values.remove(key);
            }
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.guard()?;
        let values = mutex_lock(&self.values, "cache::storage::kv", "memory.smembers");
        Ok(match values.get(key) {
            Some(MemoryValue::Set(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    fn ping(&self) -> bool {
        self.available
    }
}

/// Namespaced key scheme shared by entries and indexes.
#[derive(Debug, Clone)]
struct KvKeys {
    namespace: String,
}

impl KvKeys {
    fn meta(&self, digest: &str) -> String {
        format!("{}:meta:{digest}", self.namespace)
    }

    fn body(&self, digest: &str) -> String {
        format!("{}:body:{digest}", self.namespace)
    }

    fn index(&self, kind: IndexKind, id: &str) -> String {
        match kind {
            IndexKind::All => format!("{}:{ALL_INDEX_ID}", self.namespace),
            IndexKind::Tag | IndexKind::Uri => {
                format!("{}:{}:{id}", self.namespace, kind.as_str())
            }
        }
    }

    /// Set of every tag/URI index key ever created, for `clear`.
    fn registry(&self) -> String {
        format!("{}:indexes", self.namespace)
    }
}

/// Indexes as native sets on the key-value server.
pub struct KvIndexes<C> {
    client: Arc<C>,
    keys: KvKeys,
}

impl<C: KvClient> IndexStore for KvIndexes<C> {
    fn add_member(&self, kind: IndexKind, id: &str, digest: &str) -> Result<(), StorageError> {
        let key = self.keys.index(kind, id);
        self.client.set_add(&key, digest)?;
        if kind != IndexKind::All {
            self.client.set_add(&self.keys.registry(), &key)?;
        }
        Ok(())
    }

    fn remove_member(
        &self,
        kind: IndexKind,
        id: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        self.client.set_remove(&self.keys.index(kind, id), digest)
    }

    fn members(&self, kind: IndexKind, id: &str) -> Result<Vec<String>, StorageError> {
        self.client.set_members(&self.keys.index(kind, id))
    }

    fn remove_index(&self, kind: IndexKind, id: &str) -> Result<(), StorageError> {
        let key = self.keys.index(kind, id);
        self.client.delete(&key)?;
        if kind != IndexKind::All {
            self.client.set_remove(&self.keys.registry(), &key)?;
        }
        Ok(())
    }
}

/// Cache entries on a shared key-value server.
pub struct KeyValueStorage<C> {
    client: Arc<C>,
    keys: KvKeys,
    indexes: IndexBookkeeper<KvIndexes<C>>,
}

impl<C: KvClient> KeyValueStorage<C> {
    pub fn new(client: C, namespace: impl Into<String>) -> Self {
        let client = Arc::new(client);
        let keys = KvKeys {
            namespace: namespace.into(),
        };
        let indexes = IndexBookkeeper::new(
            KvIndexes {
                client: Arc::clone(&client),
                keys: keys.clone(),
            },
            true,
        );
        Self {
            client,
            keys,
            indexes,
        }
    }

    /// True when the server answers; the factory never hands out a backend
    /// that fails this check.
    pub fn is_available(&self) -> bool {
        self.client.ping()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn load_meta(&self, digest: &str) -> Result<Option<EntryMeta>, StorageError> {
        let Some(raw) = self.client.get(&self.keys.meta(digest))? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StorageError::decode(self.keys.meta(digest), err))
    }

    fn load(&self, digest: &str) -> Result<Option<CacheEntry>, StorageError> {
        let meta = match self.load_meta(digest) {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(None),
            Err(err @ StorageError::Decode { .. }) => {
                warn!(op = "kv::get", digest, error = %err, "Removing corrupt cache entry");
                self.remove_records(digest);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match self.client.get(&self.keys.body(digest))? {
            Some(body) => Ok(Some(CacheEntry {
                meta,
                body: Bytes::from(body),
            })),
            None => {
                debug!(op = "kv::get", digest, "Metadata without body; self-healing");
                self.remove_entry(digest, Some(meta));
                Ok(None)
            }
        }
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
        let expiry = ttl.filter(|ttl| *ttl > 0).map(|ttl| ttl as u64);

        self.client
            .set(&self.keys.body(digest), &payload.body, expiry)?;
        self.client.set(&self.keys.meta(digest), &encoded, expiry)?;
        self.indexes.link(digest, tags, &meta.uri)
    }

    fn remove_records(&self, digest: &str) {
        for key in [self.keys.meta(digest), self.keys.body(digest)] {
            if let Err(err) = self.client.delete(&key) {
                warn!(op = "kv::delete", key = %key, error = %err, "Failed to delete cache record");
            }
        }
    }

    fn remove_entry(&self, digest: &str, meta: Option<EntryMeta>) {
        let meta = meta.or_else(|| self.load_meta(digest).ok().flatten());
        self.remove_records(digest);
        match meta {
            Some(meta) => {
                // unlink logs each failed removal itself.
                let _ = self.indexes.unlink(digest, &meta.tags, &meta.uri);
            }
            None => {
                if let Err(err) =
                    self.indexes
                        .store()
                        .remove_member(IndexKind::All, ALL_INDEX_ID, digest)
                {
                    warn!(
                        op = "kv::unlink",
                        digest,
                        error = %err,
                        "Failed to remove entry from registry"
                    );
                }
            }
        }
    }

    fn purge_index(&self, kind: IndexKind, subject: &str) {
        for digest in self.indexes.members(kind, subject) {
            self.remove_entry(&digest, None);
        }
        self.indexes.drop_index(kind, subject);
    }
}

impl<C: KvClient> StorageBackend for KeyValueStorage<C> {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let digest = hash_key(key);
        match self.load(&digest) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(op = "kv::get", digest = %digest, error = %err, "Cache read failed");
                None
            }
        }
    }

    fn set(&self, key: &str, payload: Payload, tags: &TagSet, ttl: Option<i64>) -> bool {
        let digest = hash_key(key);
        self.remove_entry(&digest, None);

        match self.store(&digest, key, payload, tags, ttl) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    op = "kv::set",
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
        for digest in self.indexes.members(IndexKind::All, ALL_INDEX_ID) {
            self.remove_records(&digest);
        }

        let registry = self.keys.registry();
        let index_keys = self.client.set_members(&registry).unwrap_or_else(|err| {
            warn!(op = "kv::clear", error = %err, "Failed to list index registry");
            Vec::new()
        });
        for key in index_keys
            .into_iter()
            .chain([self.keys.index(IndexKind::All, ALL_INDEX_ID), registry])
        {
            if let Err(err) = self.client.delete(&key) {
                warn!(op = "kv::clear", key = %key, error = %err, "Failed to delete index");
            }
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

    /// Records expire natively; only registry members whose metadata has
    /// gone are pruned here.
    fn sweep_expired(&self) -> usize {
        let mut pruned = 0;
        for digest in self.indexes.members(IndexKind::All, ALL_INDEX_ID) {
            match self.client.get(&self.keys.meta(&digest)) {
                Ok(None) => {
                    self.remove_entry(&digest, None);
                    pruned += 1;
                }
                Ok(Some(_)) => {}
                Err(err) => {
                    warn!(op = "kv::sweep", error = %err, "Sweep aborted");
                    break;
                }
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> TagSet {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn body() -> Vec<u8> {
        vec![b'y'; 300]
    }

    #[test]
    fn namespaced_keys() {
        let keys = KvKeys {
            namespace: "site".into(),
        };
        assert_eq!(keys.meta("d"), "site:meta:d");
        assert_eq!(keys.body("d"), "site:body:d");
        assert_eq!(keys.index(IndexKind::Tag, "x"), "site:tag:x");
        assert_eq!(keys.index(IndexKind::All, "ignored"), "site:all");
    }

    #[test]
    fn memcached_expirations() {
        assert_eq!(memcached_expiration(None, 1_000), Some(0));
        assert_eq!(memcached_expiration(Some(0), 1_000), None);
        assert_eq!(memcached_expiration(Some(60), 1_000), Some(60));
        assert_eq!(
            memcached_expiration(Some(MEMCACHED_RELATIVE_TTL_MAX + 1), 1_000),
            Some((1_000 + MEMCACHED_RELATIVE_TTL_MAX + 1) as u32)
        );
        assert_eq!(memcached_expiration(Some(u64::MAX), 1_000), Some(u32::MAX));
    }

    #[test]
    fn memcached_urls_gain_a_scheme() {
        assert_eq!(memcached_url(" 127.0.0.1:11211 "), "memcache://127.0.0.1:11211");
        assert_eq!(memcached_url("memcache://cache:11211"), "memcache://cache:11211");
    }

    #[test]
    fn memcached_set_members_decode_or_fail() {
        let members = decode_members("k", br#"["b","a"]"#).expect("members");
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(matches!(
            decode_members("k", b"not json"),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn unreachable_memcached_fails_fast() {
        let started = Instant::now();
        let result = MemcachedKv::connect("127.0.0.1:1", Duration::from_millis(200));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn memory_client_expires_values() {
        let kv = MemoryKv::new();
        kv.set("a", b"1", Some(0)).expect("set");
        assert_eq!(kv.get("a").expect("get"), None);
        kv.set("b", b"2", None).expect("set");
        assert_eq!(kv.get("b").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn missing_body_self_heals_registry() {
        let storage = KeyValueStorage::new(MemoryKv::new(), DEFAULT_NAMESPACE);
        storage.set("k", Payload::new(body(), "http://h/a"), &tags(&["t"]), None);
        let digest = hash_key("k");
        storage
            .client()
            .delete(&storage.keys.body(&digest))
            .expect("delete body");

        assert!(storage.get("k").is_none());
        assert!(storage.indexes.members(IndexKind::Tag, "t").is_empty());
        assert!(storage.indexes.members(IndexKind::Uri, "http://h/a").is_empty());
        assert_eq!(
            storage.client().get(&storage.keys.meta(&digest)).expect("get"),
            None
        );
    }

    #[test]
    fn sweep_prunes_registry_members_without_records() {
        let storage = KeyValueStorage::new(MemoryKv::new(), DEFAULT_NAMESPACE);
        storage.set("k", Payload::new(body(), "http://h/a"), &TagSet::new(), None);
        let digest = hash_key("k");
        storage
            .client()
            .delete(&storage.keys.meta(&digest))
            .expect("delete meta");

        assert_eq!(storage.sweep_expired(), 1);
        assert!(
            storage
                .indexes
                .members(IndexKind::All, ALL_INDEX_ID)
                .is_empty()
        );
    }

    /// Memory client whose set removals always fail.
    struct StuckSets(MemoryKv);

    impl KvClient for StuckSets {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), StorageError> {
            self.0.set(key, value, ttl)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.0.delete(key)
        }

        fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
            self.0.set_add(key, member)
        }

        fn set_remove(&self, _key: &str, _member: &str) -> Result<(), StorageError> {
            Err(StorageError::backend("srem refused"))
        }

        fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
            self.0.set_members(key)
        }

        fn ping(&self) -> bool {
            true
        }
    }

    #[test]
    fn failed_registry_removal_still_drops_records() {
        let storage = KeyValueStorage::new(StuckSets(MemoryKv::new()), DEFAULT_NAMESPACE);
        storage.set("k", Payload::new(body(), "http://h/a"), &TagSet::new(), None);
        let digest = hash_key("k");
        storage
            .client()
            .delete(&storage.keys.meta(&digest))
            .expect("delete meta");

        storage.delete("k");

        assert_eq!(
            storage.client().get(&storage.keys.body(&digest)).expect("get"),
            None
        );
        assert_eq!(
            storage.indexes.members(IndexKind::All, ALL_INDEX_ID),
            vec![digest]
        );
    }

    #[test]
    fn unavailable_client_fails_writes() {
        let storage = KeyValueStorage::new(MemoryKv::unavailable(), DEFAULT_NAMESPACE);
        assert!(!storage.is_available());
        assert!(!storage.set("k", Payload::new(body(), "http://h/a"), &TagSet::new(), None));
        assert!(storage.get("k").is_none());
    }
}

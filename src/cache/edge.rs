//! Edge reader.
//!
//! Serves fresh hits straight from the disk cache before the application
//! stack is built. It only needs the config snapshot and the request, applies
//! the same eligibility, key and freshness rules as the controller, and
//! otherwise falls through so the full stack handles the request.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use super::config::CachePolicy;
use super::controller::{CacheState, Diagnostics};
use super::entry::unix_now;
use super::key::{KeyBuilder, VaryContext, hash_key};
use super::pattern;
use super::request::RequestContext;
use super::snapshot::ConfigSnapshot;
use super::storage::{DiskLayout, DiskStorage};

/// A stored response ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeHit {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOutcome {
    Serve(EdgeHit),
    /// Let the application handle the request. `state` is set when a
    /// diagnostic header should still be emitted.
    FallThrough { state: Option<CacheState> },
}

impl EdgeOutcome {
    fn pass() -> Self {
        Self::FallThrough { state: None }
    }

    fn miss() -> Self {
        Self::FallThrough {
            state: Some(CacheState::Miss),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeReader {
    layout: DiskLayout,
    policy: CachePolicy,
    keys: KeyBuilder,
}

impl EdgeReader {
    /// Open a reader over a cache directory, taking rules from the snapshot
    /// at `snapshot_path` (defaults when it is missing or malformed).
    pub fn open(cache_dir: impl Into<PathBuf>, snapshot_path: &Path) -> Self {
        Self::with_policy(cache_dir, ConfigSnapshot::load_or_default(snapshot_path).policy)
    }

    pub fn with_policy(cache_dir: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        Self {
            layout: DiskLayout::new(cache_dir),
            keys: KeyBuilder::new(&policy),
            policy,
        }
    }

    pub fn serve(&self, ctx: &RequestContext) -> EdgeOutcome {
        if let Some(reason) = self.skip_reason(ctx) {
            debug!(op = "edge::serve", reason, "Edge reader falling through");
            return EdgeOutcome::pass();
        }

        let vary = VaryContext {
            mobile: ctx.is_mobile(),
            session: None,
            locale: ctx.cookies.get(&self.policy.language_cookie).cloned(),
            cookies: ctx.cookies.clone(),
        };
        let key = self
            .keys
            .build(&ctx.scheme, &ctx.host, &ctx.path, &ctx.query, &vary);
        let digest = hash_key(&key);

        let meta = match self.layout.read_meta(&digest) {
            Ok(Some(meta)) => meta,
            _ => return EdgeOutcome::miss(),
        };
        let Ok(body) = fs::read(self.layout.body_path(&digest)) else {
            return EdgeOutcome::miss();
        };

        let now = unix_now();
        if !meta.is_fresh(now) {
            debug!(op = "edge::serve", digest = %digest, "Removing expired entry");
            DiskStorage::new(self.layout.root()).evict(&digest, meta);
            return EdgeOutcome::miss();
        }

        EdgeOutcome::Serve(EdgeHit {
            status: meta.status,
            body: Bytes::from(body),
            diagnostics: Diagnostics {
                state: CacheState::Hit,
                key_hash: Some(digest),
                age: Some(meta.age(now)),
            },
            headers: meta.headers,
        })
    }

    fn skip_reason(&self, ctx: &RequestContext) -> Option<&'static str> {
        let policy = &self.policy;

        if !ctx.is_read_method() {
            return Some("method");
        }
        if ctx.has_form_body {
            return Some("form_body");
        }
        if ctx.is_authenticated()
            || (!policy.logged_in_cookie_prefix.is_empty()
                && ctx
                    .cookies
                    .keys()
                    .any(|name| name.starts_with(&policy.logged_in_cookie_prefix)))
        {
            return Some("logged_in");
        }
        if pattern::matches(&policy.exclude_urls, &ctx.request_uri()) {
            return Some("excluded_url");
        }
        if let Some(agent) = ctx.user_agent()
            && pattern::matches(&policy.exclude_user_agents, agent)
        {
            return Some("excluded_agent");
        }
        if policy
            .exclude_cookies
            .iter()
            .any(|cookie| ctx.cookies.contains_key(cookie))
        {
            return Some("excluded_cookie");
        }
        let excluded_args = policy.excluded_query_args();
        if ctx
            .query_names()
            .any(|name| excluded_args.contains(&name.to_lowercase()))
        {
            return Some("excluded_query");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Payload;
    use crate::cache::storage::StorageBackend;
    use crate::cache::tags::TagSet;

    fn seed(dir: &Path, policy: &CachePolicy, ctx: &RequestContext, ttl: Option<i64>) -> String {
        seed_tagged(dir, policy, ctx, ttl, &TagSet::new())
    }

    fn seed_tagged(
        dir: &Path,
        policy: &CachePolicy,
        ctx: &RequestContext,
        ttl: Option<i64>,
        tags: &TagSet,
    ) -> String {
        let key = KeyBuilder::new(policy).build_for_request(ctx);
        DiskStorage::new(dir).set(
            &key,
            Payload::new(vec![b'e'; 300], ctx.absolute_url()).with_header("content-type", "text/html"),
            tags,
            ttl,
        );
        hash_key(&key)
    }

    #[test]
    fn serves_fresh_entries_with_diagnostics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = CachePolicy::default();
        let ctx = RequestContext::new("GET", "http://h/about");
        let digest = seed(dir.path(), &policy, &ctx, Some(60));

        let EdgeOutcome::Serve(hit) = EdgeReader::with_policy(dir.path(), policy).serve(&ctx) else {
            panic!("expected edge hit");
        };
        assert_eq!(hit.body.len(), 300);
        assert_eq!(hit.diagnostics.key_hash.as_deref(), Some(digest.as_str()));
        assert_eq!(hit.headers, vec![("content-type".to_string(), "text/html".to_string())]);
    }

    #[test]
    fn logged_in_cookie_prefix_falls_through_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = CachePolicy::default();
        let ctx = RequestContext::new("GET", "http://h/about").with_cookie("session_abc", "1");
        seed(dir.path(), &policy, &ctx, None);

        assert_eq!(
            EdgeReader::with_policy(dir.path(), policy).serve(&ctx),
            EdgeOutcome::FallThrough { state: None }
        );
    }

    #[test]
    fn form_posts_fall_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = RequestContext::new("GET", "http://h/");
        ctx.has_form_body = true;
        assert_eq!(
            EdgeReader::with_policy(dir.path(), CachePolicy::default()).serve(&ctx),
            EdgeOutcome::FallThrough { state: None }
        );
    }

    #[test]
    fn absent_entry_reports_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader = EdgeReader::open(dir.path(), &dir.path().join("missing.json"));
        assert_eq!(
            reader.serve(&RequestContext::new("GET", "http://h/nothing")),
            EdgeOutcome::FallThrough {
                state: Some(CacheState::Miss)
            }
        );
    }

    #[test]
    fn language_cookie_selects_the_variant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = CachePolicy {
            vary_language: true,
            ..Default::default()
        };
        let german = RequestContext::new("GET", "http://h/").with_locale("de");
        seed(dir.path(), &policy, &german, None);
        let reader = EdgeReader::with_policy(dir.path(), policy);

        let with_cookie = RequestContext::new("GET", "http://h/").with_cookie("lang", "de");
        assert!(matches!(reader.serve(&with_cookie), EdgeOutcome::Serve(_)));
        let other = RequestContext::new("GET", "http://h/").with_cookie("lang", "fr");
        assert!(matches!(reader.serve(&other), EdgeOutcome::FallThrough { .. }));
    }

    #[test]
    fn expired_entries_leave_no_index_references() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policy = CachePolicy::default();
        let ctx = RequestContext::new("GET", "http://h/post/1");
        let tags: TagSet = ["post_1".to_string()].into_iter().collect();
        let digest = seed_tagged(dir.path(), &policy, &ctx, Some(1), &tags);
        let tag_index = dir.path().join("tags").join(format!("{}.json", hash_key("post_1")));
        let uri_index = dir
            .path()
            .join("uris")
            .join(format!("{}.json", hash_key(&ctx.absolute_url())));
        assert!(tag_index.exists());
        assert!(uri_index.exists());

        std::thread::sleep(std::time::Duration::from_millis(1100));

        let reader = EdgeReader::with_policy(dir.path(), policy);
        assert_eq!(
            reader.serve(&ctx),
            EdgeOutcome::FallThrough {
                state: Some(CacheState::Miss)
            }
        );
        assert!(!dir.path().join("meta").join(format!("{digest}.json")).exists());
        assert!(!tag_index.exists());
        assert!(!uri_index.exists());
    }
}

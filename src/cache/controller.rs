//! Request-time cache state machine.
//!
//! A request goes through two phases. [`RequestController::lookup`] runs
//! before rendering and ends in one of three ways: the request is not
//! eligible (`BYPASS`), a fresh entry is served (`HIT`), or rendering must
//! happen (`MISS`, or `STALE` after evicting an expired entry) with a
//! [`Capture`] armed. [`RequestController::finish`] then receives the rendered
//! response and stores it when the capture rules allow.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::debug;

use super::config::CachePolicy;
use super::entry::{CacheEntry, Payload, unix_now};
use super::facade::{CacheFacade, METRIC_CACHE_BYPASS};
use super::key::{KeyBuilder, hash_key};
use super::pattern;
use super::request::RequestContext;
use super::tags::{QueryContext, TagDeriver};

pub const HEADER_STATE: &str = "x-page-cache";
pub const HEADER_KEY: &str = "x-page-cache-key";
pub const HEADER_AGE: &str = "x-page-cache-age";

/// Final override on eligibility. Receives `true` while looking up and
/// `false` while capturing; returning `false` forces a bypass.
pub type EligibilityOverride = Arc<dyn Fn(&RequestContext, bool) -> bool + Send + Sync>;
pub type ServeHook = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Bypass,
    Miss,
    Stale,
    Hit,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bypass => "BYPASS",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
            Self::Hit => "HIT",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic header values for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub state: CacheState,
    /// Digest of the cache key, when one was computed.
    pub key_hash: Option<String>,
    /// Entry age in whole seconds, on a hit.
    pub age: Option<i64>,
}

impl Diagnostics {
    fn bypass() -> Self {
        Self {
            state: CacheState::Bypass,
            key_hash: None,
            age: None,
        }
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(HEADER_STATE, self.state.as_str().to_string())];
        if let Some(hash) = &self.key_hash {
            headers.push((HEADER_KEY, hash.clone()));
        }
        if let Some(age) = self.age {
            headers.push((HEADER_AGE, age.to_string()));
        }
        headers
    }
}

/// A fresh entry ready to be written to the client verbatim.
#[derive(Debug, Clone)]
pub struct HitResponse {
    pub entry: CacheEntry,
    pub diagnostics: Diagnostics,
}

/// Armed response capture for a request that must be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub key: String,
    pub uri: String,
    pub diagnostics: Diagnostics,
}

/// Outcome of the lookup phase.
#[derive(Debug, Clone)]
pub enum Lookup {
    Bypass(Diagnostics),
    Hit(HitResponse),
    Render(Capture),
}

impl Lookup {
    pub fn state(&self) -> CacheState {
        match self {
            Self::Bypass(diagnostics) => diagnostics.state,
            Self::Hit(hit) => hit.diagnostics.state,
            Self::Render(capture) => capture.diagnostics.state,
        }
    }
}

/// A fully rendered response handed back for capture.
#[derive(Debug, Clone, Default)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub diagnostics: Diagnostics,
    pub stored: bool,
}

pub struct RequestController {
    policy: CachePolicy,
    keys: KeyBuilder,
    facade: Arc<CacheFacade>,
    tagger: TagDeriver,
    overrides: Vec<EligibilityOverride>,
    before_serve: Vec<ServeHook>,
    after_serve: Vec<ServeHook>,
}

impl fmt::Debug for RequestController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestController")
            .field("policy", &self.policy)
            .field("keys", &self.keys)
            .field("facade", &self.facade)
            .field("overrides", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

impl RequestController {
    pub fn new(policy: CachePolicy, facade: Arc<CacheFacade>) -> Self {
        Self {
            keys: KeyBuilder::new(&policy),
            policy,
            facade,
            tagger: TagDeriver::default(),
            overrides: Vec::new(),
            before_serve: Vec::new(),
            after_serve: Vec::new(),
        }
    }

    pub fn with_key_builder(mut self, keys: KeyBuilder) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_tagger(mut self, tagger: TagDeriver) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn with_override(
        mut self,
        predicate: impl Fn(&RequestContext, bool) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.overrides.push(Arc::new(predicate));
        self
    }

    pub fn on_before_serve(mut self, hook: impl Fn(&CacheEntry) + Send + Sync + 'static) -> Self {
        self.before_serve.push(Arc::new(hook));
        self
    }

    pub fn on_after_serve(mut self, hook: impl Fn(&CacheEntry) + Send + Sync + 'static) -> Self {
        self.after_serve.push(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn facade(&self) -> &Arc<CacheFacade> {
        &self.facade
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Returns true when the request may participate in caching.
    pub fn is_eligible(&self, ctx: &RequestContext, serving: bool) -> bool {
        self.bypass_reason(ctx, serving).is_none()
    }

    fn bypass_reason(&self, ctx: &RequestContext, serving: bool) -> Option<&'static str> {
        let policy = &self.policy;
        let flags = &ctx.flags;

        if !ctx.is_read_method() {
            return Some("method");
        }
        if flags.is_special_context() {
            return Some("context");
        }
        if flags.api && !policy.cache_api {
            return Some("api");
        }
        if flags.no_cache {
            return Some("no_cache");
        }
        if flags.feed {
            return Some("feed");
        }
        if ctx.is_authenticated() && !policy.serves_private_cache() {
            return Some("logged_in");
        }
        if self.matches_exclusions(ctx) {
            return Some("excluded");
        }
        if !self.overrides.iter().all(|allow| allow(ctx, serving)) {
            return Some("override");
        }
        None
    }

    fn matches_exclusions(&self, ctx: &RequestContext) -> bool {
        let policy = &self.policy;

        if pattern::matches(&policy.exclude_urls, &ctx.request_uri()) {
            return true;
        }
        if let Some(agent) = ctx.user_agent()
            && pattern::matches(&policy.exclude_user_agents, agent)
        {
            return true;
        }
        if policy
            .exclude_cookies
            .iter()
            .any(|cookie| ctx.cookies.contains_key(cookie))
        {
            return true;
        }

        let excluded_args = policy.excluded_query_args();
        !excluded_args.is_empty()
            && ctx
                .query_names()
                .any(|name| excluded_args.contains(&name.to_lowercase()))
    }

    /// Decide how to handle a request before rendering.
    pub fn lookup(&self, ctx: &RequestContext) -> Lookup {
        if let Some(reason) = self.bypass_reason(ctx, true) {
            debug!(state = "BYPASS", reason, "Request not eligible for caching");
            counter!(METRIC_CACHE_BYPASS).increment(1);
            self.facade.record_miss();
            return Lookup::Bypass(Diagnostics::bypass());
        }

        let key = self.keys.build_for_request(ctx);
        let key_hash = hash_key(&key);
        let uri = ctx.absolute_url();

        let Some(entry) = self.facade.get(&key) else {
            debug!(state = "MISS", key_hash = %key_hash, "No cached entry");
            self.facade.record_miss();
            return Lookup::Render(Capture {
                key,
                uri,
                diagnostics: Diagnostics {
                    state: CacheState::Miss,
                    key_hash: Some(key_hash),
                    age: None,
                },
            });
        };

        let now = unix_now();
        if !entry.is_fresh(now) {
            let stale_uri = if entry.uri().is_empty() {
                uri.as_str()
            } else {
                entry.uri()
            };
            debug!(state = "STALE", key_hash = %key_hash, age = entry.age(now), "Evicting expired entry");
            self.facade.evict_uri(stale_uri);
            self.facade.record_miss();
            return Lookup::Render(Capture {
                key,
                uri,
                diagnostics: Diagnostics {
                    state: CacheState::Stale,
                    key_hash: Some(key_hash),
                    age: None,
                },
            });
        }

        self.facade.record_hit();
        for hook in &self.before_serve {
            hook(&entry);
        }
        debug!(state = "HIT", key_hash = %key_hash, "Serving cached entry");

        let age = entry.age(now);
        Lookup::Hit(HitResponse {
            entry,
            diagnostics: Diagnostics {
                state: CacheState::Hit,
                key_hash: Some(key_hash),
                age: Some(age),
            },
        })
    }

    /// Notify observers that a hit has been written to the client.
    pub fn complete_hit(&self, hit: &HitResponse) {
        for hook in &self.after_serve {
            hook(&hit.entry);
        }
    }

    /// TTL for a rendered view: front page, then feed, then the default.
    pub fn select_ttl(&self, view: &QueryContext) -> i64 {
        if view.front_page {
            self.policy.ttl_front_page
        } else if view.feed {
            self.policy.ttl_feed
        } else {
            self.policy.ttl_default
        }
    }

    /// Store a rendered response if the capture rules allow it.
    ///
    /// The response itself is never altered; the outcome only reports what
    /// happened for the diagnostic headers.
    pub fn finish(
        &self,
        capture: &Capture,
        ctx: &RequestContext,
        response: &CapturedResponse,
        view: &QueryContext,
    ) -> CaptureOutcome {
        let mut rendered = ctx.clone();
        rendered.flags.feed |= view.feed;
        if let Some(reason) = self.bypass_reason(&rendered, false) {
            debug!(state = "BYPASS", reason, "Rendered view not eligible for caching");
            return CaptureOutcome {
                diagnostics: Diagnostics::bypass(),
                stored: false,
            };
        }

        let skip = if response.body.len() < self.policy.min_body_bytes {
            Some("body_too_short")
        } else if response.status >= 400 {
            Some("error_status")
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!(reason, status = response.status, "Response not stored");
            return CaptureOutcome {
                diagnostics: capture.diagnostics.clone(),
                stored: false,
            };
        }

        let ttl = self.select_ttl(view);
        let tags = self.tagger.current_tags(view);
        let payload = Payload {
            body: response.body.clone(),
            headers: response
                .headers
                .iter()
                .filter(|(name, _)| !is_diagnostic_header(name))
                .cloned()
                .collect(),
            status: response.status,
            uri: capture.uri.clone(),
        };

        let stored = self.facade.set(&capture.key, payload, tags, Some(ttl));
        CaptureOutcome {
            diagnostics: capture.diagnostics.clone(),
            stored,
        }
    }
}

fn is_diagnostic_header(name: &str) -> bool {
    [HEADER_STATE, HEADER_KEY, HEADER_AGE]
        .iter()
        .any(|header| name.eq_ignore_ascii_case(header))
}

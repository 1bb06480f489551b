//! Cache key derivation.
//!
//! A key is `scheme|host|path|query_hash|vary_hash`: the scheme and host are
//! lowercased, the path is kept verbatim, and the two trailing components are
//! SHA-256 digests over canonical JSON objects so that parameter order never
//! changes the key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::{Url, form_urlencoded};

use super::config::CachePolicy;
use super::request::{RequestContext, Session};

pub type VaryHook = Arc<dyn Fn(&mut BTreeMap<String, String>) + Send + Sync>;
pub type KeyPartsHook = Arc<dyn Fn(&mut Vec<String>) + Send + Sync>;

/// Hex SHA-256 of a string. Used for entry, tag and URI record names.
pub fn hash_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Request attributes that may split one URL into several entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaryContext {
    pub mobile: bool,
    pub session: Option<Session>,
    pub locale: Option<String>,
    pub cookies: BTreeMap<String, String>,
}

impl VaryContext {
    pub fn from_request(ctx: &RequestContext) -> Self {
        Self {
            mobile: ctx.is_mobile(),
            session: ctx.session.clone(),
            locale: ctx.locale.clone(),
            cookies: ctx.cookies.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct KeyRules {
    exclude_query_args: Vec<String>,
    vary_device: bool,
    vary_role: bool,
    vary_language: bool,
    private_sessions: bool,
    cookie_allowlist: Vec<String>,
}

/// Builds deterministic cache keys from request components and vary rules.
#[derive(Clone, Default)]
pub struct KeyBuilder {
    rules: KeyRules,
    vary_hooks: Vec<VaryHook>,
    key_hooks: Vec<KeyPartsHook>,
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("rules", &self.rules)
            .field("vary_hooks", &self.vary_hooks.len())
            .field("key_hooks", &self.key_hooks.len())
            .finish()
    }
}

impl KeyBuilder {
    pub fn new(policy: &CachePolicy) -> Self {
        Self {
            rules: KeyRules {
                exclude_query_args: policy.excluded_query_args(),
                vary_device: policy.vary_device,
                vary_role: policy.vary_role,
                vary_language: policy.vary_language,
                private_sessions: policy.serves_private_cache(),
                cookie_allowlist: policy.vary_cookie_allowlist.clone(),
            },
            vary_hooks: Vec::new(),
            key_hooks: Vec::new(),
        }
    }

    /// Register a callback that may adjust the vary mapping before hashing.
    pub fn with_vary_hook(
        mut self,
        hook: impl Fn(&mut BTreeMap<String, String>) + Send + Sync + 'static,
    ) -> Self {
        self.vary_hooks.push(Arc::new(hook));
        self
    }

    /// Register a callback that may adjust the key components before joining.
    pub fn with_key_parts_hook(
        mut self,
        hook: impl Fn(&mut Vec<String>) + Send + Sync + 'static,
    ) -> Self {
        self.key_hooks.push(Arc::new(hook));
        self
    }

    /// Build the key for an inbound request.
    pub fn build_for_request(&self, ctx: &RequestContext) -> String {
        self.build(
            &ctx.scheme,
            &ctx.host,
            &ctx.path,
            &ctx.query,
            &VaryContext::from_request(ctx),
        )
    }

    /// Build the key for an absolute URL.
    ///
    /// Missing components default to `http`, `localhost` and `/`.
    pub fn build_from_url(&self, url: &str, vary: &VaryContext) -> String {
        let parsed = Url::parse(url).ok();
        let scheme = parsed.as_ref().map(Url::scheme).unwrap_or("http");
        let host = parsed
            .as_ref()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| "localhost".to_string());
        let path = parsed.as_ref().map(Url::path).unwrap_or("/");
        let query = parsed.as_ref().and_then(Url::query).unwrap_or("");

        self.build(scheme, &host, path, query, vary)
    }

    pub fn build(
        &self,
        scheme: &str,
        host: &str,
        path: &str,
        raw_query: &str,
        vary: &VaryContext,
    ) -> String {
        let query_hash = hash_map(&self.filter_query(raw_query));

        let mut vary_parts = self.vary_parts(vary);
        for hook in &self.vary_hooks {
            hook(&mut vary_parts);
        }
        let vary_hash = hash_map(&vary_parts);

        let mut parts = vec![
            scheme.to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            path_component(path).to_string(),
            query_hash,
            vary_hash,
        ];
        for hook in &self.key_hooks {
            hook(&mut parts);
        }

        parts.join("|")
    }

    /// Parse the query string, dropping tracking and excluded parameters.
    ///
    /// Names are lowercased; a repeated name keeps its last value.
    fn filter_query(&self, raw_query: &str) -> BTreeMap<String, String> {
        let raw_query = raw_query.trim_start_matches('?');
        form_urlencoded::parse(raw_query.as_bytes())
            .filter_map(|(name, value)| {
                let lower = name.to_lowercase();
                if lower.starts_with("utm_") || self.rules.exclude_query_args.contains(&lower) {
                    return None;
                }
                Some((lower, value.into_owned()))
            })
            .collect()
    }

    fn vary_parts(&self, vary: &VaryContext) -> BTreeMap<String, String> {
        let mut parts = BTreeMap::new();

        if self.rules.vary_device {
            let device = if vary.mobile { "mobile" } else { "desktop" };
            parts.insert("device".to_string(), device.to_string());
        }

        if let Some(session) = &vary.session {
            if self.rules.private_sessions {
                parts.insert("user".to_string(), session.user_id.to_string());
            }
            if self.rules.vary_role {
                parts.insert("role".to_string(), session.roles.join(","));
            }
        }

        if self.rules.vary_language
            && let Some(locale) = &vary.locale
        {
            parts.insert("lang".to_string(), locale.clone());
        }

        for cookie in &self.rules.cookie_allowlist {
            if let Some(value) = vary.cookies.get(cookie) {
                parts.insert(format!("cookie_{cookie}"), value.clone());
            }
        }

        parts
    }
}

/// Strip any query or fragment that leaked into a path.
fn path_component(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or("");
    if path.is_empty() { "/" } else { path }
}

fn hash_map(map: &BTreeMap<String, String>) -> String {
    // BTreeMap serializes in key order, so the JSON form is canonical.
    let canonical = serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string());
    hash_key(&canonical)
}

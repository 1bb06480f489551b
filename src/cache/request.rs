//! Request model shared by the controller, the key builder and the edge reader.
//!
//! Nothing in the cache core reads ambient process state: everything a
//! decision needs about the inbound request is carried by [`RequestContext`].

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use url::{Url, form_urlencoded};

static MOBILE_AGENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(mobile|iphone|android|windows phone)").ok());

/// Authenticated session attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub user_id: u64,
    pub roles: Vec<String>,
}

impl Session {
    pub fn new(user_id: u64, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            user_id,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// Request-level markers supplied by the host application.
///
/// These describe contexts the cache must never participate in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub admin: bool,
    pub preview: bool,
    pub embed: bool,
    pub trackback: bool,
    pub ajax: bool,
    pub cron: bool,
    pub customizer: bool,
    /// JSON/API request.
    pub api: bool,
    /// Explicit "do not cache this page" directive.
    pub no_cache: bool,
    /// The resolved view is a feed.
    pub feed: bool,
}

impl RequestFlags {
    /// True when any of the always-excluded contexts is set.
    pub fn is_special_context(&self) -> bool {
        self.admin
            || self.preview
            || self.embed
            || self.trackback
            || self.ajax
            || self.cron
            || self.customizer
    }
}

/// Everything the cache core needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
    /// Header names are stored lowercased.
    pub headers: Vec<(String, String)>,
    pub cookies: BTreeMap<String, String>,
    pub session: Option<Session>,
    pub locale: Option<String>,
    pub flags: RequestFlags,
    /// The request carries a form body (edge path refuses these).
    pub has_form_body: bool,
}

impl RequestContext {
    /// Build a context from a method and an absolute URL.
    ///
    /// Unparsable URLs fall back to `http://localhost/`.
    pub fn new(method: impl Into<String>, url: &str) -> Self {
        let parsed = Url::parse(url).ok();
        let scheme = parsed
            .as_ref()
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|| "http".to_string());
        let host = parsed
            .as_ref()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| "localhost".to_string());
        let path = parsed
            .as_ref()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "/".to_string());
        let query = parsed
            .as_ref()
            .and_then(|u| u.query().map(str::to_string))
            .unwrap_or_default();

        Self::from_parts(method, scheme, host, path, query)
    }

    pub fn from_parts(
        method: impl Into<String>,
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
            query: query.into(),
            headers: Vec::new(),
            cookies: BTreeMap::new(),
            session: None,
            locale: None,
            flags: RequestFlags::default(),
            has_form_body: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent").filter(|ua| !ua.is_empty())
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_read_method(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Path plus query string, as the client requested it.
    pub fn request_uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Absolute URL of the request, used as the URI index subject.
    ///
    /// Scheme and host are case-insensitive and always rendered lowercase.
    pub fn absolute_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.to_ascii_lowercase(),
            self.host.to_ascii_lowercase(),
            self.request_uri()
        )
    }

    /// Decoded query parameter names, in request order.
    pub fn query_names(&self) -> impl Iterator<Item = String> + '_ {
        form_urlencoded::parse(self.query.as_bytes()).map(|(name, _)| name.into_owned())
    }

    /// Device class derived from the user agent.
    pub fn is_mobile(&self) -> bool {
        self.user_agent().is_some_and(is_mobile_user_agent)
    }
}

pub fn is_mobile_user_agent(user_agent: &str) -> bool {
    MOBILE_AGENT
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(user_agent))
}

/// Parse a `Cookie` header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_url_components() {
        let ctx = RequestContext::new("GET", "https://Example.com:8443/blog/post?b=2&a=1");
        assert_eq!(ctx.scheme, "https");
        assert_eq!(ctx.host, "example.com:8443");
        assert_eq!(ctx.path, "/blog/post");
        assert_eq!(ctx.query, "b=2&a=1");
        assert_eq!(ctx.absolute_url(), "https://example.com:8443/blog/post?b=2&a=1");
    }

    #[test]
    fn absolute_url_lowercases_scheme_and_host_only() {
        let ctx = RequestContext::from_parts("GET", "HTTP", "Example.COM:8080", "/Blog/Post", "Q=A");
        assert_eq!(ctx.absolute_url(), "http://example.com:8080/Blog/Post?Q=A");
    }

    #[test]
    fn unparsable_url_falls_back_to_localhost() {
        let ctx = RequestContext::new("GET", "not a url");
        assert_eq!(ctx.host, "localhost");
        assert_eq!(ctx.path, "/");
        assert!(ctx.query.is_empty());
    }

    #[test]
    fn detects_mobile_agents() {
        assert!(is_mobile_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)"));
        assert!(is_mobile_user_agent("Dalvik/2.1.0 (Linux; U; Android 14)"));
        assert!(!is_mobile_user_agent("Mozilla/5.0 (X11; Linux x86_64)"));
    }

    #[test]
    fn cookie_header_parsing_skips_malformed_pairs() {
        let cookies = parse_cookie_header("a=1; broken; b = two ;=x");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
        assert_eq!(cookies.get("b").map(String::as_str), Some("two"));
    }

    #[test]
    fn read_methods_are_case_insensitive() {
        assert!(RequestContext::new("head", "http://x/").is_read_method());
        assert!(!RequestContext::new("POST", "http://x/").is_read_method());
    }
}

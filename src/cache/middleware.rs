//! Page cache middleware.
//!
//! Wraps an axum router with the request controller: fresh entries are served
//! without running the handler, everything else is rendered, buffered and
//! handed back to the controller for capture. Storage work runs on the
//! blocking pool since backends do synchronous I/O.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE, TRANSFER_ENCODING},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::controller::{CapturedResponse, Diagnostics, HitResponse, Lookup, RequestController};
use super::request::{RequestContext, RequestFlags, Session, parse_cookie_header};
use super::tags::QueryContext;

pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared cache state for the middleware.
#[derive(Clone)]
pub struct PageCacheState {
    pub controller: Arc<RequestController>,
    /// Responses larger than this are passed through uncaptured.
    pub max_body_bytes: usize,
}

impl PageCacheState {
    pub fn new(controller: Arc<RequestController>) -> Self {
        Self {
            controller,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Response extension describing the rendered view, used for TTL selection
/// and tagging. Responses without one are treated as plain pages.
#[derive(Debug, Clone, Default)]
pub struct ViewMarker(pub QueryContext);

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = request_context(&request, &cache.controller.policy().language_cookie);

    let controller = Arc::clone(&cache.controller);
    let lookup_ctx = ctx.clone();
    let lookup = match tokio::task::spawn_blocking(move || controller.lookup(&lookup_ctx)).await {
        Ok(lookup) => lookup,
        Err(err) => {
            warn!(error = %err, "Cache lookup task failed; serving uncached");
            return next.run(request).await;
        }
    };

    match lookup {
        Lookup::Hit(hit) => {
            let response = hit_response(&hit);
            cache.controller.complete_hit(&hit);
            response
        }
        Lookup::Bypass(diagnostics) => {
            let mut response = next.run(request).await;
            apply_diagnostics(response.headers_mut(), &diagnostics);
            response
        }
        Lookup::Render(capture) => {
            let response = next.run(request).await;
            let view = response
                .extensions()
                .get::<ViewMarker>()
                .map(|marker| marker.0.clone())
                .unwrap_or_default();

            if let Some(reason) = unstorable_reason(response.headers()) {
                debug!(reason, "Response not captured");
                let mut response = response;
                apply_diagnostics(response.headers_mut(), &capture.diagnostics);
                return response;
            }

            let (parts, body) = response.into_parts();
            let bytes = match buffer_body(body, cache.max_body_bytes).await {
                Ok(Buffered::Complete(bytes)) => bytes,
                Ok(Buffered::Oversized(body)) => {
                    debug!(limit = cache.max_body_bytes, "Response too large to capture");
                    let mut response = Response::from_parts(parts, body);
                    apply_diagnostics(response.headers_mut(), &capture.diagnostics);
                    return response;
                }
                Err(err) => {
                    warn!(error = %err, "Failed to buffer response body");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };

            let captured = CapturedResponse {
                status: parts.status.as_u16(),
                headers: header_pairs(&parts.headers),
                body: bytes.clone(),
            };
            let fallback = capture.diagnostics.clone();
            let controller = Arc::clone(&cache.controller);
            let diagnostics = match tokio::task::spawn_blocking(move || {
                controller.finish(&capture, &ctx, &captured, &view)
            })
            .await
            {
                Ok(outcome) => outcome.diagnostics,
                Err(err) => {
                    warn!(error = %err, "Cache capture task failed");
                    fallback
                }
            };

            let mut response = Response::from_parts(parts, Body::from(bytes));
            apply_diagnostics(response.headers_mut(), &diagnostics);
            response
        }
    }
}

enum Buffered {
    Complete(Bytes),
    /// The limit was crossed; the body replays what was already read and then
    /// streams the rest.
    Oversized(Body),
}

/// Buffer a rendered body for capture without ever losing it.
async fn buffer_body(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let declared = HttpBody::size_hint(&body);
    if declared.lower() > limit as u64 {
        return Ok(Buffered::Oversized(body));
    }

    let mut body = body;
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffer.extend_from_slice(&data);
        if buffer.len() > limit {
            let head = buffer.freeze();
            let replay = stream::once(async move { Ok::<_, axum::Error>(head) })
                .chain(body.into_data_stream());
            return Ok(Buffered::Oversized(Body::from_stream(replay)));
        }
    }
    Ok(Buffered::Complete(buffer.freeze()))
}

/// Build the controller's view of an inbound request.
///
/// The scheme honours `x-forwarded-proto`; flags and sessions come from
/// request extensions set by earlier layers.
pub fn request_context(request: &Request<Body>, language_cookie: &str) -> RequestContext {
    let headers = request.headers();
    let uri = request.uri();

    let scheme = header_str(headers, "x-forwarded-proto")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or(uri.scheme_str())
        .unwrap_or("http")
        .to_string();
    let host = header_str(headers, HOST.as_str())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    let mut ctx = RequestContext::from_parts(
        request.method().as_str(),
        scheme,
        host,
        uri.path(),
        uri.query().unwrap_or(""),
    );
    ctx.headers = header_pairs(headers);
    for value in headers.get_all(COOKIE) {
        if let Ok(value) = value.to_str() {
            ctx.cookies.extend(parse_cookie_header(value));
        }
    }
    ctx.locale = ctx.cookies.get(language_cookie).cloned();
    ctx.has_form_body = header_str(headers, CONTENT_TYPE.as_str()).is_some_and(|value| {
        value.starts_with("application/x-www-form-urlencoded") || value.starts_with("multipart/form-data")
    });

    if let Some(flags) = request.extensions().get::<RequestFlags>() {
        ctx.flags = *flags;
    }
    if let Some(session) = request.extensions().get::<Session>() {
        ctx.session = Some(session.clone());
    }
    ctx
}

fn unstorable_reason(headers: &HeaderMap) -> Option<&'static str> {
    if headers.contains_key(SET_COOKIE) {
        return Some("set_cookie");
    }
    if header_str(headers, CONTENT_TYPE.as_str()).is_some_and(|value| value.starts_with("text/event-stream")) {
        return Some("event_stream");
    }
    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn apply_diagnostics(headers: &mut HeaderMap, diagnostics: &Diagnostics) {
    for (name, value) in diagnostics.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Build a response from a stored entry.
fn hit_response(hit: &HitResponse) -> Response {
    let entry = &hit.entry;
    let mut builder = Response::builder().status(entry.status());

    for (name, value) in entry.headers() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if [CONTENT_LENGTH, SET_COOKIE, TRANSFER_ENCODING, CONNECTION].contains(&name) {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(name, value);
        }
    }

    match builder.body(Body::from(entry.body.clone())) {
        Ok(mut response) => {
            apply_diagnostics(response.headers_mut(), &hit.diagnostics);
            response
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

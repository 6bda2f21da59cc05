//! HTTP ingress: router and the per-request proxy flow
//!
//! Every method on `/` and `/{max_age}` goes through the same steps:
//! read the destination header, resolve and check it against the access
//! policy, build a [`Request`] from the inbound call, hand it to the
//! [`RequestHandler`] and write the answer back.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderName, header},
    response::IntoResponse,
    routing::any,
};
use bytes::Bytes;
use http_body::Frame;
use http_body_util::StreamBody;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use url::Url;

use crate::config::HttpConfig;
use crate::handler::{Handled, RequestHandler};
use crate::message::{Headers, Request, Response};
use crate::security::{AccessDecision, AccessPolicy, sanitize};
use crate::timing::{BACKEND, TOTAL, Timings};
use crate::transport::Resolver;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Cache-aside pipeline
    pub handler: RequestHandler,
    /// Access policy checked before anything is forwarded
    pub policy: Arc<AccessPolicy>,
    /// Resolves destination hosts for the access check
    pub resolver: Arc<dyn Resolver>,
    /// Header carrying the destination URL
    pub destination_header: HeaderName,
    /// Lowercased names of headers never emitted
    pub removed_headers: HashSet<String>,
    /// Maximum inbound body size (bytes)
    pub max_body_size: usize,
}

impl AppState {
    /// Build state from HTTP configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the destination header is not a valid
    /// header name.
    pub fn new(
        handler: RequestHandler,
        policy: Arc<AccessPolicy>,
        resolver: Arc<dyn Resolver>,
        config: &HttpConfig,
        max_body_size: usize,
    ) -> Result<Self> {
        let destination_header = HeaderName::from_bytes(config.destination_header.as_bytes())
            .map_err(|e| {
                Error::Config(format!(
                    "invalid destination header '{}': {e}",
                    config.destination_header
                ))
            })?;
        Ok(Self {
            handler,
            policy,
            resolver,
            destination_header,
            removed_headers: config
                .removed_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            max_body_size,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(proxy_handler))
        .route("/{max_age}", any(proxy_with_max_age_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    proxy(&state, None, request).await
}

async fn proxy_with_max_age_handler(
    State(state): State<Arc<AppState>>,
    Path(max_age): Path<String>,
    request: axum::extract::Request,
) -> axum::response::Response {
    proxy(&state, Some(&max_age), request).await
}

async fn proxy(
    state: &AppState,
    max_age: Option<&str>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let mut timings = Timings::new();
    timings.start(TOTAL);

    match serve(state, max_age, request, &mut timings).await {
        Ok((handled, destination)) => {
            timings.stop(TOTAL);
            info!(
                cached = handled.cached,
                elapsed_ms = timings.elapsed_ms(TOTAL),
                backend_ms = timings.elapsed_ms(BACKEND),
                destination = %destination,
                "Handled {} request",
                if handled.cached { "cached" } else { "non-cached" }
            );
            emit(handled.response, &state.removed_headers)
        }
        Err(e) => error_response(&e),
    }
}

async fn serve(
    state: &AppState,
    max_age: Option<&str>,
    request: axum::extract::Request,
    timings: &mut Timings,
) -> Result<(Handled, Url)> {
    let max_age = max_age.map(parse_max_age).transpose()?;
    let source = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let (parts, body) = request.into_parts();

    let destination = destination(&parts.headers, &state.destination_header)?;
    let host = destination
        .host_str()
        .ok_or_else(|| {
            Error::MalformedRequest(format!("destination '{destination}' has no host"))
        })?;
    let port = destination.port_or_known_default().unwrap_or(80);

    let host_ips = state.resolver.resolve(host, port).await?;
    if let AccessDecision::Deny(reason) = state.policy.validate(source, &host_ips, host) {
        return Err(Error::AccessDenied(reason.to_string()));
    }

    let body = axum::body::to_bytes(body, state.max_body_size)
        .await
        .map_err(|e| Error::MalformedRequest(format!("failed to read request body: {e}")))?;

    let forward = build_request(
        parts.method.as_str(),
        &destination,
        &parts.headers,
        body,
        state.destination_header.as_str(),
    );
    let handled = state.handler.handle(&forward, timings, max_age).await?;
    Ok((handled, destination))
}

/// Parse the max-age route segment: bare seconds or a humantime duration
pub(crate) fn parse_max_age(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw)
        .map_err(|e| Error::MalformedRequest(format!("invalid max age '{raw}': {e}")))
}

/// Extract the single destination URL from `headers`
pub(crate) fn destination(headers: &HeaderMap, name: &HeaderName) -> Result<Url> {
    let mut values = headers.get_all(name).iter();
    let (Some(value), None) = (values.next(), values.next()) else {
        return Err(Error::MalformedRequest(format!(
            "expected exactly one '{name}' header, found {}",
            headers.get_all(name).iter().count()
        )));
    };
    let raw = value
        .to_str()
        .map_err(|_| Error::MalformedRequest(format!("'{name}' header is not valid text")))?;
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::MalformedRequest(format!("invalid destination '{raw}': {e}")))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(Error::MalformedRequest(format!(
            "destination '{raw}' is not an absolute URL"
        )));
    }
    Ok(url)
}

/// Build the forward request from the inbound call.
///
/// The body is kept when it is non-empty or announced by a `Content-Type`,
/// so an empty POST with a content type still forwards an (empty) body.
pub(crate) fn build_request(
    method: &str,
    destination: &Url,
    headers: &HeaderMap,
    body: Bytes,
    destination_header: &str,
) -> Request {
    let (general, content) = Headers::partition(headers);
    let has_body = !body.is_empty() || headers.contains_key(header::CONTENT_TYPE);

    let mut request = Request::new(method, destination.as_str());
    request.headers = general;
    request.content_headers = (!content.is_empty()).then_some(content);
    request.content = has_body.then_some(body);
    request.strip_routing_headers(destination_header);
    request
}

fn emitted_headers<'a>(
    headers: impl Iterator<Item = (&'a str, &'a [String])>,
    removed: &HashSet<String>,
) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        if removed.contains(&name.to_ascii_lowercase()) {
            continue;
        }
        let Some(header_name) = sanitize::header_name(name) else {
            continue;
        };
        for value in values {
            map.append(header_name.clone(), sanitize::header_value(value));
        }
    }
    map
}

/// Turn a stored or fresh response into the HTTP answer
pub(crate) fn emit(response: Response, removed: &HashSet<String>) -> axum::response::Response {
    let content_headers = response.content_headers.iter().flat_map(Headers::iter);
    let mut headers = emitted_headers(response.headers.iter().chain(content_headers), removed);
    let trailers = emitted_headers(response.trailing_headers.iter(), removed);

    let body = if trailers.is_empty() {
        Body::from(response.content)
    } else {
        // Trailers need chunked framing
        headers.remove(header::CONTENT_LENGTH);
        let frames = [
            Ok::<_, Infallible>(Frame::data(response.content)),
            Ok(Frame::trailers(trailers)),
        ];
        Body::new(StreamBody::new(futures::stream::iter(frames)))
    };

    let mut out = axum::response::Response::new(body);
    *out.status_mut() = response.status_code;
    *out.headers_mut() = headers;
    out
}

fn error_response(error: &Error) -> axum::response::Response {
    let status = error.status_code();
    match error {
        // Already reported by the access policy
        Error::AccessDenied(_) => return status.into_response(),
        e if e.is_malformed() => warn!(error = %e, "Rejected malformed request"),
        e => error!(error = %e, "Request failed"),
    }
    (status, error.to_string()).into_response()
}

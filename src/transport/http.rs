//! Forwarder over a pooled `reqwest` client
//!
//! The client is built once and shared by every ingress task. It injects
//! nothing the caller did not ask for: no automatic decompression, no
//! redirect following, no default headers. Bodies are buffered in full in
//! both directions so the response can be cached and returned.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use super::Forwarder;
use crate::message::{Headers, Request, Response};
use crate::{Error, Result};

/// Framing headers recomputed from the buffered body
const FRAMING_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding"];

/// Forwarder issuing real HTTP calls
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    /// Create a forwarder whose calls time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            // A redirect would reach a destination the access check never saw
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn outbound_headers(request: &Request) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        let content_headers = request
            .content
            .as_ref()
            .and(request.content_headers.as_ref())
            .into_iter()
            .flat_map(Headers::iter);

        for (name, values) in request.headers.iter().chain(content_headers) {
            if FRAMING_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                continue;
            }
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::MalformedRequest(format!("invalid header name '{name}'")))?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(|_| {
                    Error::MalformedRequest(format!("invalid value for header '{name}'"))
                })?;
                map.append(header.clone(), value);
            }
        }
        Ok(map)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &Request) -> Result<Response> {
        let url = request.target()?;
        let method = request.http_method()?;
        let headers = Self::outbound_headers(request)?;

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(ref body) = request.content {
            builder = builder.body(body.clone());
        }

        let upstream = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Forwarding failed");
            Error::Upstream(format!("request to {url} failed: {e}"))
        })?;

        let status = upstream.status();
        let (parts, body) = ::http::Response::from(upstream).into_parts();
        let collected = body
            .collect()
            .await
            .map_err(|e| Error::Upstream(format!("reading response from {url} failed: {e}")))?;

        let trailing_headers = collected
            .trailers()
            .map(Headers::from_http)
            .unwrap_or_default();
        let content = collected.to_bytes();
        let (headers, content_headers) = Headers::partition(&parts.headers);

        debug!(
            url = %url,
            status = status.as_u16(),
            bytes = content.len(),
            trailers = trailing_headers.len(),
            "Origin answered"
        );

        Ok(Response {
            status_code: status,
            headers,
            content_headers: Some(content_headers),
            trailing_headers,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::any;
    use pretty_assertions::assert_eq;

    async fn origin() -> String {
        async fn echo(
            method: axum::http::Method,
            headers: AxumHeaders,
            body: Bytes,
        ) -> impl axum::response::IntoResponse {
            let seen = headers
                .get("x-probe")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            let accept_encoding = headers.contains_key("accept-encoding").to_string();
            (
                StatusCode::CREATED,
                [
                    ("x-seen", seen),
                    ("x-method", method.to_string()),
                    ("x-accept-encoding", accept_encoding),
                    ("content-type", "text/plain".to_string()),
                ],
                body,
            )
        }

        let app = Router::new()
            .route("/echo", any(echo))
            .route("/missing", any(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/moved",
                any(|| async { (StatusCode::FOUND, [("location", "/echo")]) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn forwarder() -> HttpForwarder {
        HttpForwarder::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let base = origin().await;
        let request = Request::new("POST", &format!("{base}/echo"))
            .with_header("X-Probe", "42")
            .with_header("Content-Type", "text/plain")
            .with_body("ping");

        let response = forwarder().forward(&request).await.unwrap();

        assert_eq!(response.status_code, StatusCode::CREATED);
        assert_eq!(response.content, Bytes::from("ping"));
        assert_eq!(response.headers.get("x-seen"), Some(&["42".to_string()][..]));
        assert_eq!(response.headers.get("x-method"), Some(&["POST".to_string()][..]));
        assert_eq!(
            response.headers.get("x-accept-encoding"),
            Some(&["false".to_string()][..])
        );
        let content_headers = response.content_headers.unwrap();
        assert_eq!(
            content_headers.get("content-type"),
            Some(&["text/plain".to_string()][..])
        );
    }

    #[tokio::test]
    async fn error_statuses_are_successful_forwards() {
        let base = origin().await;
        let response = forwarder()
            .forward(&Request::new("GET", &format!("{base}/missing")))
            .await
            .unwrap();
        assert_eq!(response.status_code, StatusCode::NOT_FOUND);
        assert_eq!(response.content, Bytes::from("nope"));
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let base = origin().await;
        let response = forwarder()
            .forward(&Request::new("GET", &format!("{base}/moved")))
            .await
            .unwrap();
        assert_eq!(response.status_code, StatusCode::FOUND);
        assert_eq!(response.headers.get("location"), Some(&["/echo".to_string()][..]));
    }

    #[tokio::test]
    async fn unreachable_origin_is_upstream_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = forwarder()
            .forward(&Request::new("GET", &format!("http://{addr}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn malformed_requests_fail_before_sending() {
        let err = forwarder()
            .forward(&Request::new("GET", "/relative"))
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }
}

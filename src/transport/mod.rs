//! Outbound transport: forwarding requests to the origin and resolving
//! destination hosts for the access check

mod http;

pub use self::http::HttpForwarder;

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::message::{Request, Response};
use crate::{Error, Result};

/// Issues a request against its origin and returns the fully buffered answer
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward `request` to its target URL.
    ///
    /// Only headers present in `request` are sent. Network failures,
    /// timeouts and unreadable responses are errors; any status the origin
    /// returns, including 4xx/5xx, is a successful forward.
    async fn forward(&self, request: &Request) -> Result<Response>;
}

/// Resolves a destination host to the addresses it would be reached on
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` (a name or an IP literal) for `port`
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let mut addrs: Vec<IpAddr> = tokio::net::lookup_host((bare, port))
            .await
            .map_err(|e| Error::Upstream(format!("could not resolve '{host}': {e}")))?
            .map(|addr| addr.ip())
            .collect();
        addrs.dedup();
        if addrs.is_empty() {
            return Err(Error::Upstream(format!("'{host}' resolved to no addresses")));
        }
        debug!(host = %host, addrs = ?addrs, "Resolved destination");
        Ok(addrs)
    }
}

//! HTTP Cache Library
//!
//! An HTTP-forwarding cache: requests arrive over HTTP or a message queue,
//! are checked against a host/IP access policy, and are answered from the
//! cache when an equivalent request was seen before. Everything else is
//! forwarded to its origin and the answer is stored for next time.
//!
//! # Features
//!
//! - **Cache-aside pipeline**: deterministic keys, pluggable stores
//!   (Redis, in-memory) with TTL expiry
//! - **Access policy**: host and CIDR black/whitelists on resolved addresses
//! - **Two ingresses**: per-call HTTP proxy and a worker pool on a message
//!   broker (Redis Streams, in-memory) with at-least-once delivery
//! - **Production Ready**: structured logging, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod ingress;
pub mod message;
pub mod queue;
pub mod security;
pub mod timing;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}

//! Cache store contract and backends
//!
//! The orchestrator only sees [`CacheStore`]. This module ships with:
//! - [`memory::MemoryStore`]: a process-local store with TTL expiry.
//! - [`redis::RedisStore`]: a networked store using native Redis expiry.
//!
//! Values are the JSON encoding of a [`Response`]; expiry is carried by the
//! backend, never inside the value. A value that fails to decode is
//! reported as a backend error, not as a miss.

pub mod key;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use key::{KeyDeriver, derive_key};
pub use memory::{MemoryStore, spawn_sweeper};
pub use self::redis::RedisStore;

use crate::config::{CacheBackendKind, CacheConfig, RedisConfig};
use crate::message::{Response, to_json};
use crate::{Error, Result};

/// Get/set contract every cache backend implements.
///
/// Implementations must be safe to share across tasks; concurrent writes
/// to the same key are last-writer-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a response. `Ok(None)` is a cache miss.
    async fn get(&self, key: &str) -> Result<Option<Response>>;

    /// Store a response unconditionally, overwriting any previous value.
    ///
    /// `ttl` wins over the store's configured default; with neither, the
    /// entry does not expire.
    async fn set(&self, key: &str, response: &Response, ttl: Option<Duration>) -> Result<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Encode a response for storage
pub(crate) fn encode_entry(response: &Response) -> Result<String> {
    to_json(response)
}

/// Decode a stored value; corruption is a backend error
pub(crate) fn decode_entry(key: &str, raw: &str) -> Result<Response> {
    serde_json::from_str(raw).map_err(|e| {
        Error::Backend(format!(
            "corrupt cache entry ({} bytes) under key of {} bytes: {e}",
            raw.len(),
            key.len()
        ))
    })
}

/// Build the store selected in configuration.
///
/// The in-memory store gets a sweeper evicting expired entries every
/// `cache.sweep_interval` until `shutdown` fires.
///
/// # Errors
///
/// Returns `Error::Config` if no Redis endpoint parses, or a backend error
/// if none of them can be reached.
pub async fn from_config(
    cache: &CacheConfig,
    redis: &RedisConfig,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match cache.backend {
        CacheBackendKind::Memory => {
            let store = Arc::new(MemoryStore::new(cache.default_ttl));
            spawn_sweeper(&store, cache.sweep_interval, shutdown.child_token());
            store
        }
        CacheBackendKind::Redis => {
            Arc::new(RedisStore::connect(&redis.endpoints, cache.default_ttl).await?)
        }
    };
    info!(
        backend = store.name(),
        default_ttl = ?cache.default_ttl,
        "Cache store ready"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn decode_corrupt_entry_is_backend_error() {
        let err = decode_entry("k", "{not json").unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn encode_decode_entry() {
        let response = Response::new(StatusCode::ACCEPTED).with_body("queued");
        let raw = encode_entry(&response).unwrap();
        assert_eq!(decode_entry("k", &raw).unwrap(), response);
    }

    #[tokio::test]
    async fn memory_backend_from_config() {
        let config = CacheConfig {
            backend: CacheBackendKind::Memory,
            ..CacheConfig::default()
        };
        let shutdown = CancellationToken::new();
        let store = from_config(&config, &RedisConfig::default(), &shutdown)
            .await
            .unwrap();
        assert_eq!(store.name(), "memory");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn redis_backend_without_endpoints_fails() {
        let config = CacheConfig::default();
        let err = from_config(&config, &RedisConfig::default(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}

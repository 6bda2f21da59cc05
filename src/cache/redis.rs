//! Redis-backed cache store
//!
//! Values are stored as plain strings with native key expiry (`PSETEX`).
//! The connection is a [`ConnectionManager`], which reconnects on its own
//! after transient failures; a failed command surfaces as a backend error.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::{CacheStore, decode_entry, encode_entry};
use crate::message::Response;
use crate::{Error, Result};

/// Cache store on a Redis server
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    default_ttl: Option<Duration>,
}

impl RedisStore {
    /// Connect to the first reachable endpoint.
    ///
    /// Endpoints are `host:port` or full `redis://` / `rediss://` URLs.
    /// Entries that do not parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no endpoint parses, or the last connection
    /// error if none can be reached.
    pub async fn connect(endpoints: &[String], default_ttl: Option<Duration>) -> Result<Self> {
        let clients = parse_endpoints(endpoints);
        if clients.is_empty() {
            return Err(Error::Config(
                "redis backend selected but no valid endpoint is configured".to_string(),
            ));
        }

        let mut last_error = None;
        for (endpoint, client) in clients {
            match client.get_connection_manager().await {
                Ok(connection) => {
                    info!(endpoint = %endpoint, "Connected to Redis");
                    return Ok(Self {
                        connection,
                        default_ttl,
                    });
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Redis endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or_else(
            || Error::Backend("no redis endpoint reachable".to_string()),
            Error::from,
        ))
    }
}

/// Normalize an endpoint into a connection URL
pub(crate) fn endpoint_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("redis://{endpoint}")
    }
}

fn parse_endpoints(endpoints: &[String]) -> Vec<(String, redis::Client)> {
    endpoints
        .iter()
        .filter(|e| !e.trim().is_empty())
        .filter_map(|endpoint| {
            let url = endpoint_url(endpoint);
            match redis::Client::open(url.as_str()) {
                Ok(client) => Some((url, client)),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Skipping invalid Redis endpoint");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Response>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| decode_entry(key, &raw)).transpose()
    }

    async fn set(&self, key: &str, response: &Response, ttl: Option<Duration>) -> Result<()> {
        let raw = encode_entry(response)?;
        let mut conn = self.connection.clone();
        match ttl.or(self.default_ttl) {
            Some(ttl) => {
                // PSETEX rejects zero; round up to the smallest expiry
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                debug!(ttl_ms = millis, "Storing entry in Redis");
                let () = conn.pset_ex(key, raw, millis).await?;
            }
            None => {
                let () = conn.set(key, raw).await?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

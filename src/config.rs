//! Configuration management

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::security::{AccessConfig, AccessPolicy};
use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "HTTP_CACHE_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// HTTP ingress and forwarding
    pub http: HttpConfig,
    /// Cache store and key derivation
    pub cache: CacheConfig,
    /// Redis connection
    pub redis: RedisConfig,
    /// Queue ingress
    pub queue: QueueConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long shutdown waits for in-flight queue workers
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum inbound request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the host is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host '{}': {e}", self.host)))?;
        Ok(SocketAddr::new(host, self.port))
    }
}

/// HTTP ingress and forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Header carrying the absolute destination URL
    pub destination_header: String,
    /// Response headers never emitted (case-insensitive)
    pub removed_headers: Vec<String>,
    /// Timeout for one forwarded call
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Duration,
    /// Host/IP access policy
    pub access: AccessConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            destination_header: "Actual-Host".to_string(),
            removed_headers: vec!["Transfer-Encoding".to_string()],
            forward_timeout: Duration::from_secs(30),
            access: AccessConfig::default(),
        }
    }
}

/// Which cache store to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Redis server(s) from `redis.endpoints`
    #[default]
    Redis,
    /// In-process map; nothing survives a restart
    Memory,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store backend
    pub backend: CacheBackendKind,
    /// TTL for writes without a max-age; absent means no expiry
    #[serde(with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
    /// Header names left out of cache keys (exact match)
    pub ignored_headers: Vec<String>,
    /// Namespace prepended to every key as `prefix:`
    pub key_prefix: Option<String>,
    /// Store SHA-256 digests of keys instead of the keys themselves
    pub hash_keys: bool,
    /// How often the in-memory store drops expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            default_ttl: None,
            ignored_headers: vec!["traceparent".to_string()],
            key_prefix: None,
            hash_keys: false,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` or `redis://` URLs; the first reachable one is used
    pub endpoints: Vec<String>,
}

/// Queue ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Run the queue workers
    pub enabled: bool,
    /// Broker URL (`redis://...`, or `memory://` for an in-process broker)
    pub url: String,
    /// Topic carrying requests
    pub input_topic: String,
    /// Topic receiving responses
    pub output_topic: String,
    /// Shared subscription name
    pub subscription: String,
    /// Number of workers
    pub concurrency: usize,
    /// Delay before a message that failed upstream or in the cache store
    /// is delivered again
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            input_topic: "http-cache-input".to_string(),
            output_topic: "http-cache-output".to_string(),
            subscription: "httpcache".to_string(),
            concurrency: 1,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check everything that would otherwise fail later at startup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.server.bind_addr()?;
        AccessPolicy::from_config(&self.http.access)?;

        if self.http.destination_header.trim().is_empty() {
            return Err(Error::Config("http.destination_header must not be empty".to_string()));
        }
        if self.cache.backend == CacheBackendKind::Redis
            && self.redis.endpoints.iter().all(|e| e.trim().is_empty())
        {
            return Err(Error::Config(
                "cache.backend is redis but redis.endpoints is empty".to_string(),
            ));
        }
        if self.queue.enabled && self.queue.concurrency == 0 {
            return Err(Error::Config("queue.concurrency must be at least 1".to_string()));
        }
        if self.cache.backend == CacheBackendKind::Memory && self.cache.sweep_interval.is_zero() {
            return Err(Error::Config("cache.sweep_interval must not be zero".to_string()));
        }
        Ok(())
    }
}

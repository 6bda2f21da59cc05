//! Cache server: wires the pipeline to both ingresses

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::http::{AppState, create_router};
use super::queue::QueueIngress;
use crate::cache::{self, KeyDeriver};
use crate::config::{Config, QueueConfig};
use crate::handler::RequestHandler;
use crate::queue::{MemoryBroker, MessageBroker, RedisBroker};
use crate::security::AccessPolicy;
use crate::transport::{HttpForwarder, SystemResolver};
use crate::{Error, Result};

/// Broker URL scheme selecting the in-process broker
const MEMORY_BROKER_SCHEME: &str = "memory://";

/// HTTP cache server
pub struct CacheServer {
    /// Configuration
    config: Config,
    /// Fires on shutdown; workers hold child tokens
    shutdown: CancellationToken,
}

impl CacheServer {
    /// Create a new server
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that shuts the server down when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until SIGINT/SIGTERM or the shutdown token fires
    ///
    /// # Errors
    ///
    /// Returns startup failures (bad bind address, unreachable cache or
    /// broker) and server I/O errors.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;
        let addr = config.server.bind_addr()?;

        let store = cache::from_config(&config.cache, &config.redis, &self.shutdown).await?;
        let forwarder = Arc::new(HttpForwarder::new(config.http.forward_timeout)?);
        let handler = RequestHandler::new(store, forwarder, KeyDeriver::from_config(&config.cache));
        let policy = Arc::new(AccessPolicy::from_config(&config.http.access)?);

        let state = Arc::new(AppState::new(
            handler.clone(),
            policy,
            Arc::new(SystemResolver),
            &config.http,
            config.server.max_body_size,
        )?);
        let app = create_router(state);

        let queue = if config.queue.enabled {
            let broker = connect_broker(&config.queue).await?;
            let ingress = QueueIngress::new(
                broker,
                handler,
                config.queue.clone(),
                self.shutdown.child_token(),
            )
            .with_destination_header(config.http.destination_header.clone());
            ingress.start().await?;
            Some(ingress)
        } else {
            info!("Queue ingress disabled");
            None
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown.cancel();
                return Err(e.into());
            }
        };
        info!(addr = %addr, "HTTP ingress listening");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(self.shutdown.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(queue) = queue {
            info!("Stopping queue workers...");
            if let Err(e) = queue.stop(config.server.shutdown_timeout).await {
                warn!(error = %e, "Queue workers abandoned at shutdown");
            }
        }

        Ok(())
    }
}

/// Open the broker named by the queue URL
async fn connect_broker(config: &QueueConfig) -> Result<Arc<dyn MessageBroker>> {
    if config.url.starts_with(MEMORY_BROKER_SCHEME) {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    Ok(Arc::new(RedisBroker::connect(&config.url).await?))
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackendKind;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_broker_url() {
        let config = QueueConfig {
            url: "memory://local".to_string(),
            ..QueueConfig::default()
        };
        assert_eq!(connect_broker(&config).await.unwrap().name(), "memory");
    }

    #[tokio::test]
    async fn runs_until_shutdown_token_fires() {
        let mut config = Config::default();
        config.cache.backend = CacheBackendKind::Memory;
        config.server.port = 0;
        config.queue.enabled = true;
        config.queue.url = "memory://".to_string();
        config.queue.concurrency = 2;

        let server = CacheServer::new(config);
        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

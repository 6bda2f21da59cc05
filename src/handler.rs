//! Cache-aside orchestration
//!
//! [`RequestHandler`] is the one entry point both ingress adapters call:
//! derive the key, look it up, forward on a miss and store the fresh answer.
//!
//! The lookup and the store are two separate backend calls. Two concurrent
//! misses for the same key both forward and both write; the later write
//! wins.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::cache::{CacheStore, KeyDeriver};
use crate::message::{Request, Response};
use crate::timing::{BACKEND, Timings};
use crate::transport::Forwarder;

/// Outcome of handling one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    /// The answer to return to the caller
    pub response: Response,
    /// Whether it was served from the cache
    pub cached: bool,
}

/// Composes key derivation, cache store and forwarder
#[derive(Clone)]
pub struct RequestHandler {
    store: Arc<dyn CacheStore>,
    forwarder: Arc<dyn Forwarder>,
    keys: KeyDeriver,
}

impl RequestHandler {
    /// Create a handler
    pub fn new(
        store: Arc<dyn CacheStore>,
        forwarder: Arc<dyn Forwarder>,
        keys: KeyDeriver,
    ) -> Self {
        Self {
            store,
            forwarder,
            keys,
        }
    }

    /// Serve `request` from the cache, or forward it and cache the answer.
    ///
    /// Time spent in the cache store accumulates under [`BACKEND`] in
    /// `timings`. `max_age` overrides the store's default TTL for the write.
    ///
    /// # Errors
    ///
    /// - `MalformedRequest` if no key can be derived.
    /// - Backend errors from the lookup, including corrupt entries.
    /// - Upstream errors from the forward.
    ///
    /// A failing write is logged and does not fail the call.
    pub async fn handle(
        &self,
        request: &Request,
        timings: &mut Timings,
        max_age: Option<Duration>,
    ) -> Result<Handled> {
        let key = self.keys.derive(request)?;

        let hit = timings.time(BACKEND, self.store.get(&key)).await?;
        if let Some(response) = hit {
            debug!(request = %request, "Cache hit");
            return Ok(Handled {
                response,
                cached: true,
            });
        }

        debug!(request = %request, "Cache miss, forwarding");
        let response = self.forwarder.forward(request).await?;

        if let Err(e) = timings
            .time(BACKEND, self.store.set(&key, &response, max_age))
            .await
        {
            warn!(
                request = %request,
                backend = self.store.name(),
                error = %e,
                "Failed to store response, returning it uncached"
            );
        }

        Ok(Handled {
            response,
            cached: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Error;
    use crate::cache::MemoryStore;

    /// Forwarder answering with a fixed response and counting calls
    pub(crate) struct StubForwarder {
        pub response: Response,
        pub calls: AtomicUsize,
    }

    impl StubForwarder {
        pub(crate) fn new(response: Response) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Forwarder for StubForwarder {
        async fn forward(&self, _request: &Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    pub(crate) struct DownForwarder;

    #[async_trait]
    impl Forwarder for DownForwarder {
        async fn forward(&self, _request: &Request) -> Result<Response> {
            Err(Error::Upstream("connection refused".to_string()))
        }
    }

    /// Store whose reads or writes fail
    struct BrokenStore {
        fail_get: bool,
    }

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Response>> {
            if self.fail_get {
                Err(Error::Backend("connection reset".to_string()))
            } else {
                Ok(None)
            }
        }

        async fn set(
            &self,
            _key: &str,
            _response: &Response,
            _ttl: Option<Duration>,
        ) -> Result<()> {
            Err(Error::Backend("connection reset".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn origin_answer() -> Response {
        Response::new(StatusCode::OK)
            .with_header("X-Foo", "bar")
            .with_body("hello")
    }

    fn request() -> Request {
        Request::new("GET", "http://origin.test/path?q=1")
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let forwarder = StubForwarder::new(origin_answer());
        let handler = RequestHandler::new(
            Arc::new(MemoryStore::default()),
            forwarder.clone(),
            KeyDeriver::default(),
        );

        let mut timings = Timings::new();
        let first = handler.handle(&request(), &mut timings, None).await.unwrap();
        let second = handler.handle(&request(), &mut timings, None).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.response, second.response);
        assert_eq!(forwarder.calls(), 1);
    }

    #[tokio::test]
    async fn store_failure_still_returns_fresh_response() {
        let forwarder = StubForwarder::new(origin_answer());
        let handler = RequestHandler::new(
            Arc::new(BrokenStore { fail_get: false }),
            forwarder.clone(),
            KeyDeriver::default(),
        );

        let handled = handler
            .handle(&request(), &mut Timings::new(), None)
            .await
            .unwrap();

        assert!(!handled.cached);
        assert_eq!(handled.response, origin_answer());
        assert_eq!(forwarder.calls(), 1);
    }

    #[tokio::test]
    async fn lookup_failure_is_not_a_miss() {
        let forwarder = StubForwarder::new(origin_answer());
        let handler = RequestHandler::new(
            Arc::new(BrokenStore { fail_get: true }),
            forwarder.clone(),
            KeyDeriver::default(),
        );

        let err = handler
            .handle(&request(), &mut Timings::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(forwarder.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_propagates_and_caches_nothing() {
        let store = Arc::new(MemoryStore::default());
        let handler =
            RequestHandler::new(store.clone(), Arc::new(DownForwarder), KeyDeriver::default());

        let err = handler
            .handle(&request(), &mut Timings::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(store.stats().size, 0);
    }

    #[tokio::test]
    async fn malformed_request_touches_nothing() {
        let forwarder = StubForwarder::new(origin_answer());
        let store = Arc::new(MemoryStore::default());
        let handler = RequestHandler::new(store.clone(), forwarder.clone(), KeyDeriver::default());

        let err = handler
            .handle(&Request::new("GET", "/relative"), &mut Timings::new(), None)
            .await
            .unwrap_err();

        assert!(err.is_malformed());
        assert_eq!(forwarder.calls(), 0);
        assert_eq!(store.stats().misses, 0);
    }

    #[tokio::test]
    async fn max_age_limits_the_cached_copy() {
        let forwarder = StubForwarder::new(origin_answer());
        let handler = RequestHandler::new(
            Arc::new(MemoryStore::default()),
            forwarder.clone(),
            KeyDeriver::default(),
        );
        let mut timings = Timings::new();

        handler
            .handle(&request(), &mut timings, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let again = handler.handle(&request(), &mut timings, None).await.unwrap();

        assert!(!again.cached);
        assert_eq!(forwarder.calls(), 2);
    }

    #[tokio::test]
    async fn backend_time_is_recorded() {
        let handler = RequestHandler::new(
            Arc::new(MemoryStore::default()),
            StubForwarder::new(origin_answer()),
            KeyDeriver::default(),
        );
        let mut timings = Timings::new();
        handler.handle(&request(), &mut timings, None).await.unwrap();

        assert!(timings.elapsed(BACKEND) > Duration::ZERO);
    }
}

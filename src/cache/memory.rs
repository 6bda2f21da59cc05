//! In-process cache store with TTL expiry
//!
//! Entries are kept in their serialized form, exactly as a networked
//! backend would hold them, so a value that decodes here decodes anywhere.
//! Expired entries are removed lazily on lookup, and in bulk by the task
//! started with [`spawn_sweeper`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{CacheStore, decode_entry, encode_entry};
use crate::Result;
use crate::message::Response;

/// Thread-safe response store with optional per-entry expiry
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    default_ttl: Option<Duration>,
    stats: StoreStats,
}

struct StoredEntry {
    raw: String,
    stored_at: Instant,
    ttl: Option<Duration>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| Instant::now().duration_since(self.stored_at) >= ttl)
    }
}

/// Store statistics tracked atomically
#[derive(Debug, Default)]
struct StoreStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StoreStats {
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    ///
    /// `default_ttl` applies to writes that carry no TTL of their own.
    #[must_use]
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            stats: StoreStats::default(),
        }
    }

    /// Store an already-serialized value; used to seed and to test corruption
    pub fn set_raw(&self, key: &str, raw: impl Into<String>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                raw: raw.into(),
                stored_at: Instant::now(),
                ttl: ttl.or(self.default_ttl),
            },
        );
    }

    /// Current statistics
    pub fn stats(&self) -> StoreStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        StoreStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: StoreStats::hit_rate(hits, misses),
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired());
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(entry.raw.clone())
    }
}

/// Spawn a background task evicting expired entries from `store` every
/// `interval`.
///
/// The task stops when `cancel` fires or when every other handle to the
/// store has been dropped.
pub fn spawn_sweeper(
    store: &Arc<MemoryStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let store = Arc::downgrade(store);
    // interval() panics on zero
    let period = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(store) = store.upgrade() else { break };
            let evicted = store.evict_expired();
            if evicted > 0 {
                debug!(evicted, remaining = store.entries.len(), "Swept expired cache entries");
            }
        }
    })
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Response>> {
        let Some(raw) = self.lookup(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let response = decode_entry(key, &raw)?;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(response))
    }

    async fn set(&self, key: &str, response: &Response, ttl: Option<Duration>) -> Result<()> {
        let raw = encode_entry(response)?;
        trace!(bytes = raw.len(), ttl = ?ttl.or(self.default_ttl), "Storing entry in memory");
        self.set_raw(key, raw, ttl);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Snapshot of store statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStatsSnapshot {
    /// Lookups served from the store
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Expired entries removed
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::OK)
            .with_header("Content-Type", "text/plain")
            .with_body(body)
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let store = MemoryStore::default();
        store.set("k", &ok("hello"), None).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(ok("hello")));
        assert_eq!(store.get("other").await.unwrap(), None);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemoryStore::default();
        store.set("k", &ok("first"), None).await.unwrap();
        store.set("k", &ok("second"), None).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(ok("second")));
    }

    #[tokio::test]
    async fn test_explicit_ttl_expires() {
        let store = MemoryStore::default();
        store
            .set("k", &ok("soon gone"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_default_ttl_applies_without_explicit_ttl() {
        let store = MemoryStore::new(Some(Duration::from_millis(5)));
        store.set("k", &ok("x"), None).await.unwrap();
        store
            .set("pinned", &ok("y"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.get("pinned").await.unwrap(), Some(ok("y")));
    }

    #[tokio::test]
    async fn test_no_ttl_persists() {
        let store = MemoryStore::default();
        store.set("k", &ok("forever"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_error_not_miss() {
        let store = MemoryStore::default();
        store.set_raw("k", "definitely not a response", None);

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryStore::default();
        store
            .set("short", &ok("a"), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store
            .set("long", &ok("b"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.stats().size, 1);
        assert_eq!(store.get("long").await.unwrap(), Some(ok("b")));
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let store = MemoryStore::default();
        store.set("a", &ok("1"), None).await.unwrap();
        store.get("a").await.unwrap();
        store.get("a").await.unwrap();
        store.get("missing").await.unwrap();

        assert!((store.stats().hit_rate - 0.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn sweeper_drops_one_off_keys() {
        let store = Arc::new(MemoryStore::default());
        for i in 0..1000 {
            store
                .set(&format!("key-{i}"), &ok("x"), Some(Duration::from_millis(1)))
                .await
                .unwrap();
        }
        store.set("kept", &ok("y"), None).await.unwrap();

        let cancel = CancellationToken::new();
        let sweeper = spawn_sweeper(&store, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = store.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.evictions, 1000);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_stops_with_the_store() {
        let store = Arc::new(MemoryStore::default());
        let sweeper = spawn_sweeper(&store, Duration::from_millis(5), CancellationToken::new());
        drop(store);

        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}

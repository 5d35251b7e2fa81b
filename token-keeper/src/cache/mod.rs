//! Short-lived cache of decrypted token material.
//!
//! Entries expire after a TTL (60 seconds by default) so a rotated or
//! revoked secret is never served for long. Expired entries are evicted on
//! read and by a periodic sweep.

pub mod backend;

pub use backend::{CacheBackend, CacheEntry, MemoryCacheBackend, RemoteCacheBackend};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::domain::TokenData;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    /// Entries removed because they expired, on read or by sweep.
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL cache of tokens keyed by principal id.
pub struct TokenCache {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TokenCache {
    /// In-process cache with the default TTL.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_backend(Arc::new(MemoryCacheBackend::new()), clock, DEFAULT_TTL)
    }

    pub fn with_backend(
        backend: Arc<dyn CacheBackend>,
        clock: SharedClock,
        default_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached tokens, or `None` when absent or expired.
    ///
    /// An expired entry is evicted and counted as a miss.
    pub async fn get(&self, principal_id: &str) -> Option<TokenData> {
        let now = self.clock.now_ms();
        match self.backend.get(principal_id).await {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data)
            }
            Some(_) => {
                if self.backend.remove_if_expired(principal_id, now).await {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Like [`get`](Self::get) but leaves the stats and expired entries alone.
    pub async fn peek(&self, principal_id: &str) -> Option<TokenData> {
        let now = self.clock.now_ms();
        self.backend
            .get(principal_id)
            .await
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.data)
    }

    /// Cache tokens with the default TTL.
    pub async fn set(&self, principal_id: &str, data: TokenData) {
        self.set_with_ttl(principal_id, data, self.default_ttl).await;
    }

    pub async fn set_with_ttl(&self, principal_id: &str, data: TokenData, ttl: Duration) {
        let entry = CacheEntry::new(data, self.clock.now_ms(), ttl.as_millis() as i64);
        self.backend.insert(principal_id.to_string(), entry).await;
    }

    /// Returns whether an entry was removed.
    pub async fn delete(&self, principal_id: &str) -> bool {
        self.backend.remove(principal_id).await
    }

    pub async fn clear(&self) {
        self.backend.clear().await;
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.backend.len().await,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Remove all expired entries. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = self.backend.remove_expired(self.clock.now_ms()).await;
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                backend = cache.backend_name(),
                "Token cache sweeper started"
            );
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup_expired().await;
                        if removed > 0 {
                            debug!(removed, "Evicted expired cache entries");
                        }
                    }
                }
            }
            info!("Token cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, TokenCache) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = TokenCache::new(clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (_, cache) = setup();
        let token = TokenData::new("a", "r", 10_000).with_scope("read");
        cache.set("u1", token.clone()).await;
        assert_eq!(cache.get("u1").await, Some(token));

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_and_missed() {
        let (clock, cache) = setup();
        cache
            .set_with_ttl("u1", TokenData::new("a", "r", 0), Duration::from_secs(30))
            .await;

        clock.advance(Duration::from_secs(29));
        assert!(cache.get("u1").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("u1").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_default_ttl_is_sixty_seconds() {
        let (clock, cache) = setup();
        cache.set("u1", TokenData::new("a", "r", 0)).await;
        clock.advance(Duration::from_secs(59));
        assert!(cache.get("u1").await.is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_, cache) = setup();
        cache.set("u1", TokenData::new("a", "r", 0)).await;
        cache.set("u2", TokenData::new("b", "r", 0)).await;
        assert!(cache.delete("u1").await);
        assert!(!cache.delete("u1").await);
        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_until_cancelled() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(TokenCache::new(clock.clone()));
        cache.set("u1", TokenData::new("a", "r", 0)).await;

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(300), cancel.clone());

        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(cache.stats().await.size, 0);
        assert_eq!(cache.stats().await.evictions, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_backend_always_misses() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = TokenCache::with_backend(
            Arc::new(RemoteCacheBackend::new("redis://cache:6379")),
            clock,
            DEFAULT_TTL,
        );
        cache.set("u1", TokenData::new("a", "r", 0)).await;
        assert!(cache.get("u1").await.is_none());
        assert_eq!(cache.backend_name(), "remote");
    }
}

//! Cache storage backends.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::domain::TokenData;

/// A cached token with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: TokenData,
    pub created_at: i64,
    /// Always `created_at + ttl`.
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn new(data: TokenData, created_at: i64, ttl_ms: i64) -> Self {
        Self {
            data,
            created_at,
            expires_at: created_at.saturating_add(ttl_ms.max(0)),
        }
    }

    #[inline]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Where cache entries live. Callers of [`TokenCache`](super::TokenCache)
/// never see which backend is active.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Option<CacheEntry>;

    async fn insert(&self, key: String, entry: CacheEntry);

    async fn remove(&self, key: &str) -> bool;

    async fn clear(&self);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry expired at `now_ms`. Returns how many were removed.
    async fn remove_expired(&self, now_ms: i64) -> usize;

    /// Remove `key` only if its current entry is expired at `now_ms`.
    ///
    /// An entry replaced since it was read is left alone.
    async fn remove_if_expired(&self, key: &str, now_ms: i64) -> bool;
}

/// In-process backend over a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    async fn insert(&self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    async fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }

    async fn remove_expired(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        before.saturating_sub(self.entries.len())
    }

    async fn remove_if_expired(&self, key: &str, now_ms: i64) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.is_expired(now_ms))
            .is_some()
    }
}

/// Placeholder for a shared cache such as Redis.
///
/// Stores nothing, so every lookup misses and the coordinator falls through
/// to the vault. Swap in a real client here to share entries across processes.
#[derive(Debug)]
pub struct RemoteCacheBackend {
    endpoint: String,
    warned: AtomicBool,
}

impl RemoteCacheBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            warned: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                endpoint = %self.endpoint,
                "Remote cache backend is not implemented; all lookups will miss"
            );
        }
    }
}

#[async_trait]
impl CacheBackend for RemoteCacheBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, _key: &str) -> Option<CacheEntry> {
        self.warn_once();
        None
    }

    async fn insert(&self, _key: String, _entry: CacheEntry) {
        self.warn_once();
    }

    async fn remove(&self, _key: &str) -> bool {
        false
    }

    async fn clear(&self) {}

    async fn len(&self) -> usize {
        0
    }

    async fn remove_expired(&self, _now_ms: i64) -> usize {
        0
    }

    async fn remove_if_expired(&self, _key: &str, _now_ms: i64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new(TokenData::new("a", "r", 0), 1_000, 60_000);
        assert_eq!(entry.expires_at, 61_000);
        assert!(!entry.is_expired(60_999));
        assert!(entry.is_expired(61_000));
    }

    #[tokio::test]
    async fn test_remove_if_expired_keeps_replaced_entry() {
        let backend = MemoryCacheBackend::new();
        backend
            .insert("u1".into(), CacheEntry::new(TokenData::new("old", "r", 0), 0, 10))
            .await;
        // Replaced by a fresh entry after the expired one was read.
        backend
            .insert("u1".into(), CacheEntry::new(TokenData::new("new", "r", 0), 100, 60_000))
            .await;

        assert!(!backend.remove_if_expired("u1", 100).await);
        assert_eq!(backend.get("u1").await.unwrap().data.access_token, "new");
        assert!(backend.remove_if_expired("u1", 60_100).await);
        assert!(!backend.remove_if_expired("u1", 60_100).await);
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let backend = MemoryCacheBackend::new();
        let token = TokenData::new("a", "r", 0);
        backend
            .insert("short".into(), CacheEntry::new(token.clone(), 0, 10))
            .await;
        backend
            .insert("long".into(), CacheEntry::new(token, 0, 1_000))
            .await;

        assert_eq!(backend.remove_expired(500).await, 1);
        assert_eq!(backend.len().await, 1);
        assert!(backend.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_remote_stub_never_stores() {
        let backend = RemoteCacheBackend::new("redis://localhost:6379");
        backend
            .insert("k".into(), CacheEntry::new(TokenData::new("a", "r", 0), 0, 1_000))
            .await;
        assert!(backend.get("k").await.is_none());
        assert_eq!(backend.len().await, 0);
    }
}

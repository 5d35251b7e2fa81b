//! Encrypted storage abstraction.
//!
//! The vault only sees opaque byte values keyed by string. Encryption at
//! rest is the backend's job, so any backend that satisfies this contract is
//! interchangeable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::error::StorageError;

/// Key/value store that encrypts values at rest.
#[async_trait]
pub trait EncryptedStorage: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Read and decrypt a value.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Encrypt and write a value, replacing any previous one.
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Physically remove a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys starting with `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Re-seal a value under the current primary key.
    ///
    /// Returns `true` when the value was rewritten, `false` when it was
    /// already current or does not exist.
    async fn reencrypt(&self, key: &str) -> Result<bool, StorageError>;

    /// Take an exclusive, expiring lease named `name` for `owner`.
    ///
    /// Succeeds when the lease is free, expired, or already held by `owner`.
    /// This is the cross-process equivalent of a row lock.
    async fn try_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Release a lease held by `owner`. Releasing someone else's lease is a no-op.
    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    key_version: u32,
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-memory storage for tests and single-process development.
///
/// Values are kept in plaintext; `key_version` simulates the key a value is
/// sealed with so rotation can be observed. Faults can be injected to
/// exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: DashMap<String, StoredValue>,
    leases: DashMap<String, Lease>,
    current_key_version: AtomicU32,
    /// Remaining calls that fail with `Unavailable`.
    transient_failures: AtomicU32,
    /// Remaining write calls that fail with `Unavailable`.
    write_failures: AtomicU32,
    /// Every call fails while set.
    down: std::sync::atomic::AtomicBool,
    calls: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls of any kind with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Make every call fail until cleared.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Simulate installing a new primary key.
    pub fn rotate_primary_key(&self) -> u32 {
        self.current_key_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Key version a value is currently sealed with.
    pub fn key_version(&self, key: &str) -> Option<u32> {
        self.values.get(key).map(|v| v.key_version)
    }

    /// All keys, regardless of prefix.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of backend calls served so far, failed ones included.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("connection refused".to_string()));
        }
        if Self::take_fault(&self.transient_failures) {
            return Err(StorageError::Unavailable("request timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EncryptedStorage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.values.get(key).map(|v| v.bytes.clone()))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.check()?;
        if Self::take_fault(&self.write_failures) {
            return Err(StorageError::Unavailable("write timed out".to_string()));
        }
        self.values.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                key_version: self.current_key_version.load(Ordering::SeqCst),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.values.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn reencrypt(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        let current = self.current_key_version.load(Ordering::SeqCst);
        match self.values.get_mut(key) {
            Some(mut value) if value.key_version != current => {
                value.key_version = current;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self.leases.entry(name.to_string()).or_insert_with(|| Lease {
            owner: owner.to_string(),
            expires_at: now,
        });
        if entry.owner == owner || entry.expires_at <= now {
            entry.owner = owner.to_string();
            entry.expires_at = now + ttl;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), StorageError> {
        self.check()?;
        self.leases.remove_if(name, |_, lease| lease.owner == owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud_and_list() {
        let storage = MemoryStorage::new();
        storage.write("live/b", b"2").await.unwrap();
        storage.write("live/a", b"1").await.unwrap();
        storage.write("deleted/a/1", b"x").await.unwrap();

        assert_eq!(storage.read("live/a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.list("live/").await.unwrap(), vec!["live/a", "live/b"]);
        assert!(storage.delete("live/a").await.unwrap());
        assert!(!storage.delete("live/a").await.unwrap());
        assert_eq!(storage.read("live/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let storage = MemoryStorage::new();
        storage.fail_next(2);
        assert!(storage.read("k").await.is_err());
        assert!(storage.read("k").await.is_err());
        assert!(storage.read("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_reencrypt_tracks_key_version() {
        let storage = MemoryStorage::new();
        storage.write("live/a", b"1").await.unwrap();
        assert!(!storage.reencrypt("live/a").await.unwrap());

        storage.rotate_primary_key();
        assert!(storage.reencrypt("live/a").await.unwrap());
        assert_eq!(storage.key_version("live/a"), Some(1));
        assert!(!storage.reencrypt("live/missing").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_exclusive_until_expiry() {
        let storage = MemoryStorage::new();
        let ttl = Duration::from_secs(30);
        assert!(storage.try_lease("refresh/u1", "p1", ttl).await.unwrap());
        assert!(!storage.try_lease("refresh/u1", "p2", ttl).await.unwrap());
        assert!(storage.try_lease("refresh/u1", "p1", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(storage.try_lease("refresh/u1", "p2", ttl).await.unwrap());

        storage.release_lease("refresh/u1", "p1").await.unwrap();
        assert!(!storage.try_lease("refresh/u1", "p1", ttl).await.unwrap());
        storage.release_lease("refresh/u1", "p2").await.unwrap();
        assert!(storage.try_lease("refresh/u1", "p1", ttl).await.unwrap());
    }
}

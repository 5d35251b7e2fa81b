//! Secret vault service.
//!
//! CRUD over encrypted token records keyed by principal id. Every call is
//! timed, transient storage failures are retried, and writes for one
//! principal are serialized.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flow_control::{ConcurrencyPool, RetryConfig, retry_with_backoff};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::error::{StorageError, VaultError};
use super::metrics::{VaultMetrics, VaultMetricsSnapshot, VaultOp};
use super::storage::EncryptedStorage;
use super::types::{
    DELETED_PREFIX, DeleteMode, DeleteOutcome, LIVE_PREFIX, RotationReport, SecretRecord,
    deleted_at_from_key, deleted_key, deleted_prefix, live_key,
};
use crate::clock::SharedClock;
use crate::domain::TokenData;

/// Longest accepted principal id.
pub const MAX_PRINCIPAL_LEN: usize = 256;

/// Principal used by [`SecretVault::health_check`]; never stored.
const HEALTH_CHECK_PRINCIPAL: &str = "__health_check__";

/// Prefix for refresh lease names.
const REFRESH_LEASE_PREFIX: &str = "refresh/";

/// Retry budget for storage calls.
pub fn default_storage_retry() -> RetryConfig {
    RetryConfig::new(3, 100, 2_000)
}

/// Encrypted secret vault.
pub struct SecretVault {
    storage: Arc<dyn EncryptedStorage>,
    clock: SharedClock,
    retry: RetryConfig,
    /// Per-principal locks so read-modify-write sequences do not interleave.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: VaultMetrics,
}

impl SecretVault {
    pub fn new(storage: Arc<dyn EncryptedStorage>, clock: SharedClock) -> Self {
        Self::with_retry(storage, clock, default_storage_retry())
    }

    pub fn with_retry(
        storage: Arc<dyn EncryptedStorage>,
        clock: SharedClock,
        retry: RetryConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            retry,
            write_locks: DashMap::new(),
            metrics: VaultMetrics::default(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.backend_name()
    }

    pub fn metrics(&self) -> VaultMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Create the first live record for a principal.
    #[instrument(skip(self, tokens))]
    pub async fn create(
        &self,
        principal_id: &str,
        tokens: TokenData,
    ) -> Result<SecretRecord, VaultError> {
        self.timed(VaultOp::Create, principal_id, async {
            validate_principal(principal_id)?;
            let _guard = self.lock_principal(principal_id).await;

            let key = live_key(principal_id);
            if self.read_record(&key).await?.is_some() {
                return Err(VaultError::AlreadyExists(principal_id.to_string()));
            }
            let record = SecretRecord::new(principal_id, tokens, self.clock.now_ms());
            self.write_record(&key, &record).await?;
            Ok(record)
        })
        .await
    }

    /// Tokens of the live record.
    pub async fn get(&self, principal_id: &str) -> Result<TokenData, VaultError> {
        self.get_record(principal_id).await.map(|r| r.tokens)
    }

    /// The live record with its metadata.
    pub async fn get_record(&self, principal_id: &str) -> Result<SecretRecord, VaultError> {
        self.timed(VaultOp::Get, principal_id, async {
            validate_principal(principal_id)?;
            self.read_record(&live_key(principal_id))
                .await?
                .ok_or_else(|| VaultError::NotFound(principal_id.to_string()))
        })
        .await
    }

    /// Replace the tokens of the live record and bump its version.
    #[instrument(skip(self, tokens))]
    pub async fn update(
        &self,
        principal_id: &str,
        tokens: TokenData,
    ) -> Result<SecretRecord, VaultError> {
        self.timed(VaultOp::Update, principal_id, async {
            validate_principal(principal_id)?;
            let _guard = self.lock_principal(principal_id).await;

            let key = live_key(principal_id);
            let current = self
                .read_record(&key)
                .await?
                .ok_or_else(|| VaultError::NotFound(principal_id.to_string()))?;
            let record = current.updated(tokens, self.clock.now_ms());
            self.write_record(&key, &record).await?;
            Ok(record)
        })
        .await
    }

    /// Update the live record, or create one.
    #[instrument(skip(self, tokens))]
    pub async fn store(
        &self,
        principal_id: &str,
        tokens: TokenData,
    ) -> Result<SecretRecord, VaultError> {
        self.timed(VaultOp::Store, principal_id, async {
            validate_principal(principal_id)?;
            let _guard = self.lock_principal(principal_id).await;

            let key = live_key(principal_id);
            let now = self.clock.now_ms();
            let record = match self.read_record(&key).await? {
                Some(current) => current.updated(tokens, now),
                None => SecretRecord::new(principal_id, tokens, now),
            };
            self.write_record(&key, &record).await?;
            Ok(record)
        })
        .await
    }

    /// Delete a principal's secret.
    ///
    /// A soft delete moves the live record to a retained copy and reports
    /// status 200. A hard delete removes the live record and every retained
    /// copy and reports status 204.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        principal_id: &str,
        mode: DeleteMode,
        reason: Option<&str>,
    ) -> Result<DeleteOutcome, VaultError> {
        self.timed(VaultOp::Delete, principal_id, async {
            validate_principal(principal_id)?;
            let _guard = self.lock_principal(principal_id).await;

            match mode {
                DeleteMode::Soft => self.soft_delete_locked(principal_id, reason).await,
                DeleteMode::Hard => self.hard_delete_locked(principal_id).await,
            }
        })
        .await
    }

    async fn soft_delete_locked(
        &self,
        principal_id: &str,
        reason: Option<&str>,
    ) -> Result<DeleteOutcome, VaultError> {
        let key = live_key(principal_id);
        let current = self
            .read_record(&key)
            .await?
            .ok_or_else(|| VaultError::NotFound(principal_id.to_string()))?;

        // Keep retained copies unique even when two deletes land in the same millisecond.
        let mut deleted_at = self.clock.now_ms();
        if let Some(last) = self
            .list_keys(&deleted_prefix(principal_id))
            .await?
            .last()
            .and_then(|k| deleted_at_from_key(k))
        {
            deleted_at = deleted_at.max(last + 1);
        }

        let tombstone = current.soft_deleted(deleted_at, reason);
        self.write_record(&deleted_key(principal_id, deleted_at), &tombstone)
            .await?;
        self.delete_key(&key).await?;

        info!(principal_id, reason = reason.unwrap_or(""), "Secret soft-deleted");
        Ok(DeleteOutcome {
            mode: DeleteMode::Soft,
            status_code: 200,
            affected: 1,
        })
    }

    async fn hard_delete_locked(&self, principal_id: &str) -> Result<DeleteOutcome, VaultError> {
        let mut keys = self.list_keys(&deleted_prefix(principal_id)).await?;
        let live = live_key(principal_id);
        if self.read_raw(&live).await?.is_some() {
            keys.push(live);
        }
        if keys.is_empty() {
            return Err(VaultError::NotFound(principal_id.to_string()));
        }

        let mut affected = 0;
        for key in &keys {
            if self.delete_key(key).await? {
                affected += 1;
            }
        }

        info!(principal_id, affected, "Secret hard-deleted");
        Ok(DeleteOutcome {
            mode: DeleteMode::Hard,
            status_code: 204,
            affected,
        })
    }

    /// Bring back the most recent soft-deleted record.
    ///
    /// Fails with `AlreadyExists` when the principal has a live record and
    /// with `NotFound` when nothing was retained.
    #[instrument(skip(self))]
    pub async fn restore(&self, principal_id: &str) -> Result<SecretRecord, VaultError> {
        self.timed(VaultOp::Restore, principal_id, async {
            validate_principal(principal_id)?;
            let _guard = self.lock_principal(principal_id).await;

            let live = live_key(principal_id);
            if self.read_raw(&live).await?.is_some() {
                return Err(VaultError::AlreadyExists(principal_id.to_string()));
            }

            let tombstone_key = self
                .list_keys(&deleted_prefix(principal_id))
                .await?
                .pop()
                .ok_or_else(|| VaultError::NotFound(principal_id.to_string()))?;
            let tombstone = self
                .read_record(&tombstone_key)
                .await?
                .ok_or_else(|| VaultError::NotFound(principal_id.to_string()))?;

            let record = tombstone.restored(self.clock.now_ms());
            self.write_record(&live, &record).await?;
            self.delete_key(&tombstone_key).await?;

            info!(principal_id, version = record.version, "Secret restored");
            Ok(record)
        })
        .await
    }

    /// Retained soft-deleted copies, oldest first.
    pub async fn deleted_records(&self, principal_id: &str) -> Result<Vec<SecretRecord>, VaultError> {
        self.timed(VaultOp::List, principal_id, async {
            validate_principal(principal_id)?;
            let mut records = Vec::new();
            for key in self.list_keys(&deleted_prefix(principal_id)).await? {
                if let Some(record) = self.read_record(&key).await? {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
    }

    /// Principals with a live record.
    pub async fn live_principals(&self) -> Result<Vec<String>, VaultError> {
        self.timed(VaultOp::List, "*", async {
            Ok(self
                .list_keys(LIVE_PREFIX)
                .await?
                .into_iter()
                .filter_map(|k| k.strip_prefix(LIVE_PREFIX).map(str::to_string))
                .collect())
        })
        .await
    }

    /// Physically remove soft-deleted copies deleted before `cutoff_ms`.
    ///
    /// Returns the number of copies removed.
    #[instrument(skip(self))]
    pub async fn purge_deleted_before(&self, cutoff_ms: i64) -> Result<usize, VaultError> {
        self.timed(VaultOp::Purge, "*", async {
            let mut purged = 0;
            for key in self.list_keys(DELETED_PREFIX).await? {
                match deleted_at_from_key(&key) {
                    Some(deleted_at) if deleted_at < cutoff_ms => {
                        if self.delete_key(&key).await? {
                            purged += 1;
                        }
                    }
                    Some(_) => {}
                    None => warn!(key, "Skipping retained secret with malformed key"),
                }
            }
            if purged > 0 {
                info!(purged, cutoff_ms, "Purged expired soft-deleted secrets");
            }
            Ok(purged)
        })
        .await
    }

    /// Re-seal every stored value (live and retained) under the current primary key.
    ///
    /// Individual failures are counted in the report rather than aborting the run.
    #[instrument(skip(self, pool), fields(pool = pool.name()))]
    pub async fn reencrypt_all(&self, pool: &ConcurrencyPool) -> Result<RotationReport, VaultError> {
        self.timed(VaultOp::Reencrypt, "*", async {
            let started = Instant::now();
            let mut keys = self.list_keys(LIVE_PREFIX).await?;
            keys.extend(self.list_keys(DELETED_PREFIX).await?);

            let batch = pool
                .process(keys, |key, _| async move {
                    self.storage_call("reencrypt", || self.storage.reencrypt(&key))
                        .await
                        .map_err(|e| {
                            warn!(key, error = %e, "Failed to re-encrypt secret");
                            e
                        })
                })
                .await;

            let rotated = batch
                .results
                .iter()
                .filter(|r| matches!(r, Ok(true)))
                .count();
            let report = RotationReport {
                total: batch.total(),
                rotated,
                unchanged: batch.succeeded - rotated,
                failed: batch.failed,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            info!(
                total = report.total,
                rotated = report.rotated,
                failed = report.failed,
                "Secret re-encryption finished"
            );
            Ok(report)
        })
        .await
    }

    /// Whether the storage backend answers.
    ///
    /// Reads a principal that is never stored; only transport failures count.
    pub async fn health_check(&self) -> bool {
        let result = self
            .timed(VaultOp::HealthCheck, HEALTH_CHECK_PRINCIPAL, async {
                self.storage
                    .read(&live_key(HEALTH_CHECK_PRINCIPAL))
                    .await
                    .map_err(VaultError::from)
            })
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "Vault health check failed");
                false
            }
        }
    }

    /// Take the cross-process refresh lease for a principal.
    pub async fn try_refresh_lease(
        &self,
        principal_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, VaultError> {
        let name = format!("{REFRESH_LEASE_PREFIX}{principal_id}");
        Ok(self
            .storage_call("try_lease", || self.storage.try_lease(&name, owner, ttl))
            .await?)
    }

    pub async fn release_refresh_lease(
        &self,
        principal_id: &str,
        owner: &str,
    ) -> Result<(), VaultError> {
        let name = format!("{REFRESH_LEASE_PREFIX}{principal_id}");
        Ok(self
            .storage_call("release_lease", || self.storage.release_lease(&name, owner))
            .await?)
    }

    async fn lock_principal(&self, principal_id: &str) -> PrincipalLock<'_> {
        let lock = self
            .write_locks
            .entry(principal_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PrincipalLock {
            guard: Some(lock.lock_owned().await),
            locks: &self.write_locks,
            principal_id: principal_id.to_string(),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.write_locks.len()
    }

    async fn timed<T, Fut>(&self, op: VaultOp, principal_id: &str, fut: Fut) -> Result<T, VaultError>
    where
        Fut: Future<Output = Result<T, VaultError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // NotFound / AlreadyExists are answers, not failures.
        let failed = matches!(&result, Err(e) if !e.is_not_found() && !e.is_already_exists());
        self.metrics.record(op, elapsed_ms, !failed);
        debug!(
            op = op.as_str(),
            principal_id,
            elapsed_ms,
            ok = result.is_ok(),
            "Vault operation"
        );
        result
    }

    async fn storage_call<T, F, Fut>(&self, context: &str, op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        retry_with_backoff(context, &self.retry, StorageError::is_transient, op)
            .await
            .map(|outcome| outcome.value)
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage_call("read", || self.storage.read(key)).await
    }

    async fn read_record(&self, key: &str) -> Result<Option<SecretRecord>, VaultError> {
        match self.read_raw(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StorageError::Corrupted {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    async fn write_record(&self, key: &str, record: &SecretRecord) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec(record)?;
        self.storage_call("write", || self.storage.write(key, &bytes))
            .await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StorageError> {
        self.storage_call("delete", || self.storage.delete(key)).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.storage_call("list", || self.storage.list(prefix)).await
    }
}

/// Write lock for one principal. The map entry is dropped with the last holder.
struct PrincipalLock<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    principal_id: String,
}

impl Drop for PrincipalLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it.
        self.locks
            .remove_if(&self.principal_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn validate_principal(principal_id: &str) -> Result<(), VaultError> {
    let reason = if principal_id.is_empty() {
        "must not be empty"
    } else if principal_id.len() > MAX_PRINCIPAL_LEN {
        "is too long"
    } else if principal_id.contains('/') {
        "must not contain '/'"
    } else if principal_id.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(VaultError::InvalidPrincipal(format!("{principal_id:?} {reason}")))
}

//! Maintenance jobs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flow_control::ConcurrencyPool;
use serde::Serialize;
use tracing::{info, warn};

use super::error::SchedulerError;
use crate::cache::TokenCache;
use crate::clock::SharedClock;
use crate::credentials::TokenRefreshCoordinator;
use crate::vault::SecretVault;

/// The scheduled maintenance jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    /// Purge soft-deleted secrets past retention and evict expired cache entries.
    VaultCleanup,
    /// Re-encrypt every stored secret under the current primary key.
    KeyRotation,
    /// Refresh tokens that expire soon for every live principal.
    TokenRefreshSweep,
}

impl JobName {
    pub const ALL: [JobName; 3] = [Self::VaultCleanup, Self::KeyRotation, Self::TokenRefreshSweep];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaultCleanup => "vault_cleanup",
            Self::KeyRotation => "key_rotation",
            Self::TokenRefreshSweep => "token_refresh_sweep",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "vault_cleanup" | "vaultCleanupJob" => Ok(Self::VaultCleanup),
            "key_rotation" | "keyRotationJob" => Ok(Self::KeyRotation),
            "token_refresh_sweep" | "tokenRefreshSweepJob" => Ok(Self::TokenRefreshSweep),
            other => Err(SchedulerError::UnknownJob(other.to_string())),
        }
    }
}

/// Schedules and job parameters.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Six-field cron expressions (with seconds), evaluated in UTC.
    pub cleanup_cron: String,
    pub rotation_cron: String,
    pub sweep_cron: String,
    /// How long soft-deleted secrets are retained.
    pub retention: Duration,
    /// The sweep refreshes tokens expiring within this window.
    pub sweep_window: Duration,
    pub sweep_concurrency: usize,
    pub rotation_concurrency: usize,
    pub history_capacity: usize,
    /// Consecutive failures of one job before health reports unhealthy.
    pub unhealthy_after_failures: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_cron: "0 0 3 * * *".to_string(),
            rotation_cron: "0 0 4 1 1,4,7,10 *".to_string(),
            sweep_cron: "0 0 2 * * *".to_string(),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_window: Duration::from_secs(24 * 60 * 60),
            sweep_concurrency: 5,
            rotation_concurrency: 4,
            history_capacity: super::history::DEFAULT_HISTORY_CAPACITY,
            unhealthy_after_failures: 3,
        }
    }
}

impl MaintenanceConfig {
    pub fn cron_for(&self, job: JobName) -> &str {
        match job {
            JobName::VaultCleanup => &self.cleanup_cron,
            JobName::KeyRotation => &self.rotation_cron,
            JobName::TokenRefreshSweep => &self.sweep_cron,
        }
    }
}

/// Runs one job to completion and returns a short summary.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: JobName) -> crate::Result<String>;
}

/// The credential subsystem's jobs.
pub struct CredentialMaintenance {
    vault: Arc<SecretVault>,
    cache: Arc<TokenCache>,
    coordinator: Arc<TokenRefreshCoordinator>,
    clock: SharedClock,
    config: MaintenanceConfig,
}

impl CredentialMaintenance {
    pub fn new(
        vault: Arc<SecretVault>,
        cache: Arc<TokenCache>,
        coordinator: Arc<TokenRefreshCoordinator>,
        clock: SharedClock,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            vault,
            cache,
            coordinator,
            clock,
            config,
        }
    }

    /// Purge retained secrets deleted before the retention cutoff.
    pub async fn vault_cleanup(&self) -> crate::Result<String> {
        let retention_ms = self.config.retention.as_millis() as i64;
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);
        let purged = self.vault.purge_deleted_before(cutoff).await?;
        let evicted = self.cache.cleanup_expired().await;
        Ok(format!(
            "purged {purged} retained secrets, evicted {evicted} cache entries"
        ))
    }

    /// Re-seal every secret under the primary key. Fails if any secret could not be rotated.
    pub async fn key_rotation(&self) -> crate::Result<String> {
        let pool = ConcurrencyPool::new("key_rotation", self.config.rotation_concurrency);
        let report = self.vault.reencrypt_all(&pool).await?;
        let summary = format!(
            "rotated {} of {} secrets ({} already current, {} failed)",
            report.rotated, report.total, report.unchanged, report.failed
        );
        if report.failed > 0 {
            return Err(crate::Error::Other(summary));
        }
        Ok(summary)
    }

    /// Refresh tokens that expire within the sweep window.
    ///
    /// Per-principal failures are logged and counted; only failing to list
    /// principals fails the job.
    pub async fn token_refresh_sweep(&self) -> crate::Result<String> {
        let principals = self.vault.live_principals().await?;
        let window = self.config.sweep_window;
        let pool = ConcurrencyPool::new("token_refresh_sweep", self.config.sweep_concurrency);
        let coordinator = &self.coordinator;

        let report = pool
            .process(principals, |principal, _| async move {
                let result = coordinator.refresh_if_expiring(&principal, window).await;
                if result.success {
                    Ok(result.refreshed)
                } else {
                    Err((principal, result))
                }
            })
            .await;

        let refreshed = report.results.iter().filter(|r| matches!(r, Ok(true))).count();
        let mut reauth = 0;
        for (_, (principal, result)) in report.errors() {
            if result.requires_reauth {
                reauth += 1;
            } else {
                warn!(
                    principal_id = %principal,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Sweep failed to refresh token"
                );
            }
        }

        info!(
            total = report.total(),
            refreshed,
            reauth,
            failed = report.failed - reauth,
            "Token refresh sweep finished"
        );
        Ok(format!(
            "checked {} principals, refreshed {refreshed}, {reauth} need re-auth, {} failed",
            report.total(),
            report.failed - reauth
        ))
    }
}

#[async_trait]
impl JobExecutor for CredentialMaintenance {
    async fn execute(&self, job: JobName) -> crate::Result<String> {
        match job {
            JobName::VaultCleanup => self.vault_cleanup().await,
            JobName::KeyRotation => self.key_rotation().await,
            JobName::TokenRefreshSweep => self.token_refresh_sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_name_parsing() {
        assert_eq!(JobName::from_str("vault_cleanup").unwrap(), JobName::VaultCleanup);
        assert_eq!(JobName::from_str("vaultCleanupJob").unwrap(), JobName::VaultCleanup);
        assert_eq!(JobName::from_str("key_rotation").unwrap(), JobName::KeyRotation);
        assert_eq!(
            JobName::from_str("token_refresh_sweep").unwrap(),
            JobName::TokenRefreshSweep
        );
        assert_eq!(
            JobName::from_str("reindex"),
            Err(SchedulerError::UnknownJob("reindex".into()))
        );
    }

    #[test]
    fn test_default_schedules_parse() {
        let config = MaintenanceConfig::default();
        for job in JobName::ALL {
            assert!(cron::Schedule::from_str(config.cron_for(job)).is_ok(), "{job}");
        }
        assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
    }
}

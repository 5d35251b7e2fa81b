//! Service container for dependency injection.
//!
//! [`CredentialServices`] builds the vault, cache, refresh coordinator and
//! maintenance scheduler once and exposes the operations the rest of the
//! application calls.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::cache::{CacheStats, MemoryCacheBackend, TokenCache};
use crate::clock::{SharedClock, SystemClock};
use crate::config::AppConfig;
use crate::credentials::{
    HttpOAuthClient, OAuthClient, RefreshConfig, RefreshMetricsSnapshot, RefreshResult,
    TokenRefreshCoordinator,
};
use crate::database::{self, DbPool};
use crate::domain::TokenData;
use crate::maintenance::{
    CredentialMaintenance, JobRun, MaintenanceConfig, MaintenanceScheduler, SchedulerHealth,
    SchedulerStatus,
};
use crate::vault::{
    DeleteMode, DeleteOutcome, EncryptedStorage, Keyring, MemoryStorage, SecretRecord,
    SecretVault, SqliteStorage, VaultMetricsSnapshot,
};

/// Tunables shared by every constructor.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub refresh: RefreshConfig,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub maintenance: MaintenanceConfig,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            refresh: RefreshConfig::default(),
            cache_ttl: crate::cache::DEFAULT_TTL,
            cache_sweep_interval: crate::cache::DEFAULT_SWEEP_INTERVAL,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl From<&AppConfig> for ServiceOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            refresh: config.refresh.clone(),
            cache_ttl: config.cache_ttl,
            cache_sweep_interval: config.cache_sweep_interval,
            maintenance: config.maintenance.clone(),
        }
    }
}

/// Combined metrics for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialMetrics {
    pub refresh: RefreshMetricsSnapshot,
    pub cache: CacheStats,
    pub vault: VaultMetricsSnapshot,
    pub in_flight_refreshes: usize,
    pub reauth_required: usize,
}

/// Holds the credential services and manages their background tasks.
pub struct CredentialServices {
    pub vault: Arc<SecretVault>,
    pub cache: Arc<TokenCache>,
    pub coordinator: Arc<TokenRefreshCoordinator>,
    pub scheduler: Arc<MaintenanceScheduler>,
    pool: Option<DbPool>,
    cache_sweep_interval: Duration,
    cancellation_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialServices {
    /// Open the database, run migrations and wire the production services.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        info!(environment = %config.environment, "Initializing credential services");

        let pool = database::init_pool(&config.database_url).await?;
        database::run_migrations(&pool).await?;

        let clock = SystemClock::shared();
        let keyring = Arc::new(Keyring::new(
            &config.encryption_key,
            config.previous_keys.as_slice(),
        )?);
        info!(
            primary_key_id = keyring.primary_key_id(),
            previous_keys = config.previous_keys.len(),
            "Keyring loaded"
        );
        let storage = Arc::new(SqliteStorage::new(pool.clone(), keyring, clock.clone()));
        let oauth = Arc::new(HttpOAuthClient::new(config.oauth.clone())?);

        let mut services = Self::with_components(storage, oauth, clock, config.into())?;
        services.pool = Some(pool);
        Ok(services)
    }

    /// Wire services over an in-memory store.
    pub fn in_memory(
        oauth: Arc<dyn OAuthClient>,
        clock: SharedClock,
        options: ServiceOptions,
    ) -> Result<Self> {
        Self::with_components(Arc::new(MemoryStorage::new()), oauth, clock, options)
    }

    /// Wire services over the given storage and OAuth client.
    pub fn with_components(
        storage: Arc<dyn EncryptedStorage>,
        oauth: Arc<dyn OAuthClient>,
        clock: SharedClock,
        options: ServiceOptions,
    ) -> Result<Self> {
        let vault = Arc::new(SecretVault::new(storage, clock.clone()));
        let cache = Arc::new(TokenCache::with_backend(
            Arc::new(MemoryCacheBackend::new()),
            clock.clone(),
            options.cache_ttl,
        ));
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            vault.clone(),
            cache.clone(),
            oauth,
            clock.clone(),
            options.refresh,
        ));
        let jobs = Arc::new(CredentialMaintenance::new(
            vault.clone(),
            cache.clone(),
            coordinator.clone(),
            clock.clone(),
            options.maintenance.clone(),
        ));
        let scheduler = Arc::new(MaintenanceScheduler::new(options.maintenance, jobs, clock)?);

        info!(backend = vault.backend_name(), "Credential services initialized");

        Ok(Self {
            vault,
            cache,
            coordinator,
            scheduler,
            pool: None,
            cache_sweep_interval: options.cache_sweep_interval,
            cancellation_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// The database pool, when backed by SQLite.
    pub fn pool(&self) -> Option<&DbPool> {
        self.pool.as_ref()
    }

    /// Start the maintenance scheduler and the cache sweeper.
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()?;
        let handle = self
            .cache
            .spawn_sweeper(self.cache_sweep_interval, self.cancellation_token.child_token());
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    /// Stop background tasks and wait for in-flight work to settle.
    pub async fn shutdown(&self) {
        info!("Shutting down credential services");
        self.cancellation_token.cancel();
        self.scheduler.shutdown().await;
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Cache sweeper ended abnormally");
        }
        self.coordinator.shutdown().await;
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!("Credential services stopped");
    }

    /// Valid tokens for a principal, refreshing if needed.
    pub async fn get_valid_tokens(&self, principal_id: &str) -> RefreshResult {
        self.coordinator.get_valid_tokens(principal_id).await
    }

    /// Store tokens from a link or re-link flow.
    pub async fn store_user_secret(
        &self,
        principal_id: &str,
        tokens: TokenData,
    ) -> Result<SecretRecord> {
        Ok(self.coordinator.store_user_secret(principal_id, tokens).await?)
    }

    pub async fn delete_user_secret(
        &self,
        principal_id: &str,
        mode: DeleteMode,
        reason: Option<&str>,
    ) -> Result<DeleteOutcome> {
        Ok(self
            .coordinator
            .delete_user_secret(principal_id, mode, reason)
            .await?)
    }

    /// Force a refresh regardless of expiry.
    pub async fn manual_refresh(&self, principal_id: &str) -> RefreshResult {
        self.coordinator.manual_refresh(principal_id).await
    }

    pub async fn get_metrics(&self) -> CredentialMetrics {
        CredentialMetrics {
            refresh: self.coordinator.metrics(),
            cache: self.cache.stats().await,
            vault: self.vault.metrics(),
            in_flight_refreshes: self.coordinator.in_flight_count(),
            reauth_required: self.coordinator.reauth_required_count(),
        }
    }

    pub async fn vault_health_check(&self) -> bool {
        self.vault.health_check().await
    }

    pub fn scheduler_health_check(&self) -> SchedulerHealth {
        self.scheduler.health_check()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Run a maintenance job by name now.
    pub async fn run_job(&self, name: &str) -> Result<JobRun> {
        Ok(self.scheduler.manual_run(name).await?)
    }
}

//! Token refresh coordinator.
//!
//! Resolves "a usable token for this principal" through cache, vault and,
//! when the token is close to expiry, an OAuth refresh. At most one refresh
//! per principal is in flight in this process; concurrent callers attach to
//! it. Across processes the same guarantee comes from a storage lease.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flow_control::retry_with_backoff;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::{RefreshMetrics, RefreshMetricsSnapshot};
use super::oauth::{OAuthClient, OAuthError};
use super::types::{RefreshConfig, RefreshResult, TokenSource};
use crate::cache::TokenCache;
use crate::clock::SharedClock;
use crate::domain::{TokenData, TokenState};
use crate::vault::{DeleteMode, DeleteOutcome, SecretRecord, SecretVault, VaultError};

/// A refresh in progress; waiters share its result.
struct InFlightRefresh {
    result: OnceCell<RefreshResult>,
    notify: Notify,
}

impl InFlightRefresh {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: RefreshResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> RefreshResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

/// Completes the in-flight entry even if the leading caller is dropped mid-refresh.
struct InFlightGuard<'a> {
    coordinator: &'a TokenRefreshCoordinator,
    principal_id: &'a str,
    flight: Arc<InFlightRefresh>,
    done: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, result: RefreshResult) {
        self.coordinator
            .complete_in_flight(self.principal_id, &self.flight, result);
        self.done = true;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.coordinator.complete_in_flight(
                self.principal_id,
                &self.flight,
                RefreshResult::failed("refresh cancelled", 0),
            );
        }
    }
}

/// Coordinates token reads and refreshes for all principals.
pub struct TokenRefreshCoordinator {
    vault: Arc<SecretVault>,
    cache: Arc<TokenCache>,
    oauth: Arc<dyn OAuthClient>,
    clock: SharedClock,
    config: RefreshConfig,
    /// Lease owner id for this process.
    instance_id: String,
    in_flight: DashMap<String, Arc<InFlightRefresh>>,
    /// Principals whose refresh token was rejected, with the reason.
    reauth_required: DashMap<String, String>,
    metrics: Arc<RefreshMetrics>,
    background: TaskTracker,
}

impl TokenRefreshCoordinator {
    pub fn new(
        vault: Arc<SecretVault>,
        cache: Arc<TokenCache>,
        oauth: Arc<dyn OAuthClient>,
        clock: SharedClock,
        config: RefreshConfig,
    ) -> Self {
        Self {
            vault,
            cache,
            oauth,
            clock,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            in_flight: DashMap::new(),
            reauth_required: DashMap::new(),
            metrics: Arc::new(RefreshMetrics::default()),
            background: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn metrics(&self) -> RefreshMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn reauth_required_count(&self) -> usize {
        self.reauth_required.len()
    }

    /// A usable token for `principal_id`, refreshing it when it is close to expiry.
    #[instrument(skip(self))]
    pub async fn get_valid_tokens(&self, principal_id: &str) -> RefreshResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        if let Some(reason) = self.reauth_reason(principal_id) {
            return RefreshResult::reauth(reason, elapsed());
        }

        if let Some(tokens) = self.cache.get(principal_id).await
            && !self.near_expiry(&tokens)
        {
            return RefreshResult::ok(tokens, TokenSource::Cache, elapsed());
        }

        let tokens = match self.vault.get(principal_id).await {
            Ok(tokens) => tokens,
            Err(e) => return self.vault_read_failure(principal_id, e, elapsed()),
        };

        if !self.near_expiry(&tokens) {
            self.cache.set(principal_id, tokens.clone()).await;
            return RefreshResult::ok(tokens, TokenSource::Vault, elapsed());
        }

        debug!(
            remaining_ms = tokens.remaining_ms(self.clock.now_ms()),
            "Token near expiry, refreshing"
        );
        self.refresh_single_flight(principal_id, tokens)
            .await
            .with_elapsed(elapsed())
    }

    /// Refresh only if the stored token expires within `within`.
    ///
    /// Used by the maintenance sweep; bypasses the cache.
    #[instrument(skip(self))]
    pub async fn refresh_if_expiring(&self, principal_id: &str, within: Duration) -> RefreshResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        if let Some(reason) = self.reauth_reason(principal_id) {
            return RefreshResult::reauth(reason, elapsed());
        }

        let tokens = match self.vault.get(principal_id).await {
            Ok(tokens) => tokens,
            Err(e) => return self.vault_read_failure(principal_id, e, elapsed()),
        };

        let now = self.clock.now_ms();
        if !tokens.expires_within(now, within.as_millis() as i64) {
            return RefreshResult::ok(tokens, TokenSource::Vault, elapsed());
        }

        self.refresh_single_flight(principal_id, tokens)
            .await
            .with_elapsed(elapsed())
    }

    /// Force a refresh regardless of expiry (operator tooling).
    ///
    /// Also attempted for principals marked as requiring re-auth; a success
    /// clears the mark.
    #[instrument(skip(self))]
    pub async fn manual_refresh(&self, principal_id: &str) -> RefreshResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let tokens = match self.vault.get(principal_id).await {
            Ok(tokens) => tokens,
            Err(e) => return self.vault_read_failure(principal_id, e, elapsed()),
        };

        info!("Manual token refresh requested");
        self.refresh_single_flight(principal_id, tokens)
            .await
            .with_elapsed(elapsed())
    }

    /// Exchange `refresh_token` with the provider.
    ///
    /// Only the OAuth call: nothing is persisted or cached. Transient errors
    /// are retried within a small budget; a rejected grant is reported with
    /// `requires_reauth`.
    pub async fn refresh_tokens(&self, principal_id: &str, refresh_token: &str) -> RefreshResult {
        let started = Instant::now();
        let previous = TokenData::new("", refresh_token, 0);
        match self.exchange(principal_id, &previous).await {
            Ok(tokens) => RefreshResult::ok(
                tokens,
                TokenSource::Refresh,
                started.elapsed().as_millis() as u64,
            ),
            Err(e) if e.requires_reauth() => {
                RefreshResult::reauth(e.to_string(), started.elapsed().as_millis() as u64)
            }
            Err(e) => RefreshResult::failed(e.to_string(), started.elapsed().as_millis() as u64),
        }
    }

    /// Current lifecycle state of a principal's token.
    pub async fn state(&self, principal_id: &str) -> TokenState {
        if self.reauth_required.contains_key(principal_id) {
            return TokenState::ReauthRequired;
        }
        if self.in_flight.contains_key(principal_id) {
            return TokenState::Refreshing;
        }
        match self.vault.get(principal_id).await {
            Ok(tokens) if self.near_expiry(&tokens) => TokenState::NearExpiry,
            Ok(_) => TokenState::Fresh,
            Err(_) => TokenState::Unknown,
        }
    }

    /// Store tokens from a (re-)link flow and clear any re-auth mark.
    #[instrument(skip(self, tokens))]
    pub async fn store_user_secret(
        &self,
        principal_id: &str,
        tokens: TokenData,
    ) -> Result<SecretRecord, VaultError> {
        let record = self.vault.store(principal_id, tokens).await?;
        self.metrics.record_vault_write();
        if self.reauth_required.remove(principal_id).is_some() {
            info!("Principal re-linked, re-auth mark cleared");
        }
        self.cache.set(principal_id, record.tokens.clone()).await;
        Ok(record)
    }

    /// Delete a principal's secret and drop it from the cache.
    #[instrument(skip(self))]
    pub async fn delete_user_secret(
        &self,
        principal_id: &str,
        mode: DeleteMode,
        reason: Option<&str>,
    ) -> Result<DeleteOutcome, VaultError> {
        let outcome = self.vault.delete(principal_id, mode, reason).await?;
        self.cache.delete(principal_id).await;
        self.reauth_required.remove(principal_id);
        Ok(outcome)
    }

    /// Wait for background persist retries to finish.
    pub async fn shutdown(&self) {
        self.background.close();
        self.background.wait().await;
    }

    fn near_expiry(&self, tokens: &TokenData) -> bool {
        tokens.expires_within(self.clock.now_ms(), self.config.threshold_ms())
    }

    fn reauth_reason(&self, principal_id: &str) -> Option<String> {
        self.reauth_required
            .get(principal_id)
            .map(|r| r.value().clone())
    }

    fn vault_read_failure(&self, principal_id: &str, err: VaultError, elapsed_ms: u64) -> RefreshResult {
        if err.is_not_found() {
            // Nothing linked yet: the user has to authorize.
            debug!(principal_id, "No stored secret");
            RefreshResult::reauth(err.to_string(), elapsed_ms)
        } else {
            warn!(principal_id, error = %err, "Failed to read secret from vault");
            RefreshResult::failed(err.to_string(), elapsed_ms)
        }
    }

    async fn refresh_single_flight(&self, principal_id: &str, current: TokenData) -> RefreshResult {
        let (flight, is_leader) = self.get_or_create_in_flight(principal_id);
        if !is_leader {
            self.metrics.record_join();
            debug!(principal_id, "Joining in-flight refresh");
            return flight.wait().await;
        }

        let guard = InFlightGuard {
            coordinator: self,
            principal_id,
            flight,
            done: false,
        };

        // A refresh that completed after `current` was read has already
        // spent its refresh token.
        let current = match self.superseding_tokens(principal_id, &current).await {
            Some((tokens, source)) if !self.near_expiry(&tokens) => {
                debug!(principal_id, %source, "Token already refreshed, skipping");
                let result = RefreshResult::ok(tokens, source, 0);
                guard.complete(result.clone());
                return result;
            }
            Some((tokens, _)) => tokens,
            None => current,
        };

        let result = self.run_refresh(principal_id, current).await;
        guard.complete(result.clone());
        result
    }

    /// Tokens stored since `current` was read, if any.
    async fn superseding_tokens(
        &self,
        principal_id: &str,
        current: &TokenData,
    ) -> Option<(TokenData, TokenSource)> {
        // The cache may hold an older copy; only a later expiry counts there.
        if let Some(cached) = self.cache.peek(principal_id).await
            && cached.expires_at > current.expires_at
        {
            return Some((cached, TokenSource::Cache));
        }
        match self.vault.get(principal_id).await {
            Ok(stored) if stored != *current => Some((stored, TokenSource::Vault)),
            _ => None,
        }
    }

    fn get_or_create_in_flight(&self, principal_id: &str) -> (Arc<InFlightRefresh>, bool) {
        if let Some(existing) = self.in_flight.get(principal_id) {
            return (existing.clone(), false);
        }

        match self.in_flight.entry(principal_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flight = Arc::new(InFlightRefresh::new());
                entry.insert(flight.clone());
                (flight, true)
            }
        }
    }

    fn complete_in_flight(
        &self,
        principal_id: &str,
        flight: &Arc<InFlightRefresh>,
        result: RefreshResult,
    ) {
        self.in_flight
            .remove_if(principal_id, |_, current| Arc::ptr_eq(current, flight));
        flight.set_result(result);
    }

    /// The leader's refresh: lease, OAuth call, write-through.
    async fn run_refresh(&self, principal_id: &str, current: TokenData) -> RefreshResult {
        self.metrics.record_attempt();

        let lease_held = match self.acquire_lease(principal_id).await {
            LeaseOutcome::Held => true,
            LeaseOutcome::Unavailable => false,
            LeaseOutcome::PeerRefreshed(tokens) => {
                self.cache.set(principal_id, tokens.clone()).await;
                self.metrics.record_success();
                return RefreshResult::ok(tokens, TokenSource::Vault, 0);
            }
            LeaseOutcome::PeerStuck => {
                self.metrics.record_failure();
                return RefreshResult::failed(
                    "refresh in progress in another process",
                    0,
                );
            }
        };

        let result = match self.exchange(principal_id, &current).await {
            Ok(tokens) => {
                self.persist(principal_id, &tokens).await;
                self.cache.set(principal_id, tokens.clone()).await;
                self.reauth_required.remove(principal_id);
                self.metrics.record_success();
                info!(principal_id, expires_at = tokens.expires_at, "Token refreshed");
                RefreshResult::ok(tokens, TokenSource::Refresh, 0)
            }
            Err(e) if e.requires_reauth() => {
                self.reauth_required
                    .insert(principal_id.to_string(), e.to_string());
                self.cache.delete(principal_id).await;
                self.metrics.record_reauth();
                self.metrics.record_failure();
                warn!(principal_id, error = %e, "Refresh token rejected, re-auth required");
                RefreshResult::reauth(e.to_string(), 0)
            }
            Err(e) => {
                self.metrics.record_failure();
                warn!(principal_id, error = %e, "Token refresh failed");
                RefreshResult::failed(e.to_string(), 0)
            }
        };

        if lease_held
            && let Err(e) = self
                .vault
                .release_refresh_lease(principal_id, &self.instance_id)
                .await
        {
            // The lease expires on its own.
            warn!(principal_id, error = %e, "Failed to release refresh lease");
        }

        result
    }

    async fn exchange(&self, principal_id: &str, current: &TokenData) -> Result<TokenData, OAuthError> {
        if !current.has_refresh_token() {
            return Err(OAuthError::MissingRefreshToken);
        }

        let context = format!("oauth_refresh:{principal_id}");
        let outcome = retry_with_backoff(&context, &self.config.retry, OAuthError::is_transient, || {
            self.oauth.refresh(&current.refresh_token)
        })
        .await?;

        debug!(
            principal_id,
            attempts = outcome.attempts_used,
            elapsed_ms = outcome.total_elapsed_ms,
            "OAuth refresh completed"
        );
        Ok(outcome.value.into_token_data(current, self.clock.now_ms()))
    }

    /// Write refreshed tokens to the vault.
    ///
    /// On failure the caller still gets the tokens; the write is retried in
    /// the background with a larger budget.
    async fn persist(&self, principal_id: &str, tokens: &TokenData) {
        match self.vault.store(principal_id, tokens.clone()).await {
            Ok(record) => {
                self.metrics.record_vault_write();
                debug!(principal_id, version = record.version, "Refreshed token persisted");
            }
            Err(e) => {
                self.metrics.record_vault_write_failure();
                error!(
                    principal_id,
                    error = %e,
                    "Failed to persist refreshed token, retrying in background"
                );
                self.spawn_persist_retry(principal_id.to_string(), tokens.clone());
            }
        }
    }

    fn spawn_persist_retry(&self, principal_id: String, tokens: TokenData) {
        let vault = Arc::clone(&self.vault);
        let metrics = Arc::clone(&self.metrics);
        let retry = self.config.persist_retry.clone();

        self.background.spawn(async move {
            let context = format!("persist_refresh:{principal_id}");
            let outcome = retry_with_backoff(&context, &retry, VaultError::is_transient, || {
                let vault = Arc::clone(&vault);
                let principal_id = principal_id.clone();
                let tokens = tokens.clone();
                async move {
                    // A newer token may have been written since; never overwrite it.
                    if let Ok(stored) = vault.get(&principal_id).await
                        && stored.expires_at > tokens.expires_at
                    {
                        return Ok(false);
                    }
                    vault.store(&principal_id, tokens).await.map(|_| true)
                }
            })
            .await;

            match outcome {
                Ok(o) if o.value => {
                    metrics.record_vault_write();
                    info!(
                        principal_id,
                        attempts = o.attempts_used,
                        "Refreshed token persisted after retry"
                    );
                }
                Ok(_) => debug!(principal_id, "Newer token already stored, skipping persist"),
                Err(e) => {
                    metrics.record_vault_write_failure();
                    error!(principal_id, error = %e, "Giving up persisting refreshed token");
                }
            }
        });
    }

    async fn acquire_lease(&self, principal_id: &str) -> LeaseOutcome {
        let ttl = self.config.lease_ttl;
        match self
            .vault
            .try_refresh_lease(principal_id, &self.instance_id, ttl)
            .await
        {
            Ok(true) => return LeaseOutcome::Held,
            Ok(false) => {}
            Err(e) => {
                warn!(principal_id, error = %e, "Refresh lease unavailable, refreshing without it");
                return LeaseOutcome::Unavailable;
            }
        }

        self.metrics.record_lease_wait();
        debug!(principal_id, "Another process is refreshing, waiting for its result");
        for _ in 0..self.config.lease_poll_attempts {
            tokio::time::sleep(self.config.lease_poll_interval).await;
            if let Ok(tokens) = self.vault.get(principal_id).await
                && !self.near_expiry(&tokens)
            {
                return LeaseOutcome::PeerRefreshed(tokens);
            }
        }

        match self
            .vault
            .try_refresh_lease(principal_id, &self.instance_id, ttl)
            .await
        {
            Ok(true) => LeaseOutcome::Held,
            _ => LeaseOutcome::PeerStuck,
        }
    }
}

enum LeaseOutcome {
    Held,
    /// The lease store failed; proceed unguarded.
    Unavailable,
    /// Another process finished the refresh while we waited.
    PeerRefreshed(TokenData),
    PeerStuck,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::oauth::OAuthTokenResponse;
    use crate::vault::MemoryStorage;
    use async_trait::async_trait;
    use flow_control::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    const NOW: i64 = 1_700_000_000_000;

    struct StaticOAuth {
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl OAuthClient for StaticOAuth {
        async fn refresh(&self, _refresh_token: &str) -> Result<OAuthTokenResponse, OAuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Err(OAuthError::Status {
                    status: 400,
                    error: Some("invalid_grant".into()),
                    description: None,
                });
            }
            Ok(OAuthTokenResponse {
                access_token: format!("access-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                token_type: None,
                scope: None,
            })
        }
    }

    fn setup(reject: bool) -> (Arc<StaticOAuth>, TokenRefreshCoordinator) {
        let clock: SharedClock = Arc::new(ManualClock::new(NOW));
        let vault = Arc::new(SecretVault::with_retry(
            Arc::new(MemoryStorage::new()),
            clock.clone(),
            RetryConfig::no_retry(),
        ));
        let cache = Arc::new(TokenCache::new(clock.clone()));
        let oauth = Arc::new(StaticOAuth {
            calls: AtomicU32::new(0),
            reject,
        });
        let coordinator =
            TokenRefreshCoordinator::new(vault, cache, oauth.clone(), clock, RefreshConfig::default());
        (oauth, coordinator)
    }

    #[tokio::test]
    async fn test_fresh_token_served_from_vault_then_cache() {
        let (oauth, coordinator) = setup(false);
        coordinator
            .store_user_secret("u1", TokenData::new("a", "r", NOW + 3_600_000))
            .await
            .unwrap();
        coordinator.cache.clear().await;

        let first = coordinator.get_valid_tokens("u1").await;
        assert_eq!(first.source, TokenSource::Vault);
        let second = coordinator.get_valid_tokens("u1").await;
        assert_eq!(second.source, TokenSource::Cache);
        assert_eq!(oauth.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state("u1").await, TokenState::Fresh);
    }

    #[tokio::test]
    async fn test_near_expiry_refreshes() {
        let (oauth, coordinator) = setup(false);
        coordinator
            .store_user_secret("u1", TokenData::new("old", "r", NOW + 60_000))
            .await
            .unwrap();
        assert_eq!(coordinator.state("u1").await, TokenState::NearExpiry);

        let result = coordinator.get_valid_tokens("u1").await;
        assert!(result.success && result.refreshed);
        assert_eq!(result.access_token(), Some("access-1"));
        assert_eq!(oauth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.vault.get("u1").await.unwrap().refresh_token, "r");
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_grant_marks_reauth_until_relinked() {
        let (oauth, coordinator) = setup(true);
        coordinator
            .store_user_secret("u1", TokenData::new("old", "r", NOW + 1_000))
            .await
            .unwrap();

        let result = coordinator.get_valid_tokens("u1").await;
        assert!(result.requires_reauth && !result.success);
        assert_eq!(coordinator.state("u1").await, TokenState::ReauthRequired);

        // No further OAuth calls while the mark is set.
        let again = coordinator.get_valid_tokens("u1").await;
        assert!(again.requires_reauth);
        assert_eq!(oauth.calls.load(Ordering::SeqCst), 1);

        coordinator
            .store_user_secret("u1", TokenData::new("new", "r2", NOW + 3_600_000))
            .await
            .unwrap();
        let relinked = coordinator.get_valid_tokens("u1").await;
        assert!(relinked.success);
        assert_eq!(coordinator.metrics().reauth_required, 1);
    }

    #[tokio::test]
    async fn test_unknown_principal_requires_auth() {
        let (_, coordinator) = setup(false);
        let result = coordinator.get_valid_tokens("nobody").await;
        assert!(result.requires_reauth);
        assert_eq!(coordinator.state("nobody").await, TokenState::Unknown);
    }

    #[tokio::test]
    async fn test_refresh_if_expiring_window() {
        let (oauth, coordinator) = setup(false);
        coordinator
            .store_user_secret("u1", TokenData::new("a", "r", NOW + 2 * 3_600_000))
            .await
            .unwrap();

        let skipped = coordinator
            .refresh_if_expiring("u1", Duration::from_secs(3600))
            .await;
        assert!(skipped.success && !skipped.refreshed);

        let refreshed = coordinator
            .refresh_if_expiring("u1", Duration::from_secs(24 * 3600))
            .await;
        assert!(refreshed.refreshed);
        assert_eq!(oauth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_tokens_without_refresh_token() {
        let (oauth, coordinator) = setup(false);
        let result = coordinator.refresh_tokens("u1", "").await;
        assert!(result.requires_reauth);
        assert_eq!(oauth.calls.load(Ordering::SeqCst), 0);
    }
}

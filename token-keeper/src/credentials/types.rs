//! Refresh coordinator result types.

use std::fmt;
use std::time::Duration;

use flow_control::RetryConfig;
use serde::Serialize;

use crate::domain::TokenData;

/// Where the tokens in a [`RefreshResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Cache,
    Vault,
    /// Issued by the provider for this request (or the refresh it joined).
    Refresh,
    /// No tokens were produced.
    None,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cache => "cache",
            Self::Vault => "vault",
            Self::Refresh => "refresh",
            Self::None => "none",
        })
    }
}

/// Outcome of asking for a usable token.
///
/// Callers must treat `requires_reauth` as "prompt the user to re-link",
/// never as "try again".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshResult {
    pub success: bool,
    pub tokens: Option<TokenData>,
    pub requires_reauth: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Whether an OAuth refresh produced these tokens.
    pub refreshed: bool,
    pub source: TokenSource,
}

impl RefreshResult {
    pub fn ok(tokens: TokenData, source: TokenSource, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            tokens: Some(tokens),
            requires_reauth: false,
            error: None,
            elapsed_ms,
            refreshed: source == TokenSource::Refresh,
            source,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            tokens: None,
            requires_reauth: false,
            error: Some(error.into()),
            elapsed_ms,
            refreshed: false,
            source: TokenSource::None,
        }
    }

    pub fn reauth(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            requires_reauth: true,
            ..Self::failed(error, elapsed_ms)
        }
    }

    pub(crate) fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// Access token, if the call succeeded.
    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }
}

/// Refresh coordinator settings.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Refresh once a token is this close to expiry.
    pub refresh_threshold: Duration,
    /// Budget for the OAuth call.
    pub retry: RetryConfig,
    /// Budget for persisting refreshed tokens in the background after the
    /// first vault write failed.
    pub persist_retry: RetryConfig,
    /// Lifetime of the cross-process refresh lease.
    pub lease_ttl: Duration,
    /// How often to re-read the vault while another process refreshes.
    pub lease_poll_interval: Duration,
    pub lease_poll_attempts: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(5 * 60),
            retry: RetryConfig::new(2, 500, 5_000),
            persist_retry: RetryConfig::new(5, 1_000, 30_000),
            lease_ttl: Duration::from_secs(30),
            lease_poll_interval: Duration::from_millis(500),
            lease_poll_attempts: 10,
        }
    }
}

impl RefreshConfig {
    pub fn threshold_ms(&self) -> i64 {
        self.refresh_threshold.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let ok = RefreshResult::ok(TokenData::new("a", "r", 0), TokenSource::Refresh, 3);
        assert!(ok.success && ok.refreshed && !ok.requires_reauth);
        assert_eq!(ok.access_token(), Some("a"));

        let cached = RefreshResult::ok(TokenData::new("a", "r", 0), TokenSource::Cache, 0);
        assert!(!cached.refreshed);

        let reauth = RefreshResult::reauth("invalid_grant", 5);
        assert!(!reauth.success && reauth.requires_reauth);
        assert_eq!(reauth.source, TokenSource::None);
    }

    #[test]
    fn test_default_config() {
        let config = RefreshConfig::default();
        assert_eq!(config.threshold_ms(), 300_000);
        assert_eq!(config.retry.total_attempts(), 3);
    }
}

//! OAuth token material.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An access/refresh token pair as issued by the provider.
///
/// Immutable: a refresh produces a new value instead of mutating this one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch milliseconds (UTC) when the access token expires.
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenData {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            token_type: default_token_type(),
            scope: String::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Milliseconds until expiry at `now_ms` (negative once expired).
    #[inline]
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.expires_at - now_ms
    }

    #[inline]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.remaining_ms(now_ms) <= 0
    }

    /// Whether the token expires within `threshold_ms` of `now_ms`.
    #[inline]
    pub fn expires_within(&self, now_ms: i64, threshold_ms: i64) -> bool {
        self.remaining_ms(now_ms) <= threshold_ms
    }

    #[inline]
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("<redacted:{}>", secret.len())
    }
}

/// Refresh lifecycle of a principal's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    /// Cached and not close to expiry.
    Fresh,
    /// Within the refresh threshold of `expires_at`.
    NearExpiry,
    /// A refresh is in flight.
    Refreshing,
    /// The refresh token was rejected; the user must re-link the account.
    ReauthRequired,
    /// No live secret is stored for the principal.
    Unknown,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::NearExpiry => "NEAR_EXPIRY",
            Self::Refreshing => "REFRESHING",
            Self::ReauthRequired => "REAUTH_REQUIRED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

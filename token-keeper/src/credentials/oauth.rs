//! OAuth refresh-token grant client.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::TokenData;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Errors from the provider's token endpoint.
#[derive(Debug, Clone, Error)]
pub enum OAuthError {
    /// Non-2xx response.
    #[error("Token endpoint returned {status}: {}", .error.as_deref().unwrap_or("unknown_error"))]
    Status {
        status: u16,
        /// OAuth `error` code, e.g. `invalid_grant`.
        error: Option<String>,
        description: Option<String>,
    },

    /// The request never produced a response.
    #[error("Network error: {0}")]
    Network(String),

    /// A 2xx response that is not a token response.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The stored secret has no refresh token to exchange.
    #[error("No refresh token available")]
    MissingRefreshToken,
}

impl OAuthError {
    /// The refresh token itself was rejected; only the user can fix this.
    pub fn requires_reauth(&self) -> bool {
        match self {
            Self::Status { status, error, .. } => {
                matches!(status, 400 | 401)
                    && matches!(error.as_deref(), Some("invalid_grant") | Some("invalid_token"))
            }
            Self::MissingRefreshToken => true,
            Self::Network(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::InvalidResponse(_) | Self::MissingRefreshToken => false,
        }
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Successful body of a refresh-token grant.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthTokenResponse {
    /// Build the replacement tokens.
    ///
    /// Providers that do not rotate refresh tokens omit it; the previous one
    /// stays valid and is kept. The same applies to `token_type` and `scope`.
    pub fn into_token_data(self, previous: &TokenData, now_ms: i64) -> TokenData {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).max(0);
        TokenData {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| previous.refresh_token.clone()),
            expires_at: now_ms.saturating_add(expires_in.saturating_mul(1000)),
            token_type: self
                .token_type
                .unwrap_or_else(|| previous.token_type.clone()),
            scope: self.scope.unwrap_or_else(|| previous.scope.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges a refresh token for new tokens.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResponse, OAuthError>;
}

/// Endpoint and client credentials for [`HttpOAuthClient`].
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `grant_type=refresh_token` over HTTPS.
pub struct HttpOAuthClient {
    config: OAuthClientConfig,
    client: reqwest::Client,
}

impl HttpOAuthClient {
    pub fn new(config: OAuthClientConfig) -> Result<Self, OAuthError> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("token-keeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResponse, OAuthError> {
        if refresh_token.is_empty() {
            return Err(OAuthError::MissingRefreshToken);
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<OAuthErrorBody>(&body).ok();
            debug!(status = status.as_u16(), "Token endpoint rejected refresh");
            return Err(OAuthError::Status {
                status: status.as_u16(),
                error: parsed.as_ref().and_then(|b| b.error.clone()),
                description: parsed.and_then(|b| b.error_description),
            });
        }

        Ok(response.json::<OAuthTokenResponse>().await?)
    }
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, error: &str) -> OAuthError {
        OAuthError::Status {
            status: code,
            error: Some(error.to_string()),
            description: None,
        }
    }

    #[test]
    fn test_invalid_grant_requires_reauth() {
        assert!(status(400, "invalid_grant").requires_reauth());
        assert!(status(401, "invalid_grant").requires_reauth());
        assert!(!status(400, "invalid_grant").is_transient());
        assert!(!status(400, "invalid_request").requires_reauth());
        assert!(OAuthError::MissingRefreshToken.requires_reauth());
    }

    #[test]
    fn test_transient_statuses() {
        assert!(status(503, "temporarily_unavailable").is_transient());
        assert!(status(429, "slow_down").is_transient());
        assert!(OAuthError::Network("connection reset".into()).is_transient());
        assert!(!status(403, "access_denied").is_transient());
        assert!(!OAuthError::InvalidResponse("eof".into()).is_transient());
    }

    #[test]
    fn test_response_keeps_previous_refresh_token() {
        let previous = TokenData::new("old", "refresh-1", 0).with_scope("read");
        let response: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"new","expires_in":600}"#).unwrap();
        let tokens = response.into_token_data(&previous, 1_000);
        assert_eq!(tokens.access_token, "new");
        assert_eq!(tokens.refresh_token, "refresh-1");
        assert_eq!(tokens.expires_at, 601_000);
        assert_eq!(tokens.scope, "read");
        assert_eq!(tokens.token_type, "Bearer");
    }

    #[test]
    fn test_response_rotates_refresh_token() {
        let previous = TokenData::new("old", "refresh-1", 0);
        let response: OAuthTokenResponse = serde_json::from_str(
            r#"{"access_token":"new","refresh_token":"refresh-2","token_type":"bearer"}"#,
        )
        .unwrap();
        let tokens = response.into_token_data(&previous, 0);
        assert_eq!(tokens.refresh_token, "refresh-2");
        assert_eq!(tokens.token_type, "bearer");
        assert_eq!(tokens.expires_at, 3_600_000);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            status(400, "invalid_grant").to_string(),
            "Token endpoint returned 400: invalid_grant"
        );
    }
}

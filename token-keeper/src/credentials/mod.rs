//! Token refresh: OAuth client, single-flight coordinator and its metrics.

pub mod coordinator;
pub mod metrics;
pub mod oauth;
pub mod types;

pub use coordinator::TokenRefreshCoordinator;
pub use metrics::RefreshMetricsSnapshot;
pub use oauth::{HttpOAuthClient, OAuthClient, OAuthClientConfig, OAuthError, OAuthTokenResponse};
pub use types::{RefreshConfig, RefreshResult, TokenSource};

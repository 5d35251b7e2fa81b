//! Process configuration loaded from environment variables.
//!
//! `.env` is loaded by [`AppConfig::from_env`] when present. Validation runs
//! at load time so a misconfigured process refuses to start.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::credentials::{OAuthClientConfig, RefreshConfig};
use crate::maintenance::MaintenanceConfig;
use crate::{Error, Result};

/// Minimum accepted encryption key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

const DEFAULT_DATABASE_URL: &str = "sqlite:token-keeper.db?mode=rwc";
const DEFAULT_OAUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Values that must never be used as a production key.
const PLACEHOLDER_KEYS: &[&str] = &[
    "changeme",
    "change-me",
    "change_me",
    "placeholder",
    "default",
    "secret",
    "development-key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(Error::config(format!("Unknown TOKEN_KEEPER_ENV: {other}"))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        })
    }
}

/// Full application configuration.
#[derive(Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub database_url: String,
    pub encryption_key: String,
    /// Retired keys still accepted for decryption during rotation.
    pub previous_keys: Vec<String>,
    pub oauth: OAuthClientConfig,
    pub refresh: RefreshConfig,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub maintenance: MaintenanceConfig,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("encryption_key", &"[REDACTED]")
            .field("previous_keys", &self.previous_keys.len())
            .field("oauth", &self.oauth)
            .field("refresh", &self.refresh)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_sweep_interval", &self.cache_sweep_interval)
            .field("maintenance", &self.maintenance)
            .field("log_dir", &self.log_dir)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let environment = match var("TOKEN_KEEPER_ENV") {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };

        let encryption_key = var("TOKEN_KEEPER_ENCRYPTION_KEY")
            .ok_or_else(|| Error::config("TOKEN_KEEPER_ENCRYPTION_KEY must be set"))?;
        let previous_keys = var("TOKEN_KEEPER_PREVIOUS_KEYS")
            .map(|keys| {
                keys.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let oauth = OAuthClientConfig {
            token_url: var("OAUTH_TOKEN_URL")
                .ok_or_else(|| Error::config("OAUTH_TOKEN_URL must be set"))?,
            client_id: var("OAUTH_CLIENT_ID")
                .ok_or_else(|| Error::config("OAUTH_CLIENT_ID must be set"))?,
            client_secret: var("OAUTH_CLIENT_SECRET").unwrap_or_default(),
            timeout: DEFAULT_OAUTH_TIMEOUT,
        };

        let mut refresh = RefreshConfig::default();
        if let Some(secs) = parse_secs(&var, "TOKEN_KEEPER_REFRESH_THRESHOLD_SECS")? {
            refresh.refresh_threshold = secs;
        }

        let cache_ttl = parse_secs(&var, "TOKEN_KEEPER_CACHE_TTL_SECS")?
            .unwrap_or(crate::cache::DEFAULT_TTL);
        let cache_sweep_interval = parse_secs(&var, "TOKEN_KEEPER_CACHE_SWEEP_SECS")?
            .unwrap_or(crate::cache::DEFAULT_SWEEP_INTERVAL);

        let mut maintenance = MaintenanceConfig::default();
        if let Some(days) = var("TOKEN_KEEPER_RETENTION_DAYS") {
            let days: u64 = days.parse().map_err(|_| {
                Error::config(format!("TOKEN_KEEPER_RETENTION_DAYS is not a number: {days}"))
            })?;
            maintenance.retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(cron) = var("TOKEN_KEEPER_CLEANUP_CRON") {
            maintenance.cleanup_cron = cron;
        }
        if let Some(cron) = var("TOKEN_KEEPER_ROTATION_CRON") {
            maintenance.rotation_cron = cron;
        }
        if let Some(cron) = var("TOKEN_KEEPER_SWEEP_CRON") {
            maintenance.sweep_cron = cron;
        }

        let log_json = var("TOKEN_KEEPER_LOG_JSON")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let config = Self {
            environment,
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            encryption_key,
            previous_keys,
            oauth,
            refresh,
            cache_ttl,
            cache_sweep_interval,
            maintenance,
            log_dir: var("TOKEN_KEEPER_LOG_DIR").map(PathBuf::from),
            log_json,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would store secrets under a weak key.
    pub fn validate(&self) -> Result<()> {
        validate_key("TOKEN_KEEPER_ENCRYPTION_KEY", &self.encryption_key, self.environment)?;
        for key in &self.previous_keys {
            validate_key("TOKEN_KEEPER_PREVIOUS_KEYS", key, self.environment)?;
        }
        if self.previous_keys.contains(&self.encryption_key) {
            return Err(Error::config(
                "TOKEN_KEEPER_PREVIOUS_KEYS must not contain the primary key",
            ));
        }
        if !self.oauth.token_url.starts_with("https://")
            && !self.oauth.token_url.starts_with("http://")
        {
            return Err(Error::config(format!(
                "OAUTH_TOKEN_URL must be an http(s) URL: {}",
                self.oauth.token_url
            )));
        }
        if self.environment.is_production() && !self.oauth.token_url.starts_with("https://") {
            return Err(Error::config("OAUTH_TOKEN_URL must use https in production"));
        }
        if self.cache_ttl.is_zero() {
            return Err(Error::config("TOKEN_KEEPER_CACHE_TTL_SECS must be positive"));
        }
        Ok(())
    }
}

fn validate_key(name: &str, key: &str, environment: Environment) -> Result<()> {
    if environment.is_production() && is_placeholder(key) {
        return Err(Error::config(format!(
            "{name} is a placeholder value and cannot be used in production"
        )));
    }
    if key.len() < MIN_KEY_LEN {
        return Err(Error::config(format!(
            "{name} must be at least {MIN_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

fn is_placeholder(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    let repeated = key
        .chars()
        .next()
        .is_some_and(|first| key.chars().all(|c| c == first));
    repeated || PLACEHOLDER_KEYS.iter().any(|p| lowered.contains(p))
}

fn parse_secs<F>(var: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| Error::config(format!("{name} is not a number of seconds: {v}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0123456789abcdef0123456789abcdef-primary";

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let mut map: HashMap<String, String> = [
            ("TOKEN_KEEPER_ENCRYPTION_KEY", KEY),
            ("OAUTH_TOKEN_URL", "https://auth.example.com/oauth/token"),
            ("OAUTH_CLIENT_ID", "client"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in vars {
            map.insert(k.to_string(), v.to_string());
        }
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.refresh.refresh_threshold, Duration::from_secs(300));
        assert!(config.previous_keys.is_empty());
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TOKEN_KEEPER_ENV", "production"),
            ("TOKEN_KEEPER_REFRESH_THRESHOLD_SECS", "120"),
            ("TOKEN_KEEPER_RETENTION_DAYS", "7"),
            ("TOKEN_KEEPER_SWEEP_CRON", "0 30 1 * * *"),
            ("TOKEN_KEEPER_PREVIOUS_KEYS", " fedcba9876543210fedcba9876543210-old , "),
            ("TOKEN_KEEPER_LOG_JSON", "true"),
        ])
        .unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.refresh.refresh_threshold, Duration::from_secs(120));
        assert_eq!(config.maintenance.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(config.maintenance.sweep_cron, "0 30 1 * * *");
        assert_eq!(config.previous_keys, vec!["fedcba9876543210fedcba9876543210-old"]);
        assert!(config.log_json);
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = load(&[("TOKEN_KEEPER_ENCRYPTION_KEY", "  ")]).unwrap_err();
        assert!(err.to_string().contains("TOKEN_KEEPER_ENCRYPTION_KEY must be set"));
    }

    #[test]
    fn test_short_key_rejected() {
        let err = load(&[("TOKEN_KEEPER_ENCRYPTION_KEY", "too-short")]).unwrap_err();
        assert!(err.to_string().contains("at least 32 bytes"));
    }

    #[test]
    fn test_placeholder_key_rejected_in_production() {
        let placeholder = "changeme-changeme-changeme-changeme";
        assert!(load(&[("TOKEN_KEEPER_ENCRYPTION_KEY", placeholder)]).is_ok());
        let err = load(&[
            ("TOKEN_KEEPER_ENCRYPTION_KEY", placeholder),
            ("TOKEN_KEEPER_ENV", "prod"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn test_bad_numbers_and_env() {
        assert!(load(&[("TOKEN_KEEPER_CACHE_TTL_SECS", "soon")]).is_err());
        assert!(load(&[("TOKEN_KEEPER_CACHE_TTL_SECS", "0")]).is_err());
        assert!(load(&[("TOKEN_KEEPER_ENV", "staging")]).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = load(&[]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains(KEY));
        assert!(debug.contains("[REDACTED]"));
    }
}

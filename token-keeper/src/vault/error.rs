//! Vault and storage error types.

use std::borrow::Cow;

use thiserror::Error;

/// Errors raised by an [`EncryptedStorage`](super::EncryptedStorage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or asked us to back off.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Sealing or opening a value failed (wrong key, tampered ciphertext).
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Database error from the SQLite backend.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored bytes do not decode to a record.
    #[error("Corrupted value at {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Database(err) => is_transient_sqlx(err),
            Self::Crypto(_) | Self::Corrupted { .. } => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            if matches!(code.as_deref(), Some("5") | Some("6")) {
                return true;
            }
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        other => flow_control::is_retryable_error(&other.to_string()),
    }
}

/// Errors returned by [`SecretVault`](super::SecretVault).
#[derive(Debug, Error)]
pub enum VaultError {
    /// No live record for the principal.
    #[error("No live secret for principal {0}")]
    NotFound(String),

    /// A live record already exists for the principal.
    #[error("A live secret already exists for principal {0}")]
    AlreadyExists(String),

    #[error("Invalid principal id: {0}")]
    InvalidPrincipal(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Whether the failure was transient (retries were exhausted).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[inline]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

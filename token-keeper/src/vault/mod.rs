//! Encrypted secret vault.
//!
//! [`SecretVault`] owns the record lifecycle (create, update, soft/hard
//! delete, restore, retention purge, key rotation). Encryption at rest is
//! delegated to an [`EncryptedStorage`] backend.

pub mod cipher;
pub mod error;
pub mod metrics;
pub mod service;
pub mod sqlite;
pub mod storage;
pub mod types;

pub use cipher::Keyring;
pub use error::{StorageError, VaultError};
pub use metrics::{OpStats, VaultMetricsSnapshot, VaultOp};
pub use service::{SecretVault, default_storage_retry};
pub use sqlite::SqliteStorage;
pub use storage::{EncryptedStorage, MemoryStorage};
pub use types::{DeleteMode, DeleteOutcome, RotationReport, SecretRecord};

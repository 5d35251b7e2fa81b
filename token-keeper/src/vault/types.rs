//! Persisted vault records.

use serde::{Deserialize, Serialize};

use crate::domain::TokenData;

pub(crate) const LIVE_PREFIX: &str = "live/";
pub(crate) const DELETED_PREFIX: &str = "deleted/";

/// The vault's persisted unit.
///
/// The whole record is serialized and handed to the storage backend, which
/// seals it at rest; the token payload never reaches disk in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub principal_id: String,
    pub tokens: TokenData,
    /// Starts at 1 and increments on every in-place update.
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub deletion_reason: Option<String>,
}

impl SecretRecord {
    pub fn new(principal_id: impl Into<String>, tokens: TokenData, now_ms: i64) -> Self {
        Self {
            principal_id: principal_id.into(),
            tokens,
            version: 1,
            created_at: now_ms,
            updated_at: now_ms,
            deleted_at: None,
            deletion_reason: None,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// A copy with new tokens and the next version.
    pub fn updated(&self, tokens: TokenData, now_ms: i64) -> Self {
        Self {
            tokens,
            version: self.version + 1,
            updated_at: now_ms,
            ..self.clone()
        }
    }

    /// A copy marked as soft-deleted.
    pub fn soft_deleted(&self, now_ms: i64, reason: Option<&str>) -> Self {
        Self {
            deleted_at: Some(now_ms),
            deletion_reason: reason.map(str::to_string),
            updated_at: now_ms,
            ..self.clone()
        }
    }

    /// A live copy of a soft-deleted record.
    pub fn restored(&self, now_ms: i64) -> Self {
        Self {
            deleted_at: None,
            deletion_reason: None,
            version: self.version + 1,
            updated_at: now_ms,
            ..self.clone()
        }
    }
}

/// How [`SecretVault::delete`](super::SecretVault::delete) removes a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Hide the record from reads but retain it for audit. Operators can restore it.
    #[default]
    Soft,
    /// Physically remove the live record and every retained copy.
    Hard,
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub mode: DeleteMode,
    /// 200 for a soft delete, 204 for a hard delete.
    pub status_code: u16,
    /// Number of stored values removed or moved.
    pub affected: usize,
}

/// Result of re-encrypting every stored secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub total: usize,
    /// Values rewritten under the primary key.
    pub rotated: usize,
    /// Values already sealed with the primary key.
    pub unchanged: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

pub(crate) fn live_key(principal_id: &str) -> String {
    format!("{LIVE_PREFIX}{principal_id}")
}

pub(crate) fn deleted_prefix(principal_id: &str) -> String {
    format!("{DELETED_PREFIX}{principal_id}/")
}

/// Zero-padded so keys sort chronologically.
pub(crate) fn deleted_key(principal_id: &str, deleted_at: i64) -> String {
    format!("{}{:020}", deleted_prefix(principal_id), deleted_at.max(0))
}

/// Extract the deletion timestamp from a `deleted/{principal}/{ms}` key.
pub(crate) fn deleted_at_from_key(key: &str) -> Option<i64> {
    key.strip_prefix(DELETED_PREFIX)?
        .rsplit_once('/')
        .and_then(|(_, ms)| ms.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SecretRecord {
        SecretRecord::new("u1", TokenData::new("a", "r", 100), 10)
    }

    #[test]
    fn test_update_bumps_version() {
        let updated = record().updated(TokenData::new("b", "r2", 200), 20);
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, 10);
        assert_eq!(updated.updated_at, 20);
        assert_eq!(updated.tokens.access_token, "b");
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let deleted = record().soft_deleted(30, Some("account unlinked"));
        assert!(!deleted.is_live());
        assert_eq!(deleted.deletion_reason.as_deref(), Some("account unlinked"));

        let restored = deleted.restored(40);
        assert!(restored.is_live());
        assert_eq!(restored.version, 2);
        assert!(restored.deletion_reason.is_none());
    }

    #[test]
    fn test_deleted_keys_sort_and_parse() {
        let early = deleted_key("u1", 5);
        let late = deleted_key("u1", 1_700_000_000_000);
        assert!(early < late);
        assert_eq!(deleted_at_from_key(&late), Some(1_700_000_000_000));
        assert_eq!(deleted_at_from_key("live/u1"), None);
    }
}

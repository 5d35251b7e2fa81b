//! SQLite-backed encrypted storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::cipher::{Keyring, SealedValue};
use super::error::StorageError;
use super::storage::EncryptedStorage;
use crate::clock::SharedClock;

#[derive(Debug, Clone, sqlx::FromRow)]
struct SecretRowDbModel {
    key_id: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl From<SecretRowDbModel> for SealedValue {
    fn from(row: SecretRowDbModel) -> Self {
        Self {
            key_id: row.key_id,
            nonce: row.nonce,
            ciphertext: row.ciphertext,
        }
    }
}

/// Stores values in the `secret_store` table, sealed with AES-256-GCM.
///
/// The storage key is bound to each ciphertext as associated data, so a row
/// copied under another key fails to open.
pub struct SqliteStorage {
    pool: SqlitePool,
    keyring: Arc<Keyring>,
    clock: SharedClock,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool, keyring: Arc<Keyring>, clock: SharedClock) -> Self {
        Self {
            pool,
            keyring,
            clock,
        }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Row count per key id, for rotation progress.
    pub async fn key_id_counts(&self) -> Result<Vec<(String, i64)>, StorageError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT key_id, COUNT(*) FROM secret_store GROUP BY key_id ORDER BY key_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn fetch_sealed(&self, key: &str) -> Result<Option<SealedValue>, StorageError> {
        let row = sqlx::query_as::<_, SecretRowDbModel>(
            "SELECT key_id, nonce, ciphertext FROM secret_store WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SealedValue::from))
    }
}

#[async_trait]
impl EncryptedStorage for SqliteStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.fetch_sealed(key).await? {
            Some(sealed) => self.keyring.open(key.as_bytes(), &sealed).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let sealed = self.keyring.seal(key.as_bytes(), value)?;
        sqlx::query(
            r#"
            INSERT INTO secret_store (key, key_id, nonce, ciphertext, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                key_id = excluded.key_id,
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&sealed.key_id)
        .bind(&sealed.nonce)
        .bind(&sealed.ciphertext)
        .bind(self.clock.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM secret_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM secret_store WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn reencrypt(&self, key: &str) -> Result<bool, StorageError> {
        let Some(sealed) = self.fetch_sealed(key).await? else {
            return Ok(false);
        };
        if self.keyring.is_primary(&sealed.key_id) {
            return Ok(false);
        }

        let plaintext = self.keyring.open(key.as_bytes(), &sealed)?;
        let resealed = self.keyring.seal(key.as_bytes(), &plaintext)?;

        // Only replace the row we decrypted; a concurrent write already used the primary key.
        let result = sqlx::query(
            r#"
            UPDATE secret_store
            SET key_id = ?, nonce = ?, ciphertext = ?, updated_at = ?
            WHERE key = ? AND key_id = ? AND nonce = ?
            "#,
        )
        .bind(&resealed.key_id)
        .bind(&resealed.nonce)
        .bind(&resealed.ciphertext)
        .bind(self.clock.now_ms())
        .bind(key)
        .bind(&sealed.key_id)
        .bind(&sealed.nonce)
        .execute(&self.pool)
        .await?;

        let rotated = result.rows_affected() > 0;
        debug!(key, from = %sealed.key_id, to = %resealed.key_id, rotated, "Re-encrypted secret");
        Ok(rotated)
    }

    async fn try_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let result = sqlx::query(
            r#"
            INSERT INTO secret_lease (name, owner, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE secret_lease.owner = excluded.owner OR secret_lease.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM secret_lease WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::{init_pool, run_migrations};

    const KEY_A: &str = "0123456789abcdef0123456789abcdef";
    const KEY_B: &str = "fedcba9876543210fedcba9876543210";

    async fn setup(dir: &tempfile::TempDir) -> SqlitePool {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("vault.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn storage(pool: &SqlitePool, primary: &str, previous: &[&str], clock: SharedClock) -> SqliteStorage {
        let keyring = Arc::new(Keyring::new(primary, previous).unwrap());
        SqliteStorage::new(pool.clone(), keyring, clock)
    }

    #[tokio::test]
    async fn test_values_are_sealed_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup(&dir).await;
        let store = storage(&pool, KEY_A, &[], Arc::new(ManualClock::new(0)));

        store.write("live/u1", b"super-secret").await.unwrap();
        assert_eq!(store.read("live/u1").await.unwrap(), Some(b"super-secret".to_vec()));

        let raw: (Vec<u8>,) = sqlx::query_as("SELECT ciphertext FROM secret_store WHERE key = ?")
            .bind("live/u1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!raw.0.windows(12).any(|w| w == b"super-secret"));

        assert_eq!(store.list("live/").await.unwrap(), vec!["live/u1"]);
        assert!(store.list("deleted/").await.unwrap().is_empty());
        assert!(store.delete("live/u1").await.unwrap());
        assert_eq!(store.read("live/u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reencrypt_moves_rows_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup(&dir).await;
        let clock: SharedClock = Arc::new(ManualClock::new(0));

        let old = storage(&pool, KEY_A, &[], clock.clone());
        old.write("live/u1", b"one").await.unwrap();
        old.write("live/u2", b"two").await.unwrap();

        let rotated = storage(&pool, KEY_B, &[KEY_A], clock);
        assert!(rotated.reencrypt("live/u1").await.unwrap());
        assert!(!rotated.reencrypt("live/u1").await.unwrap());
        assert!(!rotated.reencrypt("live/missing").await.unwrap());

        let counts = rotated.key_id_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(rotated.read("live/u1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(rotated.read("live/u2").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_lease_respects_owner_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup(&dir).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let store = storage(&pool, KEY_A, &[], clock.clone());
        let ttl = Duration::from_secs(30);

        assert!(store.try_lease("refresh/u1", "a", ttl).await.unwrap());
        assert!(!store.try_lease("refresh/u1", "b", ttl).await.unwrap());
        assert!(store.try_lease("refresh/u1", "a", ttl).await.unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(store.try_lease("refresh/u1", "b", ttl).await.unwrap());

        store.release_lease("refresh/u1", "b").await.unwrap();
        assert!(store.try_lease("refresh/u1", "a", ttl).await.unwrap());
    }
}

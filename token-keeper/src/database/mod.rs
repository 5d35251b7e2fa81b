//! SQLite connection pool and embedded migrations.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

pub type DbPool = Pool<Sqlite>;

/// Connection settings for the secret store database.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Open (creating if needed) the secret store in WAL mode.
pub async fn init_pool_with(database_url: &str, settings: PoolSettings) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(settings.busy_timeout)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(connect_options)
        .await?;

    info!(
        max_connections = settings.max_connections,
        busy_timeout_ms = settings.busy_timeout.as_millis() as u64,
        "Secret store pool opened"
    );
    Ok(pool)
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with(database_url, PoolSettings::default()).await
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    let migrator = sqlx::migrate!("./migrations");
    debug!(count = migrator.iter().count(), "Applying secret store migrations");
    migrator.run(pool).await?;
    info!("Secret store schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, "wal");

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"secret_store"));
        assert!(names.contains(&"secret_lease"));
    }
}

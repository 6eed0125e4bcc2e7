//! Database connection and schema management.
//!
//! SQLite connectivity for the engine: connection pool, WAL mode for
//! concurrent readers alongside the single-writer discipline, foreign keys,
//! and automatic migration execution.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Maximum number of pooled connections. Kept low: SQLite uses file-level
/// locking and the store funnels all writes through short transactions.
const MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a lock before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-level errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect or execute a pragma.
    #[error("failed to open database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Connection pool wrapper shared by every store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if absent) the database file and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pool cannot be established or
    /// [`DbError::Migration`] if a migration fails.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] or [`DbError::Migration`] on failure.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns the underlying pool for query execution.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all pooled connections.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO downloads (id, created_at, updated_at, original_url, dest_dir, status)
             VALUES ('d1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z',
                     'https://example.com/a', '/tmp', 'QUEUED')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "downloads table should exist: {result:?}");
    }

    #[tokio::test]
    async fn test_open_file_backed_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.sqlite3"))
            .await
            .unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_segment_rows_cascade_with_download() {
        let db = Database::open_in_memory().await.unwrap();

        sqlx::query(
            "INSERT INTO downloads (id, created_at, updated_at, original_url, dest_dir, status)
             VALUES ('d1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z',
                     'https://example.com/a', '/tmp', 'QUEUED')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO download_segments (download_id, ordinal, range_start, range_end_exclusive)
             VALUES ('d1', 0, 0, 100)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        sqlx::query("DELETE FROM downloads WHERE id = 'd1'")
            .execute(db.pool())
            .await
            .unwrap();

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM download_segments WHERE download_id = 'd1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 0, "segments must be deleted with their download");
    }
}

//! Persistence store over the SQLite pool.
//!
//! Five logical tables: `downloads`, `download_segments`, `batches`,
//! `settings`, and the rule tables. All writes go through this module in
//! short transactions; no business logic runs inside a transaction. Store
//! failures are fatal to the affected operation and never silently dropped.

mod rules;
mod settings;

use sqlx::Row;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::db::Database;
use crate::download::error::ErrorCode;
use crate::model::{now_rfc3339, BatchRecord, DownloadRecord, DownloadStatus, SegmentRecord};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store. Distinct from network errors by design:
/// callers must not confuse a failed checkpoint with a failed transfer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No download row with the given ID.
    #[error("download not found: {0}")]
    DownloadNotFound(String),

    /// Rule IDs are assigned by the store; negative values are UI-only
    /// placeholders and are rejected on upsert.
    #[error("invalid rule id: {0}")]
    InvalidRuleId(i64),
}

/// Repository for all persisted engine state.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.db.pool()
    }

    // ---- downloads ----

    /// Inserts a new QUEUED download row and returns its generated ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self), fields(url = %original_url))]
    pub async fn insert_download(
        &self,
        original_url: &str,
        dest_dir: &str,
        forced_proxy_url: Option<&str>,
        batch_id: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        sqlx::query(
            r"INSERT INTO downloads
                  (id, created_at, updated_at, original_url, dest_dir,
                   forced_proxy_url, batch_id, status, bytes_downloaded)
              VALUES (?, ?, ?, ?, ?, ?, ?, 'QUEUED', 0)",
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .bind(original_url)
        .bind(dest_dir)
        .bind(forced_proxy_url)
        .bind(batch_id)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Lists all downloads, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Fetches one download by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_download(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query_as::<_, DownloadRecord>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Returns the oldest QUEUED download not in `exclude`, FIFO admission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, exclude))]
    pub async fn next_queued(&self, exclude: &[String]) -> Result<Option<DownloadRecord>> {
        let rows = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads WHERE status = 'QUEUED' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().find(|r| !exclude.contains(&r.id)))
    }

    /// Applies a status transition as one atomic write.
    ///
    /// `started_at` is stamped on the first transition to DOWNLOADING and
    /// `completed_at` on COMPLETED.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] if no row matched, or
    /// [`StoreError::Database`] on failure.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn update_status(
        &self,
        id: &str,
        status: DownloadStatus,
        error_code: Option<ErrorCode>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let sql = match status {
            DownloadStatus::Downloading => {
                r"UPDATE downloads
                  SET updated_at = ?2, status = ?3, error_code = ?4, error_message = ?5,
                      started_at = COALESCE(started_at, ?2), completed_at = NULL
                  WHERE id = ?1"
            }
            DownloadStatus::Completed => {
                r"UPDATE downloads
                  SET updated_at = ?2, status = ?3, error_code = ?4, error_message = ?5,
                      completed_at = ?2
                  WHERE id = ?1"
            }
            _ => {
                r"UPDATE downloads
                  SET updated_at = ?2, status = ?3, error_code = ?4, error_message = ?5
                  WHERE id = ?1"
            }
        };
        let result = sqlx::query(sql)
            .bind(id)
            .bind(&now)
            .bind(status.as_str())
            .bind(error_code.map(|c| c.as_str()))
            .bind(error_message)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DownloadNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Records everything learned from the first successful probe: resolved
    /// URL, chosen filenames, wire facts, and the mirror in use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip_all, fields(id = %id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn record_probe(
        &self,
        id: &str,
        resolved_url: &str,
        temp_path: &str,
        final_filename: &str,
        content_length: Option<i64>,
        etag: Option<&str>,
        last_modified: Option<&str>,
        supports_ranges: Option<bool>,
        mirror_used: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE downloads
              SET updated_at = ?2, resolved_url = ?3, temp_path = ?4, final_filename = ?5,
                  content_length = ?6, etag = ?7, last_modified = ?8, supports_ranges = ?9,
                  mirror_used = ?10
              WHERE id = ?1",
        )
        .bind(id)
        .bind(now_rfc3339())
        .bind(resolved_url)
        .bind(temp_path)
        .bind(final_filename)
        .bind(content_length)
        .bind(etag)
        .bind(last_modified)
        .bind(supports_ranges)
        .bind(mirror_used)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Records the URL and mirror for the attempt currently in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn record_attempt_url(
        &self,
        id: &str,
        resolved_url: &str,
        mirror_used: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE downloads SET updated_at = ?2, resolved_url = ?3, mirror_used = ?4
              WHERE id = ?1",
        )
        .bind(id)
        .bind(now_rfc3339())
        .bind(resolved_url)
        .bind(mirror_used)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Checkpoints the authoritative byte counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn update_bytes(&self, id: &str, bytes_downloaded: i64) -> Result<()> {
        sqlx::query(r"UPDATE downloads SET updated_at = ?2, bytes_downloaded = ?3 WHERE id = ?1")
            .bind(id)
            .bind(now_rfc3339())
            .bind(bytes_downloaded)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Resets a download for an explicit retry: back to QUEUED, byte counter
    /// and validators cleared, segment rows wiped. One transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] or [`StoreError::Database`].
    #[instrument(skip(self))]
    pub async fn reset_for_retry(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r"UPDATE downloads
              SET updated_at = ?2, status = 'QUEUED', error_code = NULL, error_message = NULL,
                  bytes_downloaded = 0, supports_ranges = NULL, mirror_used = NULL,
                  etag = NULL, last_modified = NULL, temp_path = NULL
              WHERE id = ?1",
        )
        .bind(id)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DownloadNotFound(id.to_string()));
        }
        sqlx::query(r"DELETE FROM download_segments WHERE download_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes a download row; segment rows cascade.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: &str) -> Result<()> {
        sqlx::query(r"DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Removes every COMPLETED download. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_completed(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM downloads WHERE status = 'COMPLETED'")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Startup recovery: everything that is neither COMPLETED nor PAUSED is
    /// put back into QUEUED with its byte counter intact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn recover_unfinished(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET updated_at = ?1, status = 'QUEUED', error_code = NULL, error_message = NULL
              WHERE status NOT IN ('COMPLETED', 'PAUSED', 'QUEUED')",
        )
        .bind(now_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ---- segments ----

    /// Replaces the segment plan for a download in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any write fails.
    #[instrument(skip(self, segments), fields(count = segments.len()))]
    pub async fn replace_segments(
        &self,
        download_id: &str,
        segments: &[SegmentRecord],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(r"DELETE FROM download_segments WHERE download_id = ?")
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        for seg in segments {
            sqlx::query(
                r"INSERT INTO download_segments
                      (download_id, ordinal, range_start, range_end_exclusive, bytes_written, done)
                  VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(download_id)
            .bind(seg.ordinal)
            .bind(seg.range_start)
            .bind(seg.range_end_exclusive)
            .bind(seg.bytes_written)
            .bind(seg.done)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Lists a download's segments in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_segments(&self, download_id: &str) -> Result<Vec<SegmentRecord>> {
        let rows = sqlx::query_as::<_, SegmentRecord>(
            r"SELECT * FROM download_segments WHERE download_id = ? ORDER BY ordinal ASC",
        )
        .bind(download_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Checkpoints one segment's progress.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn update_segment(
        &self,
        download_id: &str,
        ordinal: i64,
        bytes_written: i64,
        done: bool,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE download_segments SET bytes_written = ?3, done = ?4
              WHERE download_id = ?1 AND ordinal = ?2",
        )
        .bind(download_id)
        .bind(ordinal)
        .bind(bytes_written)
        .bind(done)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ---- batches ----

    /// Creates a batch row and returns its generated ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, raw_url_list))]
    pub async fn insert_batch(
        &self,
        name: Option<&str>,
        dest_dir: &str,
        raw_url_list: Option<&str>,
        download_through_proxy: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r"INSERT INTO batches (id, created_at, name, dest_dir, raw_url_list,
                                   download_through_proxy)
              VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(now_rfc3339())
        .bind(name)
        .bind(dest_dir)
        .bind(raw_url_list)
        .bind(download_through_proxy)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Fetches one batch by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_batch(&self, id: &str) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRecord>(r"SELECT * FROM batches WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Counts downloads currently in a status. Test and diagnostics helper.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: DownloadStatus) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM downloads WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("count"))
    }
}

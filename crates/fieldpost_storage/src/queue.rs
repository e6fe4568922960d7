use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fieldpost_contract::{FailureReason, QueueStatus};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::info;

use crate::{apply_schema, open_pool, timestamp, StorageConfig};

const QUEUE_SCHEMA_SQL: &str = include_str!("sql/queue.sql");

const ITEM_COLUMNS: &str = "id, owner_type, owner_id, stage, client_visible, file_path, original_name, mime_type, status, attempts, last_error, created_at, updated_at";

/// A file staged for delivery, as handed to [`QueueStore::enqueue`].
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub client_visible: bool,
    pub file_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub client_visible: bool,
    pub file_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<FailureReason>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, FromRow)]
struct QueueItemRow {
    id: i64,
    owner_type: String,
    owner_id: i64,
    stage: String,
    client_visible: bool,
    file_path: String,
    original_name: String,
    mime_type: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = anyhow::Error;

    fn try_from(row: QueueItemRow) -> Result<Self> {
        let status = row
            .status
            .parse::<QueueStatus>()
            .with_context(|| format!("queue item {} has corrupt status", row.id))?;
        let last_error = row
            .last_error
            .as_deref()
            .map(str::parse::<FailureReason>)
            .transpose()
            .with_context(|| format!("queue item {} has corrupt last_error", row.id))?;
        let attempts = u32::try_from(row.attempts)
            .with_context(|| format!("queue item {} has corrupt attempts", row.id))?;

        Ok(QueueItem {
            id: row.id,
            owner_type: row.owner_type,
            owner_id: row.owner_id,
            stage: row.stage,
            client_visible: row.client_visible,
            file_path: PathBuf::from(row.file_path),
            original_name: row.original_name,
            mime_type: row.mime_type,
            status,
            attempts,
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Durable outbox of pending deliveries.
///
/// Cloning is cheap and every clone shares the pool and the change feed used
/// by [`QueueStore::observe_all`]. Each operation touches a single row.
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    revision: Arc<watch::Sender<u64>>,
}

impl QueueStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = open_pool(config).await?;
        apply_schema(&pool, QUEUE_SCHEMA_SQL).await?;
        info!(path = %config.sqlite_path, "upload queue schema ready");

        let (revision, _) = watch::channel(0);
        Ok(Self {
            pool,
            revision: Arc::new(revision),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn enqueue(&self, item: &NewQueueItem) -> Result<i64> {
        let now = timestamp(Utc::now());
        let file_path = item.file_path.to_string_lossy().into_owned();

        let result = sqlx::query(
            "INSERT INTO upload_queue(owner_type, owner_id, stage, client_visible, file_path, original_name, mime_type, status, attempts, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&item.owner_type)
        .bind(item.owner_id)
        .bind(&item.stage)
        .bind(item.client_visible)
        .bind(&file_path)
        .bind(&item.original_name)
        .bind(&item.mime_type)
        .bind(QueueStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("insert upload queue item")?;

        self.bump();
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM upload_queue WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query upload queue item {id}"))?;

        row.map(QueueItem::try_from).transpose()
    }

    /// Records the outcome of an attempt. `attempts` never moves backwards and
    /// `Sent` removes the row. Returns `false` when the row no longer exists.
    pub async fn update_state(
        &self,
        id: i64,
        status: QueueStatus,
        attempts: u32,
        last_error: Option<FailureReason>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        if status == QueueStatus::Sent {
            return self.delete(id).await;
        }

        let result = sqlx::query(
            "UPDATE upload_queue SET status = ?, attempts = MAX(attempts, ?), last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(i64::from(attempts))
        .bind(last_error.map(|reason| reason.to_string()))
        .bind(timestamp(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update upload queue item {id}"))?;

        self.bump();
        Ok(result.rows_affected() > 0)
    }

    /// Ids eligible for an attempt, oldest first, capped at `limit`.
    pub async fn list_due(&self, limit: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM upload_queue WHERE status IN (?, ?) ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::Failed.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("query due upload queue items")
    }

    /// Pending ids only, oldest first. Retained failed rows never take a
    /// slot in the batch.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM upload_queue WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("query pending upload queue items")
    }

    pub async fn list_all(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM upload_queue ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("query upload queue")?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    /// Live view of the queue: the current contents on subscription, then a
    /// fresh snapshot after every mutation made through this store.
    pub fn observe_all(&self) -> impl Stream<Item = Result<Vec<QueueItem>>> + Send + 'static {
        let store = self.clone();
        WatchStream::new(self.revision.subscribe()).then(move |_| {
            let store = store.clone();
            async move { store.list_all().await }
        })
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upload_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete upload queue item {id}"))?;

        self.bump();
        Ok(result.rows_affected() > 0)
    }

    /// Manual retry of a failed item. Attempts are kept.
    pub async fn requeue(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE upload_queue SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(timestamp(Utc::now()))
        .bind(id)
        .bind(QueueStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("requeue upload queue item {id}"))?;

        self.bump();
        Ok(result.rows_affected() > 0)
    }

    pub async fn requeue_failed_with(&self, reason: FailureReason) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "UPDATE upload_queue SET status = ?, updated_at = ? WHERE status = ? AND last_error = ? RETURNING id",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(timestamp(Utc::now()))
        .bind(QueueStatus::Failed.as_str())
        .bind(reason.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("requeue items failed with {reason}"))?;

        self.bump();
        Ok(ids)
    }

    /// Puts rows left `uploading` by a killed process back to `pending`.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE upload_queue SET status = ?, updated_at = ? WHERE status = ?")
            .bind(QueueStatus::Pending.as_str())
            .bind(timestamp(Utc::now()))
            .bind(QueueStatus::Uploading.as_str())
            .execute(&self.pool)
            .await
            .context("recover in-flight upload queue items")?;

        self.bump();
        Ok(result.rows_affected())
    }

    /// Deletes every failed row and returns the staged files they owned.
    pub async fn purge_failed(&self) -> Result<Vec<PathBuf>> {
        let paths = sqlx::query_scalar::<_, String>(
            "DELETE FROM upload_queue WHERE status = ? RETURNING file_path",
        )
        .bind(QueueStatus::Failed.as_str())
        .fetch_all(&self.pool)
        .await
        .context("purge failed upload queue items")?;

        self.bump();
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use fieldpost_contract::{FailureReason, QueueStatus, UploadMetadata, MAX_ATTEMPTS};
use fieldpost_storage::{QueueItem, QueueStore};
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialSource;
use crate::transport::{UploadRequest, UploadTransport};

/// What a single attempt did to its queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The server accepted the file; row and staged file are gone.
    Delivered { ids: Vec<i64> },
    /// No row for this id: delivered earlier or purged.
    AlreadyCompleted,
    /// The row is in a terminal state and is not retried automatically.
    Terminal { status: QueueStatus },
    /// Back to `Pending`; the scheduler should try again later.
    Retry { reason: FailureReason, attempts: u32 },
    /// Moved to `Failed`.
    Failed { reason: FailureReason, attempts: u32 },
    /// The queue store could not be read or written.
    StoreUnavailable,
}

impl AttemptOutcome {
    /// Attempt count to base the next backoff on, when another run is due.
    pub fn retry_after_attempts(&self) -> Option<u32> {
        match self {
            AttemptOutcome::Retry { attempts, .. } => Some(*attempts),
            AttemptOutcome::StoreUnavailable => Some(1),
            _ => None,
        }
    }
}

enum StagedFile {
    Present,
    Missing,
    Unreadable(std::io::Error),
}

async fn staged_file(path: &Path) -> StagedFile {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => StagedFile::Present,
        Ok(_) => StagedFile::Missing,
        Err(err) if err.kind() == ErrorKind::NotFound => StagedFile::Missing,
        Err(err) => StagedFile::Unreadable(err),
    }
}

/// Runs one delivery attempt for one queue item.
///
/// Every outcome ends up as a state transition in the queue store; nothing is
/// raised to the caller.
pub struct DeliveryWorker {
    store: QueueStore,
    transport: Arc<dyn UploadTransport>,
    credentials: Arc<dyn CredentialSource>,
    max_attempts: u32,
}

impl DeliveryWorker {
    pub fn new(
        store: QueueStore,
        transport: Arc<dyn UploadTransport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            store,
            transport,
            credentials,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub async fn run_attempt(&self, id: i64) -> AttemptOutcome {
        match self.attempt(id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(item_id = id, error = %err, "queue store unavailable during attempt");
                AttemptOutcome::StoreUnavailable
            }
        }
    }

    async fn attempt(&self, id: i64) -> Result<AttemptOutcome> {
        let Some(item) = self.store.get(id).await? else {
            debug!(item_id = id, "queue item absent; nothing to deliver");
            return Ok(AttemptOutcome::AlreadyCompleted);
        };

        if item.status.is_terminal() {
            debug!(item_id = id, status = %item.status, "queue item is terminal; skipping");
            return Ok(AttemptOutcome::Terminal {
                status: item.status,
            });
        }

        match staged_file(&item.file_path).await {
            StagedFile::Present => {}
            StagedFile::Missing => {
                return self
                    .fail(&item, item.attempts, FailureReason::FileMissing)
                    .await;
            }
            // Counted as an attempt below, when the read itself fails.
            StagedFile::Unreadable(err) => {
                warn!(item_id = id, path = %item.file_path.display(), error = %err, "staged file not accessible");
            }
        }

        let Some(token) = self.credentials.current_token().await else {
            return self
                .fail(&item, item.attempts, FailureReason::NotAuthenticated)
                .await;
        };

        let attempts = item.attempts.saturating_add(1);
        self.store
            .update_state(id, QueueStatus::Uploading, attempts, item.last_error, Utc::now())
            .await?;

        let content = match tokio::fs::read(&item.file_path).await {
            Ok(content) => content,
            Err(err) => {
                warn!(item_id = id, error = %err, "failed to read staged file");
                let reason = if err.kind() == ErrorKind::NotFound {
                    FailureReason::FileMissing
                } else {
                    FailureReason::LocalIo
                };
                return self.settle_failure(&item, attempts, reason).await;
            }
        };

        let request = UploadRequest {
            metadata: UploadMetadata {
                owner_type: item.owner_type.clone(),
                owner_id: item.owner_id,
                stage: item.stage.clone(),
                client_visible: item.client_visible,
            },
            file_name: item.original_name.clone(),
            declared_mime: item.mime_type.clone(),
            content,
        };

        match self.transport.upload(request, &token).await {
            Ok(receipt) => {
                self.store
                    .update_state(id, QueueStatus::Sent, attempts, None, Utc::now())
                    .await?;
                if let Err(err) = tokio::fs::remove_file(&item.file_path).await {
                    warn!(item_id = id, path = %item.file_path.display(), error = %err, "delivered but failed to remove staged file");
                }
                info!(item_id = id, attempts, server_ids = ?receipt.ids, "upload delivered");
                Ok(AttemptOutcome::Delivered { ids: receipt.ids })
            }
            Err(err) => {
                if err.is_unauthorized() {
                    self.credentials.invalidate().await;
                }
                let reason = err.classify();
                debug!(item_id = id, error = %err, reason = %reason, "upload attempt failed");
                self.settle_failure(&item, attempts, reason).await
            }
        }
    }

    async fn settle_failure(
        &self,
        item: &QueueItem,
        attempts: u32,
        reason: FailureReason,
    ) -> Result<AttemptOutcome> {
        if !reason.is_retryable() {
            return self.fail(item, attempts, reason).await;
        }
        if attempts >= self.max_attempts {
            return self.fail(item, attempts, reason).await;
        }

        self.store
            .update_state(item.id, QueueStatus::Pending, attempts, Some(reason), Utc::now())
            .await?;
        info!(item_id = item.id, attempts, reason = %reason, "upload will be retried");
        Ok(AttemptOutcome::Retry { reason, attempts })
    }

    async fn fail(
        &self,
        item: &QueueItem,
        attempts: u32,
        reason: FailureReason,
    ) -> Result<AttemptOutcome> {
        self.store
            .update_state(item.id, QueueStatus::Failed, attempts, Some(reason), Utc::now())
            .await?;
        warn!(
            item_id = item.id,
            attempts,
            reason = %reason.terminal(attempts, self.max_attempts),
            last_error = %reason,
            "upload failed permanently"
        );
        Ok(AttemptOutcome::Failed { reason, attempts })
    }
}

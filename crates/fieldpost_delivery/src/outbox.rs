use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fieldpost_contract::FailureReason;
use fieldpost_media::{sniff, strip_location_in_place, LocationOutcome, MediaKind};
use fieldpost_storage::{NewQueueItem, QueueItem, QueueStore};
use futures::Stream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// A captured or selected file on its way into the queue.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub source: PathBuf,
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub client_visible: bool,
    /// Defaults to the source file name.
    pub original_name: Option<String>,
    /// Defaults to the sniffed type. Advisory either way.
    pub mime_type: Option<String>,
}

/// Device-side entry point: stages files, queues them and keeps the
/// scheduler informed.
#[derive(Clone)]
pub struct Outbox {
    store: QueueStore,
    scheduler: Scheduler,
    staging_dir: PathBuf,
}

impl Outbox {
    pub fn new(store: QueueStore, scheduler: Scheduler, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scheduler,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Copies the source into the staging directory under a random name,
    /// strips location from JPEGs, queues the copy and schedules it.
    ///
    /// The source file is never modified. Returns the queue item id.
    pub async fn stage(&self, request: StageRequest) -> Result<i64> {
        let content = tokio::fs::read(&request.source)
            .await
            .with_context(|| format!("read {}", request.source.display()))?;
        let kind = sniff(&content);

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("create staging dir {}", self.staging_dir.display()))?;
        let staged = self.staging_dir.join(format!(
            "{}.{}",
            Uuid::new_v4().simple(),
            kind.map_or("bin", |kind| kind.extension())
        ));
        tokio::fs::write(&staged, &content)
            .await
            .with_context(|| format!("write staged copy {}", staged.display()))?;

        if kind == Some(MediaKind::Jpeg)
            && strip_location_in_place(&staged).await == LocationOutcome::KeptOriginal
        {
            warn!(path = %staged.display(), "queued without location stripping");
        }

        let item = NewQueueItem {
            owner_type: request.owner_type,
            owner_id: request.owner_id,
            stage: request.stage,
            client_visible: request.client_visible,
            original_name: request
                .original_name
                .unwrap_or_else(|| display_name(&request.source)),
            mime_type: request.mime_type.unwrap_or_else(|| {
                kind.map_or_else(
                    || mime::APPLICATION_OCTET_STREAM.to_string(),
                    |kind| kind.to_string(),
                )
            }),
            file_path: staged.clone(),
        };

        match self.store.enqueue(&item).await {
            Ok(id) => {
                info!(item_id = id, owner_type = %item.owner_type, owner_id = item.owner_id, stage = %item.stage, "upload queued");
                self.scheduler.schedule(id).await;
                Ok(id)
            }
            Err(err) => {
                remove_staged(&staged).await;
                Err(err)
            }
        }
    }

    /// Queues a file that is already in its final staged location.
    pub async fn enqueue_staged(&self, item: &NewQueueItem) -> Result<i64> {
        let id = self.store.enqueue(item).await?;
        info!(item_id = id, "upload queued");
        self.scheduler.schedule(id).await;
        Ok(id)
    }

    /// Manual retry of a failed item. `false` when the id is not failed.
    pub async fn retry(&self, id: i64) -> Result<bool> {
        if !self.store.requeue(id).await? {
            return Ok(false);
        }
        info!(item_id = id, "failed upload requeued");
        self.scheduler.schedule(id).await;
        Ok(true)
    }

    /// Gives items that failed for lack of a credential another chance.
    pub async fn credentials_refreshed(&self) -> Result<usize> {
        let ids = self
            .store
            .requeue_failed_with(FailureReason::NotAuthenticated)
            .await?;
        for id in &ids {
            self.scheduler.schedule(*id).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "uploads requeued after sign-in");
        }
        Ok(ids.len())
    }

    /// Drops every failed item together with its staged file.
    pub async fn purge_failed(&self) -> Result<usize> {
        let paths = self.store.purge_failed().await?;
        for path in &paths {
            remove_staged(path).await;
        }
        Ok(paths.len())
    }

    pub fn observe(&self) -> impl Stream<Item = Result<Vec<QueueItem>>> + Send + 'static {
        self.store.observe_all()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove staged file"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fieldpost_contract::QueueStatus;
    use futures::StreamExt;
    use reqwest::StatusCode;

    use super::*;
    use crate::connectivity::Connectivity;
    use crate::credentials::MemoryCredentials;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{QueueFixture, ScriptedTransport};
    use crate::worker::{AttemptOutcome, DeliveryWorker};

    fn outbox(
        fixture: &QueueFixture,
        transport: Arc<ScriptedTransport>,
        credentials: Arc<MemoryCredentials>,
        online: bool,
    ) -> Outbox {
        let worker = DeliveryWorker::new(fixture.store.clone(), transport, credentials);
        let scheduler = Scheduler::new(worker, Connectivity::new(online), SchedulerConfig::default());
        Outbox::new(fixture.store.clone(), scheduler, fixture.dir.path().join("staging"))
    }

    fn request(source: PathBuf) -> StageRequest {
        StageRequest {
            source,
            owner_type: "project".to_string(),
            owner_id: 3,
            stage: "before".to_string(),
            client_visible: false,
            original_name: None,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn staging_copies_and_queues_without_touching_source() {
        let fixture = QueueFixture::new().await;
        let source = fixture.dir.path().join("Site Survey.pdf");
        tokio::fs::write(&source, b"%PDF-1.7\n%%EOF").await.expect("write");
        let outbox = outbox(
            &fixture,
            ScriptedTransport::accepting(),
            Arc::new(MemoryCredentials::default()),
            false,
        );

        let id = outbox.stage(request(source.clone())).await.expect("stage");
        let item = fixture.store.get(id).await.expect("get").expect("row");

        assert!(source.exists());
        assert_ne!(item.file_path, source);
        assert!(item.file_path.starts_with(fixture.dir.path().join("staging")));
        assert_eq!(item.file_path.extension().and_then(|ext| ext.to_str()), Some("pdf"));
        assert_eq!(item.original_name, "Site Survey.pdf");
        assert_eq!(item.mime_type, "application/pdf");
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(outbox.scheduler().active().await, 1);
    }

    #[tokio::test]
    async fn refreshed_credentials_requeue_signed_out_failures() {
        let fixture = QueueFixture::new().await;
        let (id, _) = fixture.stage("report.pdf").await;
        let credentials = Arc::new(MemoryCredentials::default());
        let transport = ScriptedTransport::accepting();
        let outbox = outbox(&fixture, transport.clone(), credentials.clone(), true);
        let mut outcomes = outbox.scheduler().subscribe_outcomes();

        outbox.scheduler().schedule(id).await;
        let (_, outcome) = outcomes.recv().await.expect("outcome");
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                reason: FailureReason::NotAuthenticated,
                attempts: 0
            }
        );

        credentials.set_token(Some("fresh".to_string())).await;
        assert_eq!(outbox.credentials_refreshed().await.expect("refresh"), 1);
        let (_, outcome) = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("in time")
            .expect("outcome");
        assert!(matches!(outcome, AttemptOutcome::Delivered { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn retry_and_purge_only_touch_failed_items() {
        let fixture = QueueFixture::new().await;
        let (failed, failed_path) = fixture.stage("a.pdf").await;
        let (pending, pending_path) = fixture.stage("b.pdf").await;
        let outbox = outbox(
            &fixture,
            ScriptedTransport::failing_with(StatusCode::BAD_REQUEST),
            Arc::new(MemoryCredentials::new(Some("token".to_string()))),
            false,
        );
        fixture
            .store
            .update_state(failed, QueueStatus::Failed, 1, Some(FailureReason::Http(400)), chrono::Utc::now())
            .await
            .expect("fail");

        assert!(!outbox.retry(pending).await.expect("retry pending"));
        assert_eq!(outbox.purge_failed().await.expect("purge"), 1);
        assert!(!failed_path.exists());
        assert!(pending_path.exists());
        assert!(fixture.store.get(failed).await.expect("get").is_none());
        assert!(!outbox.retry(failed).await.expect("retry purged"));
    }

    #[tokio::test]
    async fn observe_reflects_staging() {
        let fixture = QueueFixture::new().await;
        let source = fixture.dir.path().join("photo.pdf");
        tokio::fs::write(&source, b"%PDF-1.4\n%%EOF").await.expect("write");
        let outbox = outbox(
            &fixture,
            ScriptedTransport::accepting(),
            Arc::new(MemoryCredentials::default()),
            false,
        );

        let mut view = Box::pin(outbox.observe());
        assert!(view.next().await.expect("snapshot").expect("list").is_empty());

        outbox.stage(request(source)).await.expect("stage");
        let snapshot = view.next().await.expect("snapshot").expect("list");
        assert_eq!(snapshot.len(), 1);
    }
}

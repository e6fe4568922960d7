//! In-process doubles shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fieldpost_storage::{NewQueueItem, QueueStore, StorageConfig};
use reqwest::StatusCode;
use tempfile::TempDir;

use crate::transport::{TransportError, UploadReceipt, UploadRequest, UploadTransport};

type Scripted = Result<UploadReceipt, TransportError>;

/// Replays scripted responses; the last one repeats forever.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicU32,
    next_id: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn failing_with(status: StatusCode) -> Arc<Self> {
        Self::new(vec![Err(TransportError::Status { status, code: None })])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn upload(
        &self,
        _request: UploadRequest,
        _token: &str,
    ) -> Result<UploadReceipt, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut script = self.script.lock().expect("script lock");
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        scripted.unwrap_or_else(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(UploadReceipt {
                ids: vec![i64::from(id)],
                failed: 0,
            })
        })
    }

    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct QueueFixture {
    pub dir: TempDir,
    pub store: QueueStore,
}

impl QueueFixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QueueStore::connect(&StorageConfig {
            sqlite_path: dir.path().join("queue.db").display().to_string(),
        })
        .await
        .expect("queue store");
        Self { dir, store }
    }

    /// Writes a staged file and enqueues it.
    pub async fn stage(&self, name: &str) -> (i64, PathBuf) {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, b"%PDF-1.4\n%%EOF").await.expect("write staged file");
        let id = self
            .store
            .enqueue(&NewQueueItem {
                owner_type: "project".to_string(),
                owner_id: 11,
                stage: "handover".to_string(),
                client_visible: true,
                file_path: path.clone(),
                original_name: name.to_string(),
                mime_type: "application/pdf".to_string(),
            })
            .await
            .expect("enqueue");
        (id, path)
    }
}

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fieldpost_media::MediaKind;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

const MAX_NAME_CHARS: usize = 120;

/// Flat directory of accepted files, each under a random key.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create blob root {}", self.root.display()))
    }

    /// Persists `content` under a fresh key and returns the key.
    ///
    /// Keys are random; `create_new` turns the unlikely collision into an
    /// error instead of an overwrite.
    pub async fn put(&self, kind: MediaKind, content: &[u8]) -> Result<String> {
        let key = format!("{}.{}", Uuid::new_v4().simple(), kind.extension());
        let path = self.root.join(&key);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("create blob {}", path.display()))?;
        self.commit(&path, file, content).await?;

        Ok(key)
    }

    async fn commit<S: BlobSink>(&self, path: &Path, mut sink: S, content: &[u8]) -> Result<()> {
        let written = match sink.write_all(content).await {
            Ok(()) => sink.sync().await,
            Err(err) => Err(err),
        };
        drop(sink);

        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove partial blob");
                }
            }
            return Err(err).with_context(|| format!("write blob {}", path.display()));
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove orphaned blob"),
        }
    }
}

trait BlobSink: AsyncWrite + Unpin + Send {
    fn sync(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
}

impl BlobSink for tokio::fs::File {
    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all().await
    }
}

/// Client-supplied file name reduced to something safe to record and show:
/// directory parts dropped, control and path characters replaced, length capped.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .take(MAX_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

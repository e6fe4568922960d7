use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fieldpost_contract::MAX_ATTEMPTS;
use fieldpost_delivery::{Backoff, SchedulerConfig, TransportTimeouts};
use fieldpost_ingest::IngestLimits;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub http: HttpSection,
    pub storage: StorageSection,
    pub ingest: IngestLimits,
    pub agent: AgentSection,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&source)
            .with_context(|| format!("invalid config TOML at {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: String,
    pub blob_root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: "data/fieldpost.db".to_string(),
            blob_root: PathBuf::from("data/blobs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub server_url: String,
    pub queue_path: String,
    pub staging_dir: PathBuf,
    pub token_file: PathBuf,
    pub max_attempts: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub due_batch: i64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            queue_path: "device/queue.db".to_string(),
            staging_dir: PathBuf::from("device/staging"),
            token_file: PathBuf::from("device/token"),
            max_attempts: MAX_ATTEMPTS,
            backoff_initial_secs: 30,
            backoff_max_secs: 5 * 60 * 60,
            connect_timeout_secs: 15,
            request_timeout_secs: 120,
            probe_interval_secs: 20,
            sweep_interval_secs: 60,
            due_batch: 50,
        }
    }
}

impl AgentSection {
    pub fn timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            request: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            backoff: Backoff {
                initial: Duration::from_secs(self.backoff_initial_secs.max(1)),
                max: Duration::from_secs(self.backoff_max_secs.max(self.backoff_initial_secs)),
            },
            due_batch: self.due_batch.max(1),
            sweep_interval: (self.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(self.sweep_interval_secs)),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

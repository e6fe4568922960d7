mod assets;
mod queue;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub use assets::{AssetStore, NewStoredAsset, Session, StoredAsset};
pub use queue::{NewQueueItem, QueueItem, QueueStore};

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

async fn open_pool(config: &StorageConfig) -> Result<SqlitePool> {
    let uri = normalize_sqlite_uri(&config.sqlite_path);
    let options = SqliteConnectOptions::from_str(&uri)
        .with_context(|| format!("invalid sqlite URI: {}", uri))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to connect sqlite pool")
}

async fn apply_schema(pool: &SqlitePool, schema: &str) -> Result<()> {
    for statement in schema.split(';') {
        let sql = statement.trim();
        if sql.is_empty() {
            continue;
        }
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed for statement: {sql}"))?;
    }
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps order lexically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_sqlite_uri;

    #[test]
    fn bare_paths_become_sqlite_uris() {
        assert_eq!(normalize_sqlite_uri("data/queue.db"), "sqlite://data/queue.db");
        assert_eq!(normalize_sqlite_uri("sqlite::memory:"), "sqlite::memory:");
    }
}

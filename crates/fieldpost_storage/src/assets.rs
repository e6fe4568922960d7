use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::{apply_schema, open_pool, timestamp, StorageConfig};

const INGEST_SCHEMA_SQL: &str = include_str!("sql/ingest.sql");

const ASSET_COLUMNS: &str = "id, owner_type, owner_id, stage, storage_path, mime_type, original_name, size_bytes, uploaded_by, client_visible, created_at";

#[derive(Debug, Clone)]
pub struct NewStoredAsset {
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub storage_path: String,
    pub mime_type: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub uploaded_by: String,
    pub client_visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct StoredAsset {
    pub id: i64,
    pub owner_type: String,
    pub owner_id: i64,
    pub stage: String,
    pub storage_path: String,
    pub mime_type: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub uploaded_by: String,
    pub client_visible: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: String,
    pub expires_at: Option<i64>,
}

/// Server-side records: accepted assets and the bearer sessions allowed to
/// create them.
#[derive(Debug, Clone)]
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = open_pool(config).await?;
        apply_schema(&pool, INGEST_SCHEMA_SQL).await?;
        info!(path = %config.sqlite_path, "ingest schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("ping ingest database")?;
        Ok(())
    }

    pub async fn insert_asset(&self, asset: &NewStoredAsset) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO stored_assets(owner_type, owner_id, stage, storage_path, mime_type, original_name, size_bytes, uploaded_by, client_visible, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&asset.owner_type)
        .bind(asset.owner_id)
        .bind(&asset.stage)
        .bind(&asset.storage_path)
        .bind(&asset.mime_type)
        .bind(&asset.original_name)
        .bind(asset.size_bytes)
        .bind(&asset.uploaded_by)
        .bind(asset.client_visible)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert stored asset {}", asset.storage_path))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_asset(&self, id: i64) -> Result<Option<StoredAsset>> {
        sqlx::query_as::<_, StoredAsset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM stored_assets WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query stored asset {id}"))
    }

    pub async fn list_for_owner(&self, owner_type: &str, owner_id: i64) -> Result<Vec<StoredAsset>> {
        sqlx::query_as::<_, StoredAsset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM stored_assets WHERE owner_type = ? AND owner_id = ? ORDER BY id ASC"
        ))
        .bind(owner_type)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("query assets for {owner_type}/{owner_id}"))
    }

    pub async fn issue_session(&self, user_id: &str, ttl: Option<Duration>) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            created_at: timestamp(now),
            expires_at: ttl.map(|ttl| (now + ttl).timestamp()),
        };

        sqlx::query("INSERT INTO api_sessions(token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&session.token)
            .bind(&session.user_id)
            .bind(&session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert session for {user_id}"))?;

        Ok(session)
    }

    /// Looks up an unexpired session by its bearer token.
    pub async fn resolve_session(&self, token: &str) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(
            "SELECT token, user_id, created_at, expires_at FROM api_sessions WHERE token = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(token)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await
        .context("query session")
    }

    pub async fn revoke_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM api_sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("delete session")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, AssetStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            sqlite_path: dir.path().join("ingest.db").display().to_string(),
        };
        let store = AssetStore::connect(&config).await.expect("connect");
        (dir, store)
    }

    fn asset(key: &str) -> NewStoredAsset {
        NewStoredAsset {
            owner_type: "lead".to_string(),
            owner_id: 3,
            stage: "survey".to_string(),
            storage_path: key.to_string(),
            mime_type: "image/png".to_string(),
            original_name: "roof.png".to_string(),
            size_bytes: 1024,
            uploaded_by: "crew-1".to_string(),
            client_visible: true,
        }
    }

    #[tokio::test]
    async fn assets_are_listed_per_owner() {
        let (_dir, store) = open_store().await;
        let first = store.insert_asset(&asset("a.png")).await.expect("insert");
        let second = store.insert_asset(&asset("b.png")).await.expect("insert");
        let mut other = asset("c.png");
        other.owner_id = 4;
        store.insert_asset(&other).await.expect("insert");

        let listed = store.list_for_owner("lead", 3).await.expect("list");
        let ids: Vec<i64> = listed.iter().map(|asset| asset.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(listed[0].client_visible);
    }

    #[tokio::test]
    async fn storage_keys_are_unique() {
        let (_dir, store) = open_store().await;
        store.insert_asset(&asset("same.png")).await.expect("insert");
        assert!(store.insert_asset(&asset("same.png")).await.is_err());
    }

    #[tokio::test]
    async fn expired_and_revoked_sessions_do_not_resolve() {
        let (_dir, store) = open_store().await;
        let live = store.issue_session("crew-1", None).await.expect("issue");
        let expired = store
            .issue_session("crew-2", Some(Duration::seconds(-5)))
            .await
            .expect("issue");

        let resolved = store.resolve_session(&live.token).await.expect("resolve");
        assert_eq!(resolved.map(|s| s.user_id), Some("crew-1".to_string()));
        assert!(store
            .resolve_session(&expired.token)
            .await
            .expect("resolve")
            .is_none());

        assert!(store.revoke_session(&live.token).await.expect("revoke"));
        assert!(store.resolve_session(&live.token).await.expect("resolve").is_none());
    }
}

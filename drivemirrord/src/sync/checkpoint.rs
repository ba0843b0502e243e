use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::{fs, path::Path};

use drivemirror_core::{ChangeItem, FileRecord};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Everything needed to resume the engine without re-walking the remote
/// tree. One JSON document per account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    pub change_token: Option<String>,
    pub file_info: HashMap<String, FileRecord>,
    pub synced: bool,
    pub root_id: Option<String>,
    pub changes_to_execute: Vec<ChangeItem>,
    #[serde(with = "base64_path_map")]
    pub on_local_drive: HashSet<PathBuf>,
}

/// The materialized set travels as a map keyed by base64-encoded paths; the
/// upstream store contract disallows several path characters in keys.
mod base64_path_map {
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        set: &HashSet<PathBuf>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<String, bool> = set
            .iter()
            .map(|path| (STANDARD.encode(path.to_string_lossy().as_bytes()), true))
            .collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashSet<PathBuf>, D::Error> {
        let map = BTreeMap::<String, bool>::deserialize(deserializer)?;
        let mut out = HashSet::with_capacity(map.len());
        for key in map.into_keys() {
            let bytes = STANDARD
                .decode(key.as_bytes())
                .map_err(serde::de::Error::custom)?;
            let text = String::from_utf8(bytes).map_err(serde::de::Error::custom)?;
            out.insert(PathBuf::from(text));
        }
        Ok(out)
    }
}

/// Durable key-value storage for checkpoints, one row per account. Saves
/// and loads are serialized behind one async lock.
pub struct CheckpointStore {
    pool: SqlitePool,
    op_lock: tokio::sync::Mutex<()>,
}

impl CheckpointStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_at(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, CheckpointError> {
        Self::open_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), CheckpointError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn save(
        &self,
        account_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let _guard = self.op_lock.lock().await;
        let value = serde_json::to_string(checkpoint)?;
        sqlx::query(
            "INSERT INTO checkpoints (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(checkpoint_key(account_id))
        .bind(value)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, account_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let _guard = self.op_lock.lock().await;
        let row = sqlx::query("SELECT value FROM checkpoints WHERE key = ?1")
            .bind(checkpoint_key(account_id))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&value)?))
    }

    pub async fn erase(&self, account_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.op_lock.lock().await;
        sqlx::query("DELETE FROM checkpoints WHERE key = ?1")
            .bind(checkpoint_key(account_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn checkpoint_key(account_id: &str) -> String {
    format!("sync:{account_id}")
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn default_db_path() -> Result<PathBuf, CheckpointError> {
    let mut path = dirs::data_dir().ok_or(CheckpointError::MissingDataDir)?;
    path.push("drivemirror");
    path.push("checkpoint.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint() -> Checkpoint {
        let mut file_info = HashMap::new();
        file_info.insert(
            "a".to_string(),
            FileRecord {
                id: "a".into(),
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                md5_checksum: Some("h1".into()),
                size: Some(3),
                modified_time: Some("2024-01-01T00:00:00Z".into()),
                parents: vec!["root".into()],
                trashed: false,
            },
        );
        let mut on_local_drive = HashSet::new();
        on_local_drive.insert(PathBuf::from("/sync/a.txt"));
        Checkpoint {
            change_token: Some("token-7".into()),
            file_info,
            synced: true,
            root_id: Some("root".into()),
            changes_to_execute: vec![ChangeItem {
                file_id: "a".into(),
                removed: true,
                ..ChangeItem::default()
            }],
            on_local_drive,
        }
    }

    #[test]
    fn materialized_paths_round_trip_through_base64_keys() {
        let checkpoint = sample_checkpoint();
        let json = serde_json::to_value(&checkpoint).unwrap();
        let keys: Vec<&String> = json["onLocalDrive"]
            .as_object()
            .unwrap()
            .keys()
            .collect();
        // Keys are encoded; no path separators may appear.
        assert!(keys.iter().all(|key| !key.contains('/')));
        let restored: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(restored, checkpoint);
    }

    async fn memory_store() -> CheckpointStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = CheckpointStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = memory_store().await;
        let checkpoint = sample_checkpoint();
        store.save("acct", &checkpoint).await.unwrap();
        let loaded = store.load("acct").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn load_of_missing_account_is_none() {
        let store = memory_store().await;
        assert!(store.load("acct").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn erase_removes_the_record() {
        let store = memory_store().await;
        store.save("acct", &sample_checkpoint()).await.unwrap();
        store.erase("acct").await.unwrap();
        assert!(store.load("acct").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accounts_do_not_collide() {
        let store = memory_store().await;
        store.save("one", &sample_checkpoint()).await.unwrap();
        assert!(store.load("two").await.unwrap().is_none());
    }
}

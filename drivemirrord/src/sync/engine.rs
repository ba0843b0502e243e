use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivemirror_core::{ChangeItem, DriveClient, DriveError, FilePatch, FileRecord};
use futures_util::future::join_all;
use thiserror::Error;

use super::decision::{self, RemoteUpdate};
use super::ignore::IgnoreRegistry;
use super::local_watcher::LocalEvent;
use super::metadata::MetadataStore;
use super::status::StatusHub;

/// Remote changes are applied in bounded windows of concurrent tasks; the
/// feed is windowed in arrival order so per-id ordering survives.
const REMOTE_APPLY_WINDOW: usize = 10;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("api error: {0}")]
    Api(#[from] DriveError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown parent for local path: {0}")]
    UnknownParent(PathBuf),
    #[error("local sync root was removed")]
    RootRemoved,
    #[error("record is not cached: {0}")]
    MissingRecord(String),
}

/// The reconciler: the only component that writes the local tree or mutates
/// the remote store. One instance serves the initial sync, the change
/// poller and the local event queue.
pub struct SyncEngine {
    client: DriveClient,
    metadata: MetadataStore,
    ignore: IgnoreRegistry,
    status: Arc<StatusHub>,
    delete_permanently: bool,
}

impl SyncEngine {
    pub fn new(
        client: DriveClient,
        metadata: MetadataStore,
        ignore: IgnoreRegistry,
        status: Arc<StatusHub>,
        delete_permanently: bool,
    ) -> Self {
        Self {
            client,
            metadata,
            ignore,
            status,
            delete_permanently,
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    fn local_root(&self) -> &Path {
        self.metadata.local_root()
    }

    /// Applies a batch of feed entries in windows of bounded concurrency.
    /// Returns how many entries changed the local tree.
    pub async fn apply_remote_changes(&self, changes: &[ChangeItem]) -> Result<usize, EngineError> {
        let mut applied = 0;
        for window in changes.chunks(REMOTE_APPLY_WINDOW) {
            let results = join_all(window.iter().map(|change| self.apply_remote_change(change)))
                .await;
            for result in results {
                if result? {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    async fn file_md5(path: &Path) -> std::io::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    async fn matches_checksum(path: &Path, expected_md5: &str) -> bool {
        match Self::file_md5(path).await {
            Ok(actual) => actual == expected_md5,
            Err(_) => false,
        }
    }

    /// Creates `dir` and any missing ancestors under the local root, adding
    /// one ignore token per directory the watcher will report.
    async fn ensure_dir_with_ignore(&self, dir: &Path) -> std::io::Result<()> {
        let mut missing = Vec::new();
        let mut cursor = dir;
        loop {
            if cursor == self.local_root() || tokio::fs::try_exists(cursor).await? {
                break;
            }
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        for path in &missing {
            self.ignore.ignore(path);
        }
        tokio::fs::create_dir_all(dir).await
    }

    /// Deletes a file or directory, declaring the write first. Returns false
    /// when there was nothing on disk.
    async fn remove_path_with_ignore(&self, path: &Path, is_dir: bool) -> std::io::Result<bool> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        self.ignore.ignore(path);
        let result = if is_dir {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn first_existing(paths: &[PathBuf]) -> Option<PathBuf> {
        for path in paths {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Some(path.clone());
            }
        }
        None
    }
}

include!("engine_impl_remote.rs");
include!("engine_impl_local.rs");

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;

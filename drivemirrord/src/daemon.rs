use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use drivemirror_core::DriveClient;
use tokio::sync::mpsc;

use crate::sync::checkpoint::CheckpointStore;
use crate::sync::controller::{ControllerConfig, SyncController};
use crate::sync::status::EngineEvent;

const DEFAULT_SYNC_DIR_NAME: &str = "DriveMirror";
const DEFAULT_REMOTE_ROOT: &str = "root";
const DEFAULT_ACCOUNT_ID: &str = "default";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub remote_root: String,
    pub account_id: String,
    pub db_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub delete_permanently: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_sync = home.join(DEFAULT_SYNC_DIR_NAME);
        let sync_root = std::env::var("DRIVEMIRROR_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or(default_sync);
        let remote_root = std::env::var("DRIVEMIRROR_REMOTE_ROOT")
            .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string());
        let account_id = std::env::var("DRIVEMIRROR_ACCOUNT_ID")
            .unwrap_or_else(|_| DEFAULT_ACCOUNT_ID.to_string());
        let db_path = std::env::var("DRIVEMIRROR_DB_PATH").ok().map(PathBuf::from);
        let base_url = std::env::var("DRIVEMIRROR_BASE_URL").ok();
        let delete_permanently = read_bool_env("DRIVEMIRROR_DELETE_PERMANENTLY", false);

        Ok(Self {
            sync_root,
            remote_root,
            account_id,
            db_path,
            base_url,
            delete_permanently,
        })
    }
}

/// Removes the persisted checkpoint without touching the remote service.
pub async fn erase_checkpoint(config: &DaemonConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    store
        .erase(&config.account_id)
        .await
        .context("failed to erase checkpoint")?;
    Ok(())
}

async fn open_store(config: &DaemonConfig) -> anyhow::Result<CheckpointStore> {
    match &config.db_path {
        Some(path) => CheckpointStore::open_at(path)
            .await
            .with_context(|| format!("failed to open checkpoint store at {path:?}")),
        None => CheckpointStore::new_default()
            .await
            .context("failed to open checkpoint store"),
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    controller: Arc<SyncController>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let token =
            std::env::var("DRIVEMIRROR_TOKEN").context("DRIVEMIRROR_TOKEN is not set")?;
        let client = match &config.base_url {
            Some(base) => DriveClient::with_base_url(base, token)?,
            None => DriveClient::new(token)?,
        };
        let store = open_store(&config).await?;
        let (controller, _status_rx, events) = SyncController::new(
            client,
            store,
            ControllerConfig {
                account_id: config.account_id.clone(),
                remote_root: config.remote_root.clone(),
                local_root: config.sync_root.clone(),
                delete_permanently: config.delete_permanently,
            },
        );
        Ok(Self {
            config,
            controller,
            events,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[drivemirrord] started: sync_root={}, remote_root={}, account={}",
            self.config.sync_root.display(),
            self.config.remote_root,
            self.config.account_id,
        );

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
        let mut events = self.events;
        let event_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Syncing(active) => {
                        eprintln!("[drivemirrord] syncing: {active}");
                    }
                    EngineEvent::FilesChanged(summary) => {
                        eprintln!("[drivemirrord] files changed: {summary}");
                    }
                    EngineEvent::Error(message) => {
                        eprintln!("[drivemirrord] error: {message}");
                    }
                    EngineEvent::Fatal(message) => {
                        eprintln!("[drivemirrord] fatal: {message}");
                        let _ = fatal_tx.send(message);
                    }
                }
            }
        });

        self.controller
            .start(|message| eprintln!("[drivemirrord] {message}"))
            .await?;

        let outcome = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal").map(|_| ())
            }
            fatal = fatal_rx.recv() => match fatal {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            },
        };

        self.controller.close().await;
        event_handle.abort();
        outcome
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(value),
    }
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_home_prefix() {
        let home = Path::new("/home/user");
        assert_eq!(
            expand_with_home("~/Mirror", home),
            PathBuf::from("/home/user/Mirror")
        );
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
    }

    #[test]
    fn parses_bool_envs() {
        assert!(!read_bool_env("DRIVEMIRROR_TEST_UNSET_BOOL", false));
        assert!(read_bool_env("DRIVEMIRROR_TEST_UNSET_BOOL", true));
    }
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use drivemirror_core::{ChangeItem, DriveClient};
use futures_util::future::join_all;
use notify::RecommendedWatcher;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use super::engine::SyncEngine;
use super::ignore::IgnoreRegistry;
use super::local_watcher;
use super::metadata::MetadataStore;
use super::poller::ChangePoller;
use super::queue;
use super::status::{EngineEvent, StatusHub, SyncStatus};

/// Files of the initial sync download in windows of this many concurrent
/// transfers; the next window's parents are batch-prefetched first.
const DOWNLOAD_WINDOW: usize = 10;

/// Checkpoints during a change stream are throttled: a write needs at least
/// this much time since the last one and at least one applied change.
const CHECKPOINT_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Shared cursor state between controller, poller and checkpoint writer.
#[derive(Debug, Default)]
pub struct SyncState {
    pub change_token: Option<String>,
    pub pending: Vec<ChangeItem>,
    pub synced: bool,
}

struct WriteGate {
    last_save: Instant,
    pending_changes: usize,
}

/// Assembles checkpoints from live engine state and throttles their writes.
pub struct CheckpointWriter {
    store: Arc<CheckpointStore>,
    account_id: String,
    metadata: MetadataStore,
    state: Arc<Mutex<SyncState>>,
    gate: Mutex<WriteGate>,
}

impl CheckpointWriter {
    fn new(
        store: Arc<CheckpointStore>,
        account_id: String,
        metadata: MetadataStore,
        state: Arc<Mutex<SyncState>>,
    ) -> Self {
        Self {
            store,
            account_id,
            metadata,
            state,
            gate: Mutex::new(WriteGate {
                last_save: Instant::now(),
                pending_changes: 0,
            }),
        }
    }

    /// Records `changes` applied changes and writes a checkpoint once the
    /// time-and-count threshold is met.
    pub async fn maybe_save(&self, changes: usize) -> Result<(), CheckpointError> {
        {
            let mut gate = self.gate.lock().expect("checkpoint gate poisoned");
            gate.pending_changes += changes;
            if gate.pending_changes == 0 || gate.last_save.elapsed() < CHECKPOINT_MIN_INTERVAL {
                return Ok(());
            }
            gate.pending_changes = 0;
            gate.last_save = Instant::now();
        }
        self.save_now().await
    }

    pub async fn save_now(&self) -> Result<(), CheckpointError> {
        let checkpoint = self.collect();
        self.store.save(&self.account_id, &checkpoint).await
    }

    fn collect(&self) -> Checkpoint {
        let (file_info, on_local_drive) = self.metadata.snapshot();
        let state = self.state.lock().expect("sync state mutex poisoned");
        Checkpoint {
            change_token: state.change_token.clone(),
            file_info,
            synced: state.synced,
            root_id: self.metadata.root_id(),
            changes_to_execute: state.pending.clone(),
            on_local_drive,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub account_id: String,
    pub remote_root: String,
    pub local_root: PathBuf,
    pub delete_permanently: bool,
}

/// Orchestrates the engine lifecycle: initial sync, steady-state tasks,
/// shutdown, checkpoint erasure.
pub struct SyncController {
    config: ControllerConfig,
    client: DriveClient,
    metadata: MetadataStore,
    engine: Arc<SyncEngine>,
    status: Arc<StatusHub>,
    ignore: IgnoreRegistry,
    store: Arc<CheckpointStore>,
    state: Arc<Mutex<SyncState>>,
    checkpoint: Arc<CheckpointWriter>,
    cancel: CancellationToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncController {
    pub fn new(
        client: DriveClient,
        store: CheckpointStore,
        config: ControllerConfig,
    ) -> (
        Arc<Self>,
        watch::Receiver<SyncStatus>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (status, status_rx, events_rx) = StatusHub::new();
        let ignore = IgnoreRegistry::new();
        let metadata = MetadataStore::new(client.clone(), config.local_root.clone());
        let engine = Arc::new(SyncEngine::new(
            client.clone(),
            metadata.clone(),
            ignore.clone(),
            status.clone(),
            config.delete_permanently,
        ));
        let store = Arc::new(store);
        let state = Arc::new(Mutex::new(SyncState::default()));
        let checkpoint = Arc::new(CheckpointWriter::new(
            store.clone(),
            config.account_id.clone(),
            metadata.clone(),
            state.clone(),
        ));
        let controller = Arc::new(Self {
            config,
            client,
            metadata,
            engine,
            status,
            ignore,
            store,
            state,
            checkpoint,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        (controller, status_rx, events_rx)
    }

    /// Runs the initial sync and brings up the steady-state tasks. Returns
    /// once the initial download has completed; `notify` receives progress
    /// strings along the way.
    pub async fn start<F>(&self, notify: F) -> anyhow::Result<()>
    where
        F: Fn(String),
    {
        self.status.set_status(SyncStatus::InitialSync);

        // A broken checkpoint loses resume state but never blocks startup.
        let restored = match self.store.load(&self.config.account_id).await {
            Ok(found) => found,
            Err(err) => {
                eprintln!("[drivemirrord] checkpoint load failed: {err}");
                self.status
                    .report_error(format!("checkpoint load failed: {err}"));
                None
            }
        };
        let mut root_id = None;
        if let Some(checkpoint) = restored {
            root_id = checkpoint.root_id.clone();
            if let Some(id) = &root_id {
                self.metadata.set_root(id);
            }
            self.metadata
                .restore(checkpoint.file_info, checkpoint.on_local_drive);
            let mut state = self.state.lock().expect("sync state mutex poisoned");
            state.change_token = checkpoint.change_token;
            state.pending = checkpoint.changes_to_execute;
            state.synced = checkpoint.synced;
        }

        tokio::fs::create_dir_all(&self.config.local_root)
            .await
            .with_context(|| {
                format!(
                    "failed to create sync root at {:?}",
                    self.config.local_root
                )
            })?;
        let (watcher, local_events) =
            local_watcher::start_notify_watcher(&self.config.local_root, self.ignore.clone())
                .context("failed to start local watcher")?;
        *self.watcher.lock().expect("watcher mutex poisoned") = Some(watcher);

        let root_id = match root_id {
            Some(id) => id,
            None => {
                self.metadata
                    .get(&self.config.remote_root)
                    .await
                    .context("failed to resolve remote root")?
                    .context("remote root folder does not exist")?
                    .id
            }
        };
        self.metadata.set_root(&root_id);

        // Changes that were fetched but not applied before the last
        // shutdown run first; re-application is idempotent.
        let pending = {
            let mut state = self.state.lock().expect("sync state mutex poisoned");
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            notify(format!("applying {} pending changes", pending.len()));
            self.engine.apply_remote_changes(&pending).await?;
        }

        // The token is adopted before the walk so edits racing the walk are
        // caught by the first poll.
        let needs_token = {
            let state = self.state.lock().expect("sync state mutex poisoned");
            state.change_token.is_none()
        };
        if needs_token {
            let token = self.client.start_page_token().await?;
            let mut state = self.state.lock().expect("sync state mutex poisoned");
            state.change_token = Some(token);
        }

        // A restored synced checkpoint already carries the whole tree; the
        // walk is only for first start or after an erase.
        let already_synced = {
            let state = self.state.lock().expect("sync state mutex poisoned");
            state.synced
        };
        if already_synced {
            notify("resuming from checkpoint".to_string());
        } else {
            self.initial_walk(&root_id, &notify).await?;
        }

        {
            let mut state = self.state.lock().expect("sync state mutex poisoned");
            state.synced = true;
        }
        self.status.set_status(SyncStatus::Idle);
        if let Err(err) = self.checkpoint.save_now().await {
            eprintln!("[drivemirrord] checkpoint write failed: {err}");
            self.status
                .report_error(format!("checkpoint write failed: {err}"));
        }

        let poller = ChangePoller::new(
            self.client.clone(),
            self.engine.clone(),
            self.status.clone(),
            self.state.clone(),
            self.checkpoint.clone(),
            self.cancel.clone(),
        );
        let consumer = queue::spawn_consumer(
            self.engine.clone(),
            self.status.clone(),
            local_events,
            self.cancel.clone(),
        );
        let status_for_consumer = self.status.clone();
        let mut tasks = self.tasks.lock().expect("tasks mutex poisoned");
        tasks.push(tokio::spawn(poller.run()));
        tasks.push(tokio::spawn(async move {
            match consumer.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    status_for_consumer.report_fatal(format!("local sync stopped: {err}"));
                }
                Err(_) => {}
            }
        }));

        notify("sync is up to date".to_string());
        Ok(())
    }

    /// Lists the remote tree from the root, materializes every record and
    /// downloads content in bounded-parallel windows.
    async fn initial_walk<F>(&self, root_id: &str, notify: &F) -> anyhow::Result<()>
    where
        F: Fn(String),
    {
        notify("scanning remote folder".to_string());
        let mut stack = vec![root_id.to_string()];
        let mut all = Vec::new();
        let mut downloads = Vec::new();
        while let Some(parent) = stack.pop() {
            let children = self.client.list_children_all(&parent).await?;
            for record in children {
                if record.is_folder() {
                    stack.push(record.id.clone());
                } else if record.has_content() {
                    downloads.push(record.clone());
                }
                self.metadata.insert_fetched(record.clone());
                all.push(record);
            }
        }

        // One batched parent prefetch, then a cache-only materialize pass.
        self.metadata.prefetch_parents(&all).await;
        for record in all.iter().filter(|record| record.is_folder()) {
            let paths = self.metadata.materialize_cached(record.clone());
            self.engine.materialize_record(record, &paths).await?;
        }
        for record in all.iter().filter(|record| !record.is_folder()) {
            self.metadata.materialize_cached(record.clone());
        }

        notify(format!("downloading {} files", downloads.len()));
        let mut done = 0usize;
        for window in downloads.chunks(DOWNLOAD_WINDOW) {
            self.metadata.prefetch_parents(window).await;
            let results = join_all(window.iter().map(|record| async {
                let paths = self.metadata.materialize_cached(record.clone());
                self.engine.materialize_record(record, &paths).await
            }))
            .await;
            for result in results {
                result?;
            }
            done += window.len();
            notify(format!("downloaded {done}/{} files", downloads.len()));
        }
        Ok(())
    }

    /// Stops the poller and the queue consumer at their next suspension
    /// point, drops the watcher and writes a final checkpoint.
    pub async fn close(&self) {
        self.cancel.cancel();
        *self.watcher.lock().expect("watcher mutex poisoned") = None;
        if let Err(err) = self.checkpoint.save_now().await {
            eprintln!("[drivemirrord] final checkpoint write failed: {err}");
        }
        let tasks = {
            let mut guard = self.tasks.lock().expect("tasks mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Drops the persisted checkpoint for this account.
    pub async fn erase(&self) -> Result<(), CheckpointError> {
        self.store.erase(&self.config.account_id).await
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn change_token(&self) -> Option<String> {
        self.state
            .lock()
            .expect("sync state mutex poisoned")
            .change_token
            .clone()
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;

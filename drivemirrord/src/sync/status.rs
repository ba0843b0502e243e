use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

/// What the engine is doing right now. Emitted on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    InitialSync,
    ApplyingRemoteChange,
    ApplyingLocalChange,
}

impl SyncStatus {
    pub fn is_active(self) -> bool {
        self != SyncStatus::Idle
    }
}

/// Counts of files touched since the last `FilesChanged` emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub trashed: usize,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "added={}, removed={}, updated={}, trashed={}",
            self.added, self.removed, self.updated, self.trashed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Syncing(bool),
    FilesChanged(ChangeSummary),
    Error(String),
    Fatal(String),
}

/// Owns the status channel, the upward event channel and the pending change
/// summary. `FilesChanged` fires only when the engine leaves an active state
/// with a non-empty summary.
pub struct StatusHub {
    status: watch::Sender<SyncStatus>,
    events: mpsc::UnboundedSender<EngineEvent>,
    summary: Mutex<ChangeSummary>,
}

impl StatusHub {
    pub fn new() -> (
        Arc<Self>,
        watch::Receiver<SyncStatus>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            status: status_tx,
            events: event_tx,
            summary: Mutex::new(ChangeSummary::default()),
        });
        (hub, status_rx, event_rx)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, next: SyncStatus) {
        let previous = *self.status.borrow();
        if previous == next {
            return;
        }
        self.status.send_replace(next);
        let _ = self.events.send(EngineEvent::Syncing(next.is_active()));
        if !next.is_active() {
            let drained = {
                let mut summary = self.summary.lock().expect("summary mutex poisoned");
                std::mem::take(&mut *summary)
            };
            if !drained.is_empty() {
                let _ = self.events.send(EngineEvent::FilesChanged(drained));
            }
        }
    }

    pub fn record(&self, update: impl FnOnce(&mut ChangeSummary)) {
        let mut summary = self.summary.lock().expect("summary mutex poisoned");
        update(&mut summary);
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.events.send(EngineEvent::Error(message.into()));
    }

    pub fn report_fatal(&self, message: impl Into<String>) {
        let _ = self.events.send(EngineEvent::Fatal(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_syncing_on_every_transition() {
        let (hub, _status_rx, mut events) = StatusHub::new();
        hub.set_status(SyncStatus::InitialSync);
        hub.set_status(SyncStatus::InitialSync);
        hub.set_status(SyncStatus::Idle);
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(true));
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(false));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn files_changed_fires_only_when_leaving_active_state_with_changes() {
        let (hub, _status_rx, mut events) = StatusHub::new();
        hub.set_status(SyncStatus::ApplyingRemoteChange);
        hub.record(|summary| summary.added += 2);
        hub.set_status(SyncStatus::Idle);

        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(true));
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(false));
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::FilesChanged(ChangeSummary {
                added: 2,
                ..ChangeSummary::default()
            })
        );

        // An empty summary stays silent.
        hub.set_status(SyncStatus::ApplyingLocalChange);
        hub.set_status(SyncStatus::Idle);
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(true));
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Syncing(false));
        assert!(events.try_recv().is_err());
    }
}

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{EngineError, SyncEngine};
use super::local_watcher::LocalEvent;
use super::status::{StatusHub, SyncStatus};

/// Spawns the single consumer that serializes local events through the
/// engine. The status is ApplyingLocalChange while the queue is non-empty
/// and Idle once drained. Unknown-parent events are logged and dropped;
/// losing the sync root ends the consumer with an error.
pub fn spawn_consumer(
    engine: Arc<SyncEngine>,
    status: Arc<StatusHub>,
    mut events: mpsc::UnboundedReceiver<LocalEvent>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), EngineError>> {
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };
            status.set_status(SyncStatus::ApplyingLocalChange);
            let mut next = Some(first);
            while let Some(event) = next {
                match engine.apply_local_event(&event).await {
                    Ok(()) => {}
                    Err(EngineError::UnknownParent(path)) => {
                        eprintln!(
                            "[drivemirrord] dropped local event for {}: unknown parent",
                            path.display()
                        );
                    }
                    Err(EngineError::RootRemoved) => {
                        status.set_status(SyncStatus::Idle);
                        return Err(EngineError::RootRemoved);
                    }
                    Err(err) => {
                        eprintln!(
                            "[drivemirrord] local event failed for {}: {err}",
                            event.path().display()
                        );
                        status.report_error(format!("local event failed: {err}"));
                    }
                }
                next = events.try_recv().ok();
            }
            status.set_status(SyncStatus::Idle);
        }
    })
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use drivemirror_core::DriveClient;
use tokio_util::sync::CancellationToken;

use super::controller::{CheckpointWriter, SyncState};
use super::engine::SyncEngine;
use super::status::{StatusHub, SyncStatus};

pub const INITIAL_INTERVAL: Duration = Duration::from_secs(8);
pub const MIN_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_INTERVAL: Duration = Duration::from_secs(30);
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Adaptive polling cadence: any applied change snaps the interval to the
/// floor, idle polls back off multiplicatively up to the cap.
#[derive(Debug, Clone, Copy)]
pub struct PollInterval {
    current: Duration,
}

impl PollInterval {
    pub fn new() -> Self {
        Self {
            current: INITIAL_INTERVAL,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = MIN_INTERVAL;
    }

    pub fn back_off(&mut self) {
        self.current = self.current.mul_f64(BACKOFF_FACTOR).min(MAX_INTERVAL);
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-running loop draining the incremental change feed into the engine.
/// Terminates on cancellation or on the first apply/feed error.
pub struct ChangePoller {
    client: DriveClient,
    engine: Arc<SyncEngine>,
    status: Arc<StatusHub>,
    state: Arc<Mutex<SyncState>>,
    checkpoint: Arc<CheckpointWriter>,
    cancel: CancellationToken,
}

impl ChangePoller {
    pub fn new(
        client: DriveClient,
        engine: Arc<SyncEngine>,
        status: Arc<StatusHub>,
        state: Arc<Mutex<SyncState>>,
        checkpoint: Arc<CheckpointWriter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            engine,
            status,
            state,
            checkpoint,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = PollInterval::new();
        loop {
            let (synced, token) = {
                let state = self.state.lock().expect("sync state mutex poisoned");
                (state.synced, state.change_token.clone())
            };
            if !synced || self.status.status() == SyncStatus::InitialSync {
                if self.sleep(INITIAL_INTERVAL).await {
                    return;
                }
                continue;
            }
            let Some(token) = token else {
                if self.sleep(INITIAL_INTERVAL).await {
                    return;
                }
                continue;
            };

            let (changes, new_start_token) = match self.client.changes_since_all(&token).await {
                Ok(drained) => drained,
                Err(err) => {
                    eprintln!("[drivemirrord] change poll failed: {err}");
                    self.status.report_error(format!("change poll failed: {err}"));
                    return;
                }
            };

            let mut applied = 0;
            if !changes.is_empty() {
                {
                    let mut state = self.state.lock().expect("sync state mutex poisoned");
                    state.pending = changes.clone();
                }
                // The fetched batch is made durable before any of it is
                // applied; a crash mid-apply replays it on restart.
                if let Err(err) = self.checkpoint.save_now().await {
                    eprintln!("[drivemirrord] checkpoint write failed: {err}");
                    self.status
                        .report_error(format!("checkpoint write failed: {err}"));
                }
                self.status.set_status(SyncStatus::ApplyingRemoteChange);
                let result = self.engine.apply_remote_changes(&changes).await;
                self.status.set_status(SyncStatus::Idle);
                match result {
                    Ok(count) => applied = count,
                    Err(err) => {
                        eprintln!("[drivemirrord] remote change apply failed: {err}");
                        self.status
                            .report_error(format!("remote change apply failed: {err}"));
                        return;
                    }
                }
            }

            // The token only moves forward once the batch has been applied.
            {
                let mut state = self.state.lock().expect("sync state mutex poisoned");
                if let Some(start) = new_start_token {
                    state.change_token = Some(start);
                }
                state.pending.clear();
            }
            if let Err(err) = self.checkpoint.maybe_save(applied).await {
                eprintln!("[drivemirrord] checkpoint write failed: {err}");
                self.status
                    .report_error(format!("checkpoint write failed: {err}"));
            }

            if applied > 0 {
                interval.reset();
            } else {
                interval.back_off();
            }
            if self.sleep(interval.current()).await {
                return;
            }
        }
    }

    /// Sleeps unless the close signal arrives first; true means shut down.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_starts_at_the_initial_value() {
        let interval = PollInterval::new();
        assert_eq!(interval.current(), Duration::from_secs(8));
    }

    #[test]
    fn applied_changes_reset_to_the_floor() {
        let mut interval = PollInterval::new();
        interval.reset();
        assert_eq!(interval.current(), Duration::from_secs(2));
    }

    #[test]
    fn idle_polls_back_off_up_to_the_cap() {
        let mut interval = PollInterval::new();
        interval.reset();
        let mut previous = interval.current();
        for _ in 0..12 {
            interval.back_off();
            assert!(interval.current() >= previous);
            previous = interval.current();
        }
        assert_eq!(interval.current(), Duration::from_secs(30));
    }

    #[test]
    fn backoff_factor_is_applied_per_step() {
        let mut interval = PollInterval::new();
        interval.reset();
        interval.back_off();
        assert_eq!(interval.current(), Duration::from_secs(3));
    }
}

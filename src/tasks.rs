//! Tracked background jobs tied to process shutdown.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Detached jobs (read receipts, self-destruct waiters) spawned off the
/// event-handling path.
///
/// Cloning shares the same tracker and shutdown token.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn a job that is dropped if still running at shutdown.
    pub fn spawn<F>(&self, label: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = job => {}
                _ = token.cancelled() => {
                    tracing::debug!(job = label, "Background job abandoned at shutdown");
                }
            }
        });
    }

    /// Number of jobs still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Stop accepting jobs, cancel the running ones, and wait up to `grace`
    /// for them to unwind. Returns how many were abandoned.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tracker.close();
        let abandoned = self.tracker.len();
        self.shutdown_token.cancel();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "Background jobs did not stop within {:?} ({} still running)",
                grace,
                self.tracker.len()
            );
        }
        if abandoned > 0 {
            tracing::info!("Abandoned {} background job(s) at shutdown", abandoned);
        }
        abandoned
    }
}

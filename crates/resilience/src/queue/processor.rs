use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::core::TransactionQueue;
use crate::time::Clock;

/// Handle to the background task that runs [`TransactionQueue::process_due`]
/// on a fixed interval.
///
/// Every tick starts its cycle as a separate task, so a slow handler never
/// delays the cycles behind it. Entries still being attempted are skipped
/// by later cycles.
///
/// Stopping prevents further cycles from starting; cycles already running
/// finish their attempts. Dropping the handle stops the task as well.
#[derive(Debug)]
pub struct QueueProcessor {
    token: CancellationToken,
    cycles: TaskTracker,
    handle: Option<JoinHandle<()>>,
}

impl QueueProcessor {
    /// Spawn the processing loop on the current tokio runtime.
    ///
    /// The first cycle runs one `processing_interval` after spawning.
    #[must_use]
    pub fn spawn<C: Clock>(queue: Arc<TransactionQueue<C>>) -> Self {
        let token = CancellationToken::new();
        let cycles = TaskTracker::new();
        let period = queue.config().processing_interval;
        let cancelled = token.clone();
        let tracker = cycles.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval = ?period, "Transaction queue processor started");
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let queue = Arc::clone(&queue);
                tracker.spawn(async move {
                    let report = queue.process_due().await;
                    if report.attempted > 0 {
                        debug!(
                            attempted = report.attempted,
                            succeeded = report.succeeded,
                            rescheduled = report.rescheduled,
                            failed_permanently = report.failed_permanently,
                            "Processing cycle finished"
                        );
                    }
                });
            }

            tracker.close();
            debug!(running = tracker.len(), "Waiting for running cycles");
            tracker.wait().await;
            info!("Transaction queue processor stopped");
        });

        Self { token, cycles, handle: Some(handle) }
    }

    /// Prevent further cycles from starting.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the background task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Number of processing cycles currently running.
    #[must_use]
    pub fn running_cycles(&self) -> usize {
        self.cycles.len()
    }

    /// Stop and wait for every running cycle to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Transaction queue processor task ended abnormally");
            }
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<C: Clock> TransactionQueue<C> {
    /// Spawn a [`QueueProcessor`] for this queue.
    #[must_use]
    pub fn start_processor(self: &Arc<Self>) -> QueueProcessor {
        QueueProcessor::spawn(Arc::clone(self))
    }
}

//! Per-job monitor task: progress, completion and timeout

use log::debug;
use std::sync::Arc;
use std::time::Duration;

use s5_runner::{TransferController, TransferEvents};

use super::orchestrator::Inner;

/// Runs until the engine's completion arrives, mirroring progress into the
/// job table meanwhile. Fires the timeout at most once.
pub(super) async fn monitor_job(
    inner: Arc<Inner>,
    id: String,
    controller: Arc<TransferController>,
    events: TransferEvents,
    timeout: Duration,
) {
    let TransferEvents {
        mut progress,
        mut completion,
    } = events;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut progress_open = true;
    let mut timed_out = false;

    let outcome = loop {
        tokio::select! {
            changed = progress.changed(), if progress_open => {
                if changed.is_err() {
                    progress_open = false;
                    continue;
                }
                let value = *progress.borrow_and_update();
                inner.record_progress(&id, value).await;
            }
            outcome = &mut completion => break outcome.ok(),
            _ = &mut deadline, if !timed_out => {
                timed_out = true;
                inner.time_out(&id, &controller, timeout).await;
            }
        }
    };

    debug!("download_monitor: {} finished", id);
    inner.finish(&id, outcome).await;
}

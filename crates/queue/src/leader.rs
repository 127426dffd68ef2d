//! Leader recovery loop.
//!
//! Only the instance holding the leader lease runs this. Every tick it asks
//! the store to requeue retryable failures whose backoff elapsed and to
//! reclaim rows stranded by dead workers. The sweep is idempotent, so a
//! leader handover between ticks is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swig_store::JobStore;

pub(crate) async fn run_recovery<S: JobStore>(
    store: Arc<S>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so sweeps start one
    // interval after leadership.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.requeue_retryable().await {
            Ok(requeued) if !requeued.is_empty() => {
                let total: i64 = requeued.iter().map(|job| i64::from(job.attempts)).sum();
                info!(
                    count = requeued.len(),
                    avg_attempts = total as f64 / requeued.len() as f64,
                    "requeued failed jobs for retry"
                );
            }
            Ok(_) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => warn!(error = %err, "failed to requeue failed jobs"),
        }
    }

    debug!("leader recovery loop stopped");
}

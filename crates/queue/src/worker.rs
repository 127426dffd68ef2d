//! The per-queue worker loop.
//!
//! Each loop repeats: try an untargeted claim; if nothing is eligible, block
//! on a notification hint (or the idle poll interval, whichever fires
//! first) and chase the hinted row with a targeted claim. Notifications are
//! hints, not a contract; the untargeted claim is what makes the loop
//! correct when they are dropped or lost to a race.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use swig_core::{ClaimedJob, HandlerRegistry, InstanceId, JobContext, QueueName, StoreError, WorkerId};
use swig_store::{JobStore, JobSubscription};

/// Sleep after a store error before the next cycle, so transient failures
/// do not turn into a hot loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on idle waiting; doubles as the polling fallback for stores
/// that cannot push notifications.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) async fn run<S: JobStore>(
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    queue: QueueName,
    instance: InstanceId,
    shutdown: CancellationToken,
) {
    let mut subscription: Option<Box<dyn JobSubscription>> = None;

    while !shutdown.is_cancelled() {
        if subscription.is_none() {
            match store.subscribe().await {
                Ok(sub) => subscription = Some(sub),
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "failed to open notification stream");
                    if pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            }
        }

        match store.claim_next(&queue, instance, WorkerId::new()).await {
            Ok(Some(job)) => {
                if let Err(err) = run_job(store.as_ref(), &registry, job, &shutdown).await {
                    error!(queue = %queue, error = %err, "failed to record job outcome");
                    if pause(&shutdown).await {
                        break;
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(err) if err.is_cancelled() => continue,
            Err(err) => {
                error!(queue = %queue, error = %err, "claim failed");
                if pause(&shutdown).await {
                    break;
                }
                continue;
            }
        }

        let Some(sub) = subscription.as_mut() else {
            continue;
        };
        let waited = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => continue,
            received = sub.recv() => received,
        };
        let notice = match waited {
            Ok(notice) => notice,
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                warn!(queue = %queue, error = %err, "notification stream failed; reopening");
                subscription = None;
                if pause(&shutdown).await {
                    break;
                }
                continue;
            }
        };

        let Some(id) = notice.and_then(|n| n.id) else {
            continue;
        };
        match store.claim_specific(id, instance, WorkerId::new()).await {
            Ok(Some(job)) => {
                if let Err(err) = run_job(store.as_ref(), &registry, job, &shutdown).await {
                    error!(queue = %queue, error = %err, "failed to record job outcome");
                    if pause(&shutdown).await {
                        break;
                    }
                }
            }
            // Another worker won the race; indistinguishable from no work.
            Ok(None) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(queue = %queue, error = %err, "targeted claim failed");
                if pause(&shutdown).await {
                    break;
                }
            }
        }
    }

    debug!(queue = %queue, "worker loop stopped");
}

/// Dispatch one claimed row and record its outcome. The returned error is a
/// store failure while recording, never the handler's own failure.
async fn run_job<S: JobStore>(
    store: &S,
    registry: &HandlerRegistry,
    job: ClaimedJob,
    shutdown: &CancellationToken,
) -> Result<(), StoreError> {
    let ClaimedJob {
        id,
        kind,
        queue,
        payload,
        attempt,
        max_attempts,
    } = job;
    debug!(job_id = %id, kind = %kind, attempt, "claimed job");

    let prepared = match registry.prepare(&kind, payload) {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(job_id = %id, kind = %kind, error = %err, "job cannot be dispatched");
            return store.fail_job(id, &err.to_string()).await;
        }
    };

    let ctx = JobContext::new(id, queue, attempt, max_attempts, shutdown.child_token());
    match prepared.run(ctx).await {
        Ok(()) => {
            debug!(job_id = %id, kind = %kind, "job completed");
            store.complete_job(id).await
        }
        Err(err) => {
            warn!(job_id = %id, kind = %kind, attempt, error = %err, "job failed");
            store.fail_job(id, &err.to_string()).await
        }
    }
}

/// Returns true when shutdown fired during the backoff.
async fn pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(ERROR_BACKOFF) => false,
    }
}

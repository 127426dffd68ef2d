//! The dispatcher: queue configuration, worker pools, leadership, the
//! enqueue API, and the graceful-shutdown protocol.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swig_core::{
    EnqueueError, HandlerRegistry, InstanceId, JobHandler, JobId, JobOptions, LeaderId, NewJob,
    QueueName, ShutdownTimeout, StoreError,
};
use swig_store::postgres::{insert_job_with, insert_jobs_with};
use swig_store::JobStore;

use crate::{leader, worker};

/// Floor on the per-queue pool size; smaller configurations are raised.
const MIN_WORKERS: usize = 3;

/// Applied when `stop` is called without a deadline.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a dead leader's lease blocks recovery at most.
const LEADER_TTL: Duration = Duration::from_secs(30);

/// Cadence of the leader's recovery sweep.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// One named queue and the size of its worker pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue: QueueName,
    pub max_workers: usize,
}

impl QueueConfig {
    pub fn new(queue: QueueName, max_workers: usize) -> Self {
        Self { queue, max_workers }
    }

    fn effective_workers(&self) -> usize {
        self.max_workers.max(MIN_WORKERS)
    }
}

/// A dispatcher instance.
///
/// Construct with [`Dispatcher::new`], call [`Dispatcher::start`] once, and
/// [`Dispatcher::stop`] on the way out. Enqueueing works before `start` and
/// from any number of tasks concurrently.
pub struct Dispatcher<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    queues: Vec<QueueConfig>,
    instance_id: InstanceId,
    shutdown: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
    leader_task: Mutex<Option<JoinHandle<()>>>,
    leader_id: Mutex<Option<LeaderId>>,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(store: Arc<S>, queues: Vec<QueueConfig>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            queues,
            instance_id: InstanceId::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(None),
            leader_task: Mutex::new(None),
            leader_id: Mutex::new(None),
        }
    }

    /// The identity stamped on every row this instance claims.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Whether this instance currently holds the leader lease.
    pub fn is_leader(&self) -> bool {
        self.leader_id.lock().unwrap().is_some()
    }

    /// Number of running worker loops across all queues.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .as_ref()
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Bootstrap the schema (best effort), attempt leadership, and start the
    /// worker pools.
    pub async fn start(&self) {
        if let Err(err) = self.store.ensure_schema().await {
            warn!(error = %err, "schema bootstrap failed; continuing");
        }

        self.try_become_leader().await;

        let mut workers = JoinSet::new();
        for config in &self.queues {
            let pool_size = config.effective_workers();
            for _ in 0..pool_size {
                workers.spawn(worker::run(
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    config.queue.clone(),
                    self.instance_id,
                    self.shutdown.clone(),
                ));
            }
            info!(queue = %config.queue, workers = pool_size, "started worker pool");
        }
        *self.workers.lock().unwrap() = Some(workers);
    }

    /// Gracefully shut down.
    ///
    /// Signals every worker loop, waits up to `timeout` (default 30 s) for
    /// in-flight handlers to finish, then releases every row this instance
    /// still owns and gives up leadership. On timeout the remaining workers
    /// are aborted, cleanup still runs, and `ShutdownTimeout` is returned.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), ShutdownTimeout> {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown.cancel();

        let workers = self.workers.lock().unwrap().take();
        let mut timed_out = false;
        if let Some(mut workers) = workers {
            let drained = tokio::time::timeout(timeout, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(?timeout, "shutdown timed out; aborting remaining workers");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                timed_out = true;
            } else {
                info!("all workers stopped");
            }
        }

        let leader_task = self.leader_task.lock().unwrap().take();
        if let Some(leader_task) = leader_task {
            let _ = leader_task.await;
        }

        match self.store.release_instance_jobs(self.instance_id).await {
            Ok(released) if !released.is_empty() => {
                info!(count = released.len(), "released in-flight jobs during shutdown");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to release in-flight jobs"),
        }

        let leader = self.leader_id.lock().unwrap().take();
        if let Some(leader) = leader {
            if let Err(err) = self.store.release_leadership(leader).await {
                warn!(error = %err, "failed to release leadership");
            }
        }

        self.store.close().await;

        if timed_out {
            Err(ShutdownTimeout { timeout })
        } else {
            Ok(())
        }
    }

    /// Destructively drop the queue's tables and trigger. Not part of
    /// graceful shutdown; intended for test teardown.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.teardown_schema().await
    }

    /// Enqueue one job with default options.
    pub async fn enqueue<H: JobHandler>(&self, handler: &H) -> Result<JobId, EnqueueError> {
        self.enqueue_with(handler, JobOptions::default()).await
    }

    /// Enqueue one job with explicit options.
    pub async fn enqueue_with<H: JobHandler>(
        &self,
        handler: &H,
        opts: JobOptions,
    ) -> Result<JobId, EnqueueError> {
        let job = NewJob::from_handler(handler, opts)?;
        Ok(self.store.insert_job(&job).await?)
    }

    /// Enqueue many jobs in one statement: all rows commit or none do.
    /// Build items with [`NewJob::from_handler`].
    pub async fn enqueue_batch(&self, jobs: &[NewJob]) -> Result<(), EnqueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        Ok(self.store.insert_jobs(jobs).await?)
    }

    /// Enqueue one job inside a caller-owned transaction, so the row commits
    /// or rolls back with the caller's own writes. Pass `&mut *tx` for a
    /// [`sqlx::Transaction`].
    pub async fn enqueue_in_tx<H: JobHandler>(
        &self,
        conn: &mut sqlx::PgConnection,
        handler: &H,
        opts: JobOptions,
    ) -> Result<JobId, EnqueueError> {
        let job = NewJob::from_handler(handler, opts)?;
        Ok(insert_job_with(conn, &job).await?)
    }

    /// Enqueue many jobs inside a caller-owned transaction, as one statement.
    pub async fn enqueue_batch_in_tx(
        &self,
        conn: &mut sqlx::PgConnection,
        jobs: &[NewJob],
    ) -> Result<(), EnqueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        Ok(insert_jobs_with(conn, jobs).await?)
    }

    async fn try_become_leader(&self) {
        let leader = LeaderId::new();
        match self.store.try_acquire_leadership(leader, LEADER_TTL).await {
            Ok(true) => {
                info!(leader_id = %leader, "acquired queue leadership");
                *self.leader_id.lock().unwrap() = Some(leader);
                let task = tokio::spawn(leader::run_recovery(
                    Arc::clone(&self.store),
                    self.shutdown.clone(),
                    RETRY_INTERVAL,
                ));
                *self.leader_task.lock().unwrap() = Some(task);
            }
            Ok(false) => debug!("another instance holds leadership; following"),
            Err(err) => warn!(error = %err, "failed to determine leadership; following"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_pools_are_raised_to_the_minimum() {
        assert_eq!(QueueConfig::new(QueueName::standard(), 1).effective_workers(), 3);
        assert_eq!(QueueConfig::new(QueueName::standard(), 0).effective_workers(), 3);
        assert_eq!(QueueConfig::new(QueueName::priority(), 8).effective_workers(), 8);
    }
}

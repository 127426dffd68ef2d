//! The set of store operations the dispatcher depends on.
//!
//! Implementations must be safe for concurrent use from many worker loops.
//! Claims must guarantee at-most-one owner per row across all processes
//! sharing the store.

use std::time::Duration;

use async_trait::async_trait;

use swig_core::{ClaimedJob, InstanceId, JobId, LeaderId, NewJob, QueueName, StoreError, WorkerId};

/// A row-insert hint delivered over the notification channel.
///
/// Hints are best-effort: they may be dropped, duplicated, or lost to a
/// claim race. Correctness rests on the untargeted claim path.
#[derive(Debug, Clone)]
pub struct JobNotice {
    pub id: Option<JobId>,
    pub queue: Option<String>,
    pub kind: Option<String>,
}

/// A job requeued by the recovery sweep.
#[derive(Debug, Clone, Copy)]
pub struct RequeuedJob {
    pub id: JobId,
    pub attempts: i32,
}

/// A per-worker stream of [`JobNotice`] hints.
///
/// `recv` resolves to `Ok(None)` when a notification arrived but carried no
/// usable hint (malformed payload, missed messages); callers treat that the
/// same as no work.
#[async_trait]
pub trait JobSubscription: Send {
    async fn recv(&mut self) -> Result<Option<JobNotice>, StoreError>;
}

/// Database operations backing the queue.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Idempotently create the tables, trigger, and trigger function.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Destructively drop everything `ensure_schema` created. For test
    /// teardown and administrative cleanup only.
    async fn teardown_schema(&self) -> Result<(), StoreError>;

    /// Insert one job row as `pending`.
    async fn insert_job(&self, job: &NewJob) -> Result<JobId, StoreError>;

    /// Insert many job rows in one statement: all commit or none do.
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<(), StoreError>;

    /// Claim the best eligible row for a worker bound to `queue`.
    ///
    /// Eligible priority-queue rows preempt `queue` globally; within the
    /// eligible set, higher `priority` wins and older `created_at` breaks
    /// ties. Contended rows are skipped, never waited on. `None` means no
    /// eligible work.
    async fn claim_next(
        &self,
        queue: &QueueName,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// Claim one specific row, typically from a notification hint. `None`
    /// when another worker won the race or the row is not yet due.
    async fn claim_specific(
        &self,
        id: JobId,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// Record a successful execution: `processing -> completed`, ownership
    /// cleared.
    async fn complete_job(&self, id: JobId) -> Result<(), StoreError>;

    /// Record a failed execution. Retryable rows go back to `pending` with
    /// their next eligibility pushed out by `2^attempts` seconds; exhausted
    /// rows go terminally `failed`. Ownership is cleared either way.
    async fn fail_job(&self, id: JobId, error: &str) -> Result<(), StoreError>;

    /// Leader-only recovery sweep: requeue `failed` rows whose backoff
    /// elapsed and attempts remain, and reclaim `processing` rows whose
    /// owner's lock has gone stale.
    async fn requeue_retryable(&self) -> Result<Vec<RequeuedJob>, StoreError>;

    /// Shutdown cleanup: release every row this instance still owns, back
    /// to `pending` or terminally `failed` depending on attempts.
    async fn release_instance_jobs(&self, instance: InstanceId) -> Result<Vec<JobId>, StoreError>;

    /// Try to become the single leader. Non-blocking; `false` means another
    /// live process holds leadership.
    async fn try_acquire_leadership(
        &self,
        leader: LeaderId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Give up leadership previously acquired under `leader`.
    async fn release_leadership(&self, leader: LeaderId) -> Result<(), StoreError>;

    /// Open a notification stream for one worker loop. Loops subscribe
    /// independently.
    async fn subscribe(&self) -> Result<Box<dyn JobSubscription>, StoreError>;

    /// Release held resources. Optional; the default does nothing.
    async fn close(&self) {}
}

//! In-memory job store for tests and development.
//!
//! Implements the same dispatch policy as the Postgres store: priority-queue
//! preemption, `scheduled_for` gating, attempt accounting, single-owner
//! claims (the mutex stands in for row locks), and the leadership flag.
//! Insert wake-ups go over a broadcast channel instead of LISTEN/NOTIFY.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use swig_core::{
    ClaimedJob, InstanceId, JobId, JobStatus, LeaderId, NewJob, QueueName, StoreError, WorkerId,
};

use crate::contract::{JobNotice, JobStore, JobSubscription, RequeuedJob};

/// A stored job with the same fields as a `swig_jobs` row. Exposed so tests
/// can assert on row state.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub instance_id: Option<InstanceId>,
    pub worker_id: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

struct Stored {
    seq: u64,
    record: JobRecord,
}

struct Inner {
    next_seq: u64,
    jobs: HashMap<JobId, Stored>,
}

pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    notify: broadcast::Sender<JobNotice>,
    leader: Mutex<Option<LeaderId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                next_seq: 0,
                jobs: HashMap::new(),
            }),
            notify,
            leader: Mutex::new(None),
        }
    }

    /// Look up a job row by id.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .map(|s| s.record.clone())
    }

    /// All rows in insertion order.
    pub fn all(&self) -> Vec<JobRecord> {
        let inner = self.inner.lock().unwrap();
        let mut stored: Vec<_> = inner.jobs.values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.iter().map(|s| s.record.clone()).collect()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|s| s.record.status == status)
            .count()
    }

    fn insert_locked(
        &self,
        inner: &mut Inner,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> (JobId, JobNotice) {
        let id = JobId::new();
        let record = JobRecord {
            id,
            kind: job.kind.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            status: JobStatus::Pending,
            priority: job.priority,
            attempts: 0,
            max_attempts: job.max_attempts,
            created_at: now,
            scheduled_for: job.run_at.unwrap_or(now),
            instance_id: None,
            worker_id: None,
            locked_at: None,
            last_error: None,
            last_error_at: None,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Stored { seq, record });
        let notice = JobNotice {
            id: Some(id),
            queue: Some(job.queue.as_str().to_string()),
            kind: Some(job.kind.clone()),
        };
        (id, notice)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn eligible(record: &JobRecord, now: DateTime<Utc>) -> bool {
    record.status == JobStatus::Pending && record.scheduled_for <= now
}

fn backoff(attempts: i32) -> chrono::Duration {
    chrono::Duration::seconds(1i64 << attempts.clamp(0, 30))
}

fn claim(record: &mut JobRecord, instance: InstanceId, worker: WorkerId, now: DateTime<Utc>) -> ClaimedJob {
    record.status = JobStatus::Processing;
    record.attempts += 1;
    record.instance_id = Some(instance);
    record.worker_id = Some(worker);
    record.locked_at = Some(now);
    ClaimedJob {
        id: record.id,
        kind: record.kind.clone(),
        queue: record.queue.clone(),
        payload: record.payload.clone(),
        attempt: record.attempts,
        max_attempts: record.max_attempts,
    }
}

fn release(record: &mut JobRecord) {
    record.instance_id = None;
    record.worker_id = None;
    record.locked_at = None;
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn teardown_schema(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().jobs.clear();
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob) -> Result<JobId, StoreError> {
        let (id, notice) = {
            let mut inner = self.inner.lock().unwrap();
            self.insert_locked(&mut inner, job, Utc::now())
        };
        let _ = self.notify.send(notice);
        Ok(id)
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<(), StoreError> {
        let notices = {
            let mut inner = self.inner.lock().unwrap();
            let now = Utc::now();
            jobs.iter()
                .map(|job| self.insert_locked(&mut inner, job, now).1)
                .collect::<Vec<_>>()
        };
        for notice in notices {
            let _ = self.notify.send(notice);
        }
        Ok(())
    }

    async fn claim_next(
        &self,
        queue: &QueueName,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let priority_ready = inner
            .jobs
            .values()
            .any(|s| s.record.queue.is_priority() && eligible(&s.record, now));

        let winner = inner
            .jobs
            .values()
            .filter(|s| {
                eligible(&s.record, now)
                    && if priority_ready {
                        s.record.queue.is_priority()
                    } else {
                        s.record.queue == *queue
                    }
            })
            .min_by_key(|s| {
                (
                    !s.record.queue.is_priority(),
                    Reverse(s.record.priority),
                    s.record.created_at,
                    s.seq,
                )
            })
            .map(|s| s.record.id);

        Ok(winner.and_then(|id| {
            inner
                .jobs
                .get_mut(&id)
                .map(|s| claim(&mut s.record, instance, worker, now))
        }))
    }

    async fn claim_specific(
        &self,
        id: JobId,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get_mut(&id).and_then(|s| {
            if eligible(&s.record, now) {
                Some(claim(&mut s.record, instance, worker, now))
            } else {
                None
            }
        }))
    }

    async fn complete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.jobs.get_mut(&id) {
            s.record.status = JobStatus::Completed;
            release(&mut s.record);
        }
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.jobs.get_mut(&id) {
            let record = &mut s.record;
            if record.attempts >= record.max_attempts {
                record.status = JobStatus::Failed;
            } else {
                record.status = JobStatus::Pending;
                record.scheduled_for = now + backoff(record.attempts);
            }
            record.last_error = Some(error.to_string());
            record.last_error_at = Some(now);
            release(record);
        }
        Ok(())
    }

    async fn requeue_retryable(&self) -> Result<Vec<RequeuedJob>, StoreError> {
        let now = Utc::now();
        let stale_before = now - chrono::Duration::minutes(5);
        let mut inner = self.inner.lock().unwrap();
        let mut requeued = Vec::new();

        for s in inner.jobs.values_mut() {
            let record = &mut s.record;
            let failed_retryable = record.status == JobStatus::Failed
                && record.attempts < record.max_attempts
                && (record.instance_id.is_none()
                    || record.locked_at.is_some_and(|t| t < stale_before))
                && (record.last_error.is_none()
                    || record
                        .last_error_at
                        .is_some_and(|t| t < now - backoff(record.attempts)));
            let orphaned = record.status == JobStatus::Processing
                && record.locked_at.is_some_and(|t| t < stale_before);

            if !failed_retryable && !orphaned {
                continue;
            }

            record.status = if orphaned && record.attempts >= record.max_attempts {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            release(record);
            record.scheduled_for = if record.attempts > 0 {
                now + backoff(record.attempts)
            } else {
                now
            };
            requeued.push(RequeuedJob {
                id: record.id,
                attempts: record.attempts,
            });
        }

        Ok(requeued)
    }

    async fn release_instance_jobs(&self, instance: InstanceId) -> Result<Vec<JobId>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut released = Vec::new();

        for s in inner.jobs.values_mut() {
            let record = &mut s.record;
            if record.instance_id != Some(instance) {
                continue;
            }
            if record.attempts >= record.max_attempts {
                record.status = JobStatus::Failed;
                record.last_error = Some("Job failed due to instance shutdown".to_string());
            } else {
                record.status = JobStatus::Pending;
            }
            release(record);
            released.push(record.id);
        }

        Ok(released)
    }

    async fn try_acquire_leadership(
        &self,
        leader: LeaderId,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut slot = self.leader.lock().unwrap();
        match *slot {
            Some(current) if current != leader => Ok(false),
            _ => {
                *slot = Some(leader);
                Ok(true)
            }
        }
    }

    async fn release_leadership(&self, leader: LeaderId) -> Result<(), StoreError> {
        let mut slot = self.leader.lock().unwrap();
        if *slot == Some(leader) {
            *slot = None;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn JobSubscription>, StoreError> {
        Ok(Box::new(InMemorySubscription {
            rx: self.notify.subscribe(),
        }))
    }
}

struct InMemorySubscription {
    rx: broadcast::Receiver<JobNotice>,
}

#[async_trait]
impl JobSubscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Option<JobNotice>, StoreError> {
        match self.rx.recv().await {
            Ok(notice) => Ok(Some(notice)),
            // Missed wake-ups are just dropped hints.
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(None),
            Err(broadcast::error::RecvError::Closed) => Err(StoreError::Cancelled),
        }
    }
}

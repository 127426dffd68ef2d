//! Postgres-backed job store.
//!
//! The claim statement locks its candidate row with `FOR UPDATE SKIP
//! LOCKED`, so concurrent workers fan out across rows instead of convoying
//! on the head of the queue. Row inserts fire a trigger that emits the
//! `{id, queue, kind}` envelope on the `swig_jobs` channel; worker loops
//! receive it through [`PgListener`] subscriptions.
//!
//! Leadership uses a session-scoped advisory lock, so the acquiring
//! connection is pinned for the whole leadership tenure; releasing (or
//! dropping) that connection releases the lock.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use swig_core::{
    ClaimedJob, InstanceId, JobId, LeaderId, NewJob, QueueName, StoreError, WorkerId,
};

use crate::contract::{JobNotice, JobStore, JobSubscription, RequeuedJob};

/// Channel the insert trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "swig_jobs";

/// Process-wide advisory lock key guarding leadership.
const LEADER_LOCK_ID: i64 = 1_234_567;

/// Primary key of the singleton lease row.
const LEADER_KEY: &str = "queue_leader";

const CREATE_JOBS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS swig_jobs (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    kind VARCHAR NOT NULL,
    queue VARCHAR NOT NULL,
    payload JSONB NOT NULL,
    status VARCHAR NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    scheduled_for TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    instance_id UUID,
    worker_id UUID,
    locked_at TIMESTAMPTZ,
    last_error TEXT,
    last_error_at TIMESTAMPTZ,

    CONSTRAINT valid_status CHECK (status IN (
        'pending', 'processing', 'completed', 'failed', 'scheduled'
    ))
);

CREATE OR REPLACE FUNCTION notify_job_created()
    RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify(
        'swig_jobs',
        json_build_object(
            'id', NEW.id,
            'queue', NEW.queue,
            'kind', NEW.kind
        )::text
    );
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS swig_jobs_notify_trigger ON swig_jobs;
CREATE TRIGGER swig_jobs_notify_trigger
    AFTER INSERT ON swig_jobs
    FOR EACH ROW
    EXECUTE FUNCTION notify_job_created();
"#;

const CREATE_LEADER_SQL: &str = r#"
CREATE UNLOGGED TABLE IF NOT EXISTS swig_leader (
    id TEXT PRIMARY KEY,
    leader_id UUID NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT leader_expires_future CHECK (expires_at > NOW())
);
"#;

const TEARDOWN_SQL: &str = r#"
DROP TRIGGER IF EXISTS swig_jobs_notify_trigger ON swig_jobs;
DROP FUNCTION IF EXISTS notify_job_created();
DROP TABLE IF EXISTS swig_jobs;
DROP TABLE IF EXISTS swig_leader;
"#;

const CLAIM_NEXT_SQL: &str = r#"
UPDATE swig_jobs
SET status = 'processing',
    instance_id = $1,
    worker_id = $2,
    locked_at = NOW(),
    attempts = attempts + 1
WHERE id = (
    SELECT id
    FROM swig_jobs
    WHERE status = 'pending'
        AND scheduled_for <= NOW()
        AND (
            (queue = 'priority' AND EXISTS (
                SELECT 1 FROM swig_jobs
                WHERE queue = 'priority'
                AND status = 'pending'
                AND scheduled_for <= NOW()
            ))
            OR (queue = $3 AND NOT EXISTS (
                SELECT 1 FROM swig_jobs
                WHERE queue = 'priority'
                AND status = 'pending'
                AND scheduled_for <= NOW()
            ))
        )
    ORDER BY
        queue = 'priority' DESC,
        priority DESC,
        created_at
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING id, kind, queue, payload, attempts, max_attempts
"#;

const CLAIM_SPECIFIC_SQL: &str = r#"
UPDATE swig_jobs
SET status = 'processing',
    instance_id = $1,
    worker_id = $2,
    locked_at = NOW(),
    attempts = attempts + 1
WHERE id = $3
    AND status = 'pending'
    AND scheduled_for <= NOW()
RETURNING id, kind, queue, payload, attempts, max_attempts
"#;

const COMPLETE_SQL: &str = r#"
UPDATE swig_jobs
SET status = 'completed',
    instance_id = NULL,
    worker_id = NULL,
    locked_at = NULL
WHERE id = $1
"#;

const FAIL_SQL: &str = r#"
UPDATE swig_jobs
SET status = CASE
        WHEN attempts >= max_attempts THEN 'failed'
        ELSE 'pending'
    END,
    scheduled_for = CASE
        WHEN attempts >= max_attempts THEN scheduled_for
        ELSE NOW() + (interval '1 second' * pow(2, attempts))
    END,
    last_error = $2,
    last_error_at = NOW(),
    instance_id = NULL,
    worker_id = NULL,
    locked_at = NULL
WHERE id = $1
"#;

const REQUEUE_SQL: &str = r#"
UPDATE swig_jobs
SET status = CASE
        WHEN status = 'processing' AND attempts >= max_attempts THEN 'failed'
        ELSE 'pending'
    END,
    instance_id = NULL,
    worker_id = NULL,
    locked_at = NULL,
    scheduled_for = CASE
        WHEN attempts > 0 THEN NOW() + (interval '1 second' * pow(2, attempts))
        ELSE NOW()
    END
WHERE (
        status = 'failed'
        AND attempts < max_attempts
        AND (instance_id IS NULL OR locked_at < NOW() - interval '5 minutes')
        AND (last_error IS NULL OR last_error_at < NOW() - (interval '1 second' * pow(2, attempts)))
    )
    OR (status = 'processing' AND locked_at < NOW() - interval '5 minutes')
RETURNING id, attempts
"#;

const RELEASE_INSTANCE_SQL: &str = r#"
UPDATE swig_jobs
SET status = CASE
        WHEN attempts >= max_attempts THEN 'failed'
        ELSE 'pending'
    END,
    instance_id = NULL,
    worker_id = NULL,
    locked_at = NULL,
    last_error = CASE
        WHEN attempts >= max_attempts THEN 'Job failed due to instance shutdown'
        ELSE last_error
    END
WHERE instance_id = $1
RETURNING id
"#;

const INSERT_SQL: &str = r#"
INSERT INTO swig_jobs (kind, queue, payload, priority, scheduled_for, max_attempts, status)
VALUES ($1, $2, $3, $4, COALESCE($5, NOW()), $6, 'pending')
RETURNING id
"#;

/// Postgres job store over a shared connection pool.
pub struct PostgresJobStore {
    pool: PgPool,
    /// Connection pinned while this process holds the leader advisory lock.
    leader_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            leader_conn: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(CREATE_JOBS_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_jobs_table", e))?;
        sqlx::raw_sql(CREATE_LEADER_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_leader_table", e))?;
        Ok(())
    }

    async fn teardown_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(TEARDOWN_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("teardown_schema", e))?;
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob) -> Result<JobId, StoreError> {
        insert_job_with(&self.pool, job).await
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<(), StoreError> {
        insert_jobs_with(&self.pool, jobs).await
    }

    async fn claim_next(
        &self,
        queue: &QueueName,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let row = sqlx::query(CLAIM_NEXT_SQL)
            .bind(instance.as_uuid())
            .bind(worker.as_uuid())
            .bind(queue.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|row| claimed_from_row(&row, "claim_next")).transpose()
    }

    async fn claim_specific(
        &self,
        id: JobId,
        instance: InstanceId,
        worker: WorkerId,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let row = sqlx::query(CLAIM_SPECIFIC_SQL)
            .bind(instance.as_uuid())
            .bind(worker.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_specific", e))?;

        row.map(|row| claimed_from_row(&row, "claim_specific")).transpose()
    }

    async fn complete_job(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query(COMPLETE_SQL)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?;
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        sqlx::query(FAIL_SQL)
            .bind(id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail_job", e))?;
        Ok(())
    }

    async fn requeue_retryable(&self) -> Result<Vec<RequeuedJob>, StoreError> {
        let rows = sqlx::query(REQUEUE_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_retryable", e))?;

        rows.iter()
            .map(|row| -> Result<RequeuedJob, StoreError> {
                let id: Uuid = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("requeue_retryable", e))?;
                let attempts: i32 = row
                    .try_get("attempts")
                    .map_err(|e| map_sqlx_error("requeue_retryable", e))?;
                Ok(RequeuedJob {
                    id: JobId::from_uuid(id),
                    attempts,
                })
            })
            .collect()
    }

    async fn release_instance_jobs(&self, instance: InstanceId) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(RELEASE_INSTANCE_SQL)
            .bind(instance.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_instance_jobs", e))?;

        rows.iter()
            .map(|row| -> Result<JobId, StoreError> {
                let id: Uuid = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("release_instance_jobs", e))?;
                Ok(JobId::from_uuid(id))
            })
            .collect()
    }

    async fn try_acquire_leadership(
        &self,
        leader: LeaderId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_leader_conn", e))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(LEADER_LOCK_ID)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("try_advisory_lock", e))?;

        if !acquired {
            return Ok(false);
        }

        let lease = sqlx::query(
            r#"
            INSERT INTO swig_leader (id, leader_id, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (id) DO UPDATE
            SET leader_id = EXCLUDED.leader_id,
                expires_at = EXCLUDED.expires_at,
                acquired_at = NOW()
            "#,
        )
        .bind(LEADER_KEY)
        .bind(leader.as_uuid())
        .bind(ttl.as_secs_f64())
        .execute(&mut *conn)
        .await;

        match lease {
            Ok(_) => {
                *self.leader_conn.lock().await = Some(conn);
                Ok(true)
            }
            Err(err) => {
                // Lease write failed: give the lock back and report follower.
                let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(LEADER_LOCK_ID)
                    .execute(&mut *conn)
                    .await;
                Err(map_sqlx_error("upsert_leader_lease", err))
            }
        }
    }

    async fn release_leadership(&self, leader: LeaderId) -> Result<(), StoreError> {
        let conn = self.leader_conn.lock().await.take();

        sqlx::query("DELETE FROM swig_leader WHERE leader_id = $1")
            .bind(leader.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_leader_lease", e))?;

        if let Some(mut conn) = conn {
            if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(LEADER_LOCK_ID)
                .execute(&mut *conn)
                .await
            {
                // Dropping the pinned connection closes the session, which
                // releases the advisory lock anyway.
                warn!(error = %err, "failed to release leader advisory lock");
            }
        }

        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn JobSubscription>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::connection(e.to_string()))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| StoreError::connection(e.to_string()))?;
        Ok(Box::new(PgJobSubscription { listener }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Insert one job through any Postgres executor. Callers join their own
/// transaction by passing `&mut *tx`.
pub async fn insert_job_with<'c, E>(executor: E, job: &NewJob) -> Result<JobId, StoreError>
where
    E: sqlx::postgres::PgExecutor<'c>,
{
    let row = sqlx::query(INSERT_SQL)
        .bind(&job.kind)
        .bind(job.queue.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.max_attempts)
        .fetch_one(executor)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

    let id: Uuid = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(JobId::from_uuid(id))
}

/// Insert many jobs in a single multi-VALUES statement: all rows commit or
/// none do.
pub async fn insert_jobs_with<'c, E>(executor: E, jobs: &[NewJob]) -> Result<(), StoreError>
where
    E: sqlx::postgres::PgExecutor<'c>,
{
    if jobs.is_empty() {
        return Ok(());
    }

    let mut builder = sqlx::QueryBuilder::<Postgres>::new(
        "INSERT INTO swig_jobs (kind, queue, payload, priority, scheduled_for, max_attempts, status) ",
    );
    builder.push_values(jobs, |mut b, job| {
        b.push_bind(&job.kind)
            .push_bind(job.queue.as_str())
            .push_bind(&job.payload)
            .push_bind(job.priority)
            .push_bind(job.run_at.unwrap_or_else(Utc::now))
            .push_bind(job.max_attempts)
            .push_bind("pending");
    });

    builder
        .build()
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("insert_jobs", e))?;
    Ok(())
}

struct PgJobSubscription {
    listener: PgListener,
}

#[async_trait]
impl JobSubscription for PgJobSubscription {
    async fn recv(&mut self) -> Result<Option<JobNotice>, StoreError> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| StoreError::connection(e.to_string()))?;
        Ok(parse_notice(notification.payload()))
    }
}

#[derive(Deserialize)]
struct NoticeWire {
    id: Option<String>,
    queue: Option<String>,
    kind: Option<String>,
}

fn parse_notice(payload: &str) -> Option<JobNotice> {
    let wire: NoticeWire = serde_json::from_str(payload).ok()?;
    Some(JobNotice {
        id: wire.id.and_then(|s| s.parse().ok()),
        queue: wire.queue,
        kind: wire.kind,
    })
}

struct ClaimedRow {
    id: Uuid,
    kind: String,
    queue: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
}

impl<'r> FromRow<'r, PgRow> for ClaimedRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimedRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        })
    }
}

fn claimed_from_row(row: &PgRow, operation: &'static str) -> Result<ClaimedJob, StoreError> {
    let row = ClaimedRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    let queue = QueueName::new(row.queue)
        .map_err(|e| StoreError::database(operation, e.to_string()))?;
    Ok(ClaimedJob {
        id: JobId::from_uuid(row.id),
        kind: row.kind,
        queue,
        payload: row.payload,
        attempt: row.attempts,
        max_attempts: row.max_attempts,
    })
}

/// Map sqlx errors into the store taxonomy.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => {
            StoreError::connection(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => StoreError::database(operation, db_err.message().to_string()),
        other => StoreError::database(operation, other.to_string()),
    }
}

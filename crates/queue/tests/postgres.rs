//! Postgres integration coverage: schema bootstrap, transactional enqueue
//! atomicity, the insert trigger's NOTIFY round-trip, claim exclusivity, and
//! leadership. Runs only when `SWIG_TEST_DATABASE_URL` points at a scratch
//! database; otherwise the test is a silent skip so the default suite stays
//! hermetic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;

use swig::{
    Dispatcher, HandlerError, HandlerRegistry, InstanceId, JobContext, JobHandler, JobOptions,
    JobStore, JobSubscription, LeaderId, NewJob, PostgresJobStore, QueueConfig, QueueName,
    WorkerId,
};

#[derive(Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[async_trait]
impl JobHandler for SendEmail {
    const KIND: &'static str = "send_email";

    async fn execute(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

async fn scratch_store() -> Option<PostgresJobStore> {
    let url = match std::env::var("SWIG_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("SWIG_TEST_DATABASE_URL not set; skipping postgres integration test");
            return None;
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("failed to connect to SWIG_TEST_DATABASE_URL");
    Some(PostgresJobStore::new(pool))
}

async fn jobs_count(store: &PostgresJobStore) -> i64 {
    sqlx::query("SELECT COUNT(*) AS total FROM swig_jobs")
        .fetch_one(store.pool())
        .await
        .unwrap()
        .try_get("total")
        .unwrap()
}

#[tokio::test]
async fn postgres_store_end_to_end() {
    let Some(store) = scratch_store().await else {
        return;
    };

    // Bootstrap is idempotent.
    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();
    sqlx::query("DELETE FROM swig_jobs")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("CREATE TABLE IF NOT EXISTS swig_test_outbox (id SERIAL PRIMARY KEY, note TEXT)")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM swig_test_outbox")
        .execute(store.pool())
        .await
        .unwrap();

    let store = Arc::new(store);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        vec![QueueConfig::new(QueueName::standard(), 3)],
        HandlerRegistry::new(),
    );
    let handler = SendEmail {
        to: "a@x".to_string(),
        subject: "hi".to_string(),
    };

    // Rolled-back transaction leaves neither the business row nor the job.
    let mut tx = store.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO swig_test_outbox (note) VALUES ('with job')")
        .execute(&mut *tx)
        .await
        .unwrap();
    dispatcher
        .enqueue_in_tx(&mut tx, &handler, JobOptions::default())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(jobs_count(&store).await, 0);
    let outbox: i64 = sqlx::query("SELECT COUNT(*) AS total FROM swig_test_outbox")
        .fetch_one(store.pool())
        .await
        .unwrap()
        .try_get("total")
        .unwrap();
    assert_eq!(outbox, 0);

    // Committed transaction persists both.
    let mut tx = store.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO swig_test_outbox (note) VALUES ('with job')")
        .execute(&mut *tx)
        .await
        .unwrap();
    dispatcher
        .enqueue_in_tx(&mut tx, &handler, JobOptions::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(jobs_count(&store).await, 1);

    // Batch-in-tx commits all rows or none.
    let batch: Vec<NewJob> = (0..3)
        .map(|_| NewJob::from_handler(&handler, JobOptions::default()).unwrap())
        .collect();
    let mut tx = store.pool().begin().await.unwrap();
    dispatcher.enqueue_batch_in_tx(&mut tx, &batch).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(jobs_count(&store).await, 1);

    let mut tx = store.pool().begin().await.unwrap();
    dispatcher.enqueue_batch_in_tx(&mut tx, &batch).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(jobs_count(&store).await, 4);

    sqlx::query("DELETE FROM swig_jobs")
        .execute(store.pool())
        .await
        .unwrap();

    // The insert trigger pushes {id, queue, kind} to listeners.
    let mut sub = store.subscribe().await.unwrap();
    let id = dispatcher.enqueue(&handler).await.unwrap();
    let notice = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("no NOTIFY within 5s")
        .unwrap()
        .expect("trigger envelope should parse");
    assert_eq!(notice.id, Some(id));
    assert_eq!(notice.queue.as_deref(), Some("default"));
    assert_eq!(notice.kind.as_deref(), Some("send_email"));

    // Claims are exclusive per row.
    let instance = InstanceId::new();
    dispatcher.enqueue(&handler).await.unwrap();
    let first = store
        .claim_next(&QueueName::standard(), instance, WorkerId::new())
        .await
        .unwrap()
        .unwrap();
    let second = store
        .claim_next(&QueueName::standard(), instance, WorkerId::new())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.id, second.id);
    assert!(store
        .claim_next(&QueueName::standard(), instance, WorkerId::new())
        .await
        .unwrap()
        .is_none());
    assert!(store
        .claim_specific(first.id, InstanceId::new(), WorkerId::new())
        .await
        .unwrap()
        .is_none());

    // Shutdown cleanup releases this instance's rows.
    let released = store.release_instance_jobs(instance).await.unwrap();
    assert_eq!(released.len(), 2);

    // Advisory-lock leadership is exclusive within the lease.
    let leader = LeaderId::new();
    assert!(store
        .try_acquire_leadership(leader, Duration::from_secs(30))
        .await
        .unwrap());
    store.release_leadership(leader).await.unwrap();

    sqlx::query("DROP TABLE IF EXISTS swig_test_outbox")
        .execute(store.pool())
        .await
        .unwrap();
    store.teardown_schema().await.unwrap();
}

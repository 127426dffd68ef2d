//! Durable background-job queue with PostgreSQL as the state of record.
//!
//! Producers enqueue serializable handler structs, optionally inside their
//! own database transaction so job creation commits atomically with business
//! data. Dispatcher instances run per-queue worker pools that claim rows
//! with skip-locked semantics (at most one owner per job across all
//! instances), execute the registered handler, and record the outcome with
//! retry and exponential backoff. One instance at a time holds leadership
//! and periodically requeues retryable failures and reclaims rows stranded
//! by dead workers.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use swig::{
//!     Dispatcher, HandlerError, HandlerRegistry, InMemoryJobStore, JobContext, JobHandler,
//!     QueueConfig, QueueName,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//!     subject: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendEmail {
//!     const KIND: &'static str = "send_email";
//!
//!     async fn execute(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
//!         // deliver the email
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryJobStore::new());
//! let mut registry = HandlerRegistry::new();
//! registry.register::<SendEmail>();
//!
//! let dispatcher = Dispatcher::new(
//!     store,
//!     vec![QueueConfig::new(QueueName::standard(), 5)],
//!     registry,
//! );
//! dispatcher.start().await;
//!
//! dispatcher
//!     .enqueue(&SendEmail {
//!         to: "user@example.com".into(),
//!         subject: "Welcome!".into(),
//!     })
//!     .await?;
//!
//! dispatcher.stop(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
mod leader;
mod worker;

pub use dispatcher::{Dispatcher, QueueConfig};

pub use swig_core::{
    ClaimedJob, EnqueueError, HandlerError, HandlerRegistry, InstanceId, JobContext, JobHandler,
    JobId, JobOptions, JobStatus, LeaderId, NewJob, PrepareError, QueueName, ShutdownTimeout,
    StoreError, WorkerId, DEFAULT_MAX_ATTEMPTS,
};
pub use swig_store::{
    InMemoryJobStore, JobNotice, JobRecord, JobStore, JobSubscription, PostgresJobStore,
};

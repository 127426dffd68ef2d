//! Core types for the swig job queue: identifiers, the job model, the
//! handler registry, and the error taxonomy shared by the store and the
//! dispatcher.

pub mod error;
pub mod handler;
pub mod id;
pub mod job;

pub use error::{
    EnqueueError, InvalidQueueName, InvalidStatus, PrepareError, ShutdownTimeout, StoreError,
};
pub use handler::{HandlerError, HandlerRegistry, JobContext, JobHandler, PreparedJob};
pub use id::{InstanceId, JobId, LeaderId, WorkerId};
pub use job::{ClaimedJob, JobOptions, JobStatus, NewJob, QueueName, DEFAULT_MAX_ATTEMPTS};

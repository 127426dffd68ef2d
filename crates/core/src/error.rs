//! Error taxonomy for the queue.
//!
//! Enqueue errors propagate synchronously to the producer. Background errors
//! (claim, outcome recording, notifications) are logged by the worker loops
//! and never surface to callers. Handler failures are not errors of the
//! queue itself; they are recorded on the job row.

use std::time::Duration;

use thiserror::Error;

/// Failure while enqueueing a job. Surfaced to the producer.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The handler instance could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying store refused or failed the insert.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a job store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database refused or failed an operation.
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// The connection to the store was lost or could not be established.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The operation was cancelled (shutdown or caller cancellation).
    /// Distinguished so callers can stay silent instead of logging an error.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Building a runnable handler from a claimed row failed. Recorded on the
/// row as the failure reason; the worker loop continues.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("no handler registered for kind {0}")]
    UnknownKind(String),

    #[error("failed to deserialize job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Graceful shutdown did not drain the worker pools within its deadline.
/// Instance cleanup still ran best-effort before this was returned.
#[derive(Debug, Error)]
#[error("shutdown timed out after {timeout:?}; some workers may still be running")]
pub struct ShutdownTimeout {
    pub timeout: Duration,
}

/// Queue names must be non-empty.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue name must be non-empty")]
pub struct InvalidQueueName;

/// A status string from the database did not match any known status.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown job status: {0}")]
pub struct InvalidStatus(pub String);

//! Job handlers and the kind-keyed registry.
//!
//! A handler is a serializable struct: the enqueuer serializes an instance
//! into the row's payload, and at dispatch time the registry deserializes
//! the payload into a fresh instance and runs it. The registry is populated
//! once before the dispatcher starts and is read-only afterwards.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::PrepareError;
use crate::id::JobId;
use crate::job::QueueName;

/// Failure reason returned by a handler. Recorded on the row as
/// `last_error`; never propagated to the enqueuer.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of background work.
///
/// The struct's fields are the job's arguments; they round-trip through the
/// payload column as JSON.
#[async_trait]
pub trait JobHandler: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable discriminator routing payloads back to this handler.
    const KIND: &'static str;

    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Execution context handed to a handler.
///
/// Carries the claimed row's metadata and the shutdown signal. Handlers that
/// run long should poll [`JobContext::is_cancelled`] or await
/// [`JobContext::cancelled`] and wind down promptly.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    queue: QueueName,
    attempt: i32,
    max_attempts: i32,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        queue: QueueName,
        attempt: i32,
        max_attempts: i32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            queue,
            attempt,
            max_attempts,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// 1-based attempt number of the current execution.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Whether this is the final attempt before the row goes terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// A deserialized handler instance ready to run once.
#[async_trait]
pub trait PreparedJob: Send {
    async fn run(self: Box<Self>, ctx: JobContext) -> Result<(), HandlerError>;
}

impl std::fmt::Debug for dyn PreparedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreparedJob")
    }
}

struct Prepared<H>(H);

#[async_trait]
impl<H: JobHandler> PreparedJob for Prepared<H> {
    async fn run(self: Box<Self>, ctx: JobContext) -> Result<(), HandlerError> {
        self.0.execute(&ctx).await
    }
}

type HandlerFactory =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn PreparedJob>, serde_json::Error> + Send + Sync>;

/// Maps a job kind to a factory producing fresh handler instances.
pub struct HandlerRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a handler type under its `KIND`. Registering the same kind
    /// twice replaces the earlier factory (last writer wins).
    pub fn register<H: JobHandler>(&mut self) -> &mut Self {
        self.factories.insert(
            H::KIND,
            Box::new(|payload| {
                serde_json::from_value::<H>(payload)
                    .map(|handler| Box::new(Prepared(handler)) as Box<dyn PreparedJob>)
            }),
        );
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Deserialize a claimed row's payload into a fresh handler instance.
    pub fn prepare(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<Box<dyn PreparedJob>, PrepareError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| PrepareError::UnknownKind(kind.to_string()))?;
        Ok(factory(payload)?)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

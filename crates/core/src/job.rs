//! The job model: statuses, queue names, enqueue options, and the two row
//! shapes the dispatcher exchanges with a store (insert and claim).

use core::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{InvalidQueueName, InvalidStatus};
use crate::handler::JobHandler;
use crate::id::JobId;

/// Maximum execution attempts when the enqueuer does not override it.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Execution status of a stored job.
///
/// `Scheduled` exists in the database check constraint but rows are always
/// inserted as `Pending`; the claim predicate gates on `scheduled_for`
/// uniformly instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Scheduled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Scheduled => "scheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "scheduled" => Ok(JobStatus::Scheduled),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

/// A named partition of jobs.
///
/// The dispatch policy privileges the name `priority`: eligible rows in that
/// queue preempt every other queue at the claim boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    pub const STANDARD: &'static str = "default";
    pub const PRIORITY: &'static str = "priority";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidQueueName> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidQueueName);
        }
        Ok(Self(name))
    }

    /// The canonical default queue.
    pub fn standard() -> Self {
        Self(Self::STANDARD.to_string())
    }

    /// The globally-preempting priority queue.
    pub fn priority() -> Self {
        Self(Self::PRIORITY.to_string())
    }

    pub fn is_priority(&self) -> bool {
        self.0 == Self::PRIORITY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueName {
    fn default() -> Self {
        Self::standard()
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-job enqueue settings.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Target queue. Defaults to `default`.
    pub queue: QueueName,
    /// Higher wins within a queue. Defaults to 1.
    pub priority: i32,
    /// Earliest execution time. `None` means the server clock at insert.
    pub run_at: Option<DateTime<Utc>>,
    /// Override of the stored `max_attempts` column (default 3).
    pub max_attempts: Option<i32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: QueueName::standard(),
            priority: 1,
            run_at: None,
            max_attempts: None,
        }
    }
}

impl JobOptions {
    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A serialized job ready for insertion. Rows always insert as `pending`,
/// even with `run_at` in the future.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl NewJob {
    /// Serialize a handler instance into an insertable row.
    pub fn from_handler<H: JobHandler>(
        handler: &H,
        opts: JobOptions,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: H::KIND.to_string(),
            queue: opts.queue,
            payload: serde_json::to_value(handler)?,
            priority: opts.priority,
            run_at: opts.run_at,
            max_attempts: opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })
    }
}

/// What a successful claim returns: enough to route, deserialize, and log.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub kind: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// Attempt number of this execution (post-increment, 1-based).
    pub attempt: i32,
    pub max_attempts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, JobContext};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

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

    #[test]
    fn status_string_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Scheduled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("limbo".parse::<JobStatus>().is_err());
    }

    #[test]
    fn queue_names() {
        assert!(QueueName::priority().is_priority());
        assert!(!QueueName::standard().is_priority());
        assert_eq!(QueueName::standard().as_str(), "default");
        assert_eq!(QueueName::new(""), Err(InvalidQueueName));
        assert_eq!(QueueName::new("emails").unwrap().as_str(), "emails");
    }

    #[test]
    fn default_options() {
        let opts = JobOptions::default();
        assert_eq!(opts.queue, QueueName::standard());
        assert_eq!(opts.priority, 1);
        assert!(opts.run_at.is_none());
        assert!(opts.max_attempts.is_none());
    }

    #[test]
    fn new_job_serializes_handler_fields() {
        let handler = SendEmail {
            to: "a@x".to_string(),
            subject: "hi".to_string(),
        };
        let job = NewJob::from_handler(&handler, JobOptions::default()).unwrap();
        assert_eq!(job.kind, "send_email");
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.payload["to"], "a@x");
        assert_eq!(job.payload["subject"], "hi");
    }

    #[test]
    fn new_job_honors_option_overrides() {
        let handler = SendEmail {
            to: "a@x".to_string(),
            subject: "hi".to_string(),
        };
        let opts = JobOptions::default()
            .with_queue(QueueName::priority())
            .with_priority(9)
            .with_max_attempts(1);
        let job = NewJob::from_handler(&handler, opts).unwrap();
        assert!(job.queue.is_priority());
        assert_eq!(job.priority, 9);
        assert_eq!(job.max_attempts, 1);
    }
}

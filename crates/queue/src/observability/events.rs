//! Worker lifecycle events

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::duration_millis;
use crate::handler::JobError;
use crate::job::Job;
use crate::persistence::StoreError;

/// What happened in one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEventKind {
    /// A job was locked and its handler is about to run
    JobBegin,
    /// The handler succeeded and the job was deleted
    JobWorked,
    /// The handler failed and the job was rescheduled
    JobError,
    /// Nothing was eligible
    JobNotFound,
    /// The store failed while locking or finalizing
    PostgresError,
}

impl WorkerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobBegin => "job_begin",
            Self::JobWorked => "job_worked",
            Self::JobError => "job_error",
            Self::JobNotFound => "job_not_found",
            Self::PostgresError => "postgres_error",
        }
    }
}

impl fmt::Display for WorkerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerEvent {
    pub kind: WorkerEventKind,
    pub queue: String,
    pub job_id: Option<i64>,
    pub job_type: Option<String>,
    pub priority: Option<i16>,
    pub error_count: Option<i32>,
    /// Time between `run_at` and the job being locked
    #[serde(with = "duration_millis::option")]
    pub latency: Option<Duration>,
    /// Handler run time, for completed work
    #[serde(with = "duration_millis::option")]
    pub duration: Option<Duration>,
    pub error: Option<String>,
    /// Handler-supplied log fields
    pub context: Option<Value>,
}

impl WorkerEvent {
    fn bare(kind: WorkerEventKind, queue: &str) -> Self {
        Self {
            kind,
            queue: queue.to_string(),
            job_id: None,
            job_type: None,
            priority: None,
            error_count: None,
            latency: None,
            duration: None,
            error: None,
            context: None,
        }
    }

    fn for_job(kind: WorkerEventKind, job: &Job) -> Self {
        Self {
            job_id: Some(job.job_id),
            job_type: Some(job.job_type.clone()),
            priority: Some(job.priority),
            error_count: Some(job.error_count),
            ..Self::bare(kind, &job.queue)
        }
    }

    pub fn job_not_found(queue: &str) -> Self {
        Self::bare(WorkerEventKind::JobNotFound, queue)
    }

    pub fn postgres_error(queue: &str, error: &StoreError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::bare(WorkerEventKind::PostgresError, queue)
        }
    }

    pub fn job_begin(job: &Job, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::for_job(WorkerEventKind::JobBegin, job)
        }
    }

    pub fn job_worked(job: &Job, latency: Duration, duration: Duration) -> Self {
        Self {
            latency: Some(latency),
            duration: Some(duration),
            ..Self::for_job(WorkerEventKind::JobWorked, job)
        }
    }

    /// `error_count` is the count after this failure.
    pub fn job_error(
        job: &Job,
        latency: Duration,
        duration: Duration,
        error_count: i32,
        error: &JobError,
    ) -> Self {
        Self {
            error_count: Some(error_count),
            latency: Some(latency),
            duration: Some(duration),
            error: Some(error.to_string()),
            ..Self::for_job(WorkerEventKind::JobError, job)
        }
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }

    /// Emit the event through `tracing`
    pub fn log(&self) {
        let event = self.kind.as_str();
        let queue = self.queue.as_str();
        let job_type = self.job_type.as_deref();
        let latency_ms = self.latency.map(|d| d.as_millis() as u64);
        let duration_ms = self.duration.map(|d| d.as_millis() as u64);
        let context = self.context.as_ref().map(Value::to_string);
        let context = context.as_deref();
        let error = self.error.as_deref();

        match self.kind {
            WorkerEventKind::JobBegin => info!(
                event,
                queue,
                job_id = self.job_id,
                job_type,
                priority = self.priority,
                error_count = self.error_count,
                latency_ms,
                context,
                "Job acquired, beginning work"
            ),
            WorkerEventKind::JobWorked => info!(
                event,
                queue,
                job_id = self.job_id,
                job_type,
                priority = self.priority,
                error_count = self.error_count,
                latency_ms,
                duration_ms,
                context,
                "Successfully worked job"
            ),
            WorkerEventKind::JobError => warn!(
                event,
                queue,
                job_id = self.job_id,
                job_type,
                priority = self.priority,
                error_count = self.error_count,
                latency_ms,
                duration_ms,
                error,
                context,
                "Failed to work job"
            ),
            WorkerEventKind::JobNotFound => debug!(event, queue, "No job found"),
            WorkerEventKind::PostgresError => {
                error!(event, queue, error, "Store error while working jobs")
            }
        }
    }
}

/// Receives every event a worker emits
///
/// Called inline on the worker task, so implementations must not block.
pub trait WorkerObserver: Send + Sync + 'static {
    fn on_event(&self, event: &WorkerEvent);

    /// Time spent in one lock query, whether or not it found a job
    fn on_lock_attempt(&self, _queue: &str, _elapsed: Duration) {}

    /// A job that began work is no longer held by the worker.
    ///
    /// Fires after the terminal event, and also when none was emitted
    /// because finalization failed or the task was aborted.
    fn on_job_released(&self, _job_id: i64) {}
}

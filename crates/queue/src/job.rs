//! Job records as stored in `queue_jobs`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue used when none is given. Workers and producers must agree on it.
pub const DEFAULT_QUEUE: &str = "";

/// Priority used when none is given. Lower values are worked first.
pub const DEFAULT_PRIORITY: i16 = 100;

/// A persisted job row.
///
/// `(queue, priority, run_at, job_id)` identifies the row for finalization;
/// `(priority, run_at, job_id)` is the order in which eligible jobs are locked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_id: i64,
    pub job_type: String,
    pub retryable: bool,
    pub args: Vec<Value>,
    pub error_count: i32,
    pub last_error: Option<String>,
}

impl Job {
    /// How long the job has been eligible but not worked, as of `now`.
    pub fn latency(&self, now: DateTime<Utc>) -> Duration {
        (now - self.run_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Ordering key used by the locker.
    pub fn sort_key(&self) -> (i16, DateTime<Utc>, i64) {
        (self.priority, self.run_at, self.job_id)
    }
}

/// A job to be inserted.
///
/// # Example
///
/// ```
/// use everruns_queue::NewJob;
/// use serde_json::json;
///
/// let job = NewJob::new("SendInvoice")
///     .with_args(vec![json!(42)])
///     .with_queue("billing")
///     .with_priority(10);
/// assert_eq!(job.queue, "billing");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub args: Vec<Value>,
    pub queue: String,
    pub priority: i16,
    /// `None` means "now", as seen by the store.
    pub run_at: Option<DateTime<Utc>>,
    pub retryable: bool,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            args: Vec::new(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            run_at: None,
            retryable: true,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Per `(queue, job_type)` summary returned by `JobStore::job_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub queue: String,
    pub job_type: String,
    pub count: i64,
    /// Jobs whose advisory lock is currently held by some session.
    pub count_working: i64,
    pub count_errored: i64,
    pub highest_error_count: i32,
    pub oldest_run_at: Option<DateTime<Utc>>,
}

/// A locked job together with the session holding its lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub job: Job,
    pub backend_pid: i32,
    pub state: Option<String>,
    pub last_query: Option<String>,
    pub transaction_started_at: Option<DateTime<Utc>>,
    pub waiting: bool,
}

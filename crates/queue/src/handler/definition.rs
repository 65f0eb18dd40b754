//! JobHandler trait definition

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{JobContext, RegistryError};
use crate::job::Job;
use crate::reliability::RetryPolicy;

/// Why a job attempt failed
///
/// Every variant is recorded against the job row and leads to a retry with
/// backoff; none of them stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The handler returned an error
    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    /// No handler is registered for the job type
    #[error(transparent)]
    Unresolved(#[from] RegistryError),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The worker was interrupted after the pool's stop timeout
    #[error("Job exceeded timeout when requested to stop")]
    Timeout,
}

impl JobError {
    /// Build from a `catch_unwind` payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(message)
    }

    /// Text stored in the job's `last_error`: the message followed by the
    /// cause chain and, when captured, the backtrace.
    pub fn last_error(&self) -> String {
        match self {
            Self::Handler(err) => format!("{err:?}"),
            other => other.to_string(),
        }
    }

    /// Short kind label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler",
            Self::Unresolved(_) => "unresolved_handler",
            Self::Panicked(_) => "panicked",
            Self::Timeout => "timeout",
        }
    }
}

/// Code run for one job type
///
/// Handlers must tolerate being run more than once for the same job: a job
/// is deleted only after its handler returns, so a crash in between runs it
/// again.
///
/// # Example
///
/// ```ignore
/// use everruns_queue::prelude::*;
///
/// struct SendInvoice { mailer: Mailer }
///
/// #[async_trait]
/// impl JobHandler for SendInvoice {
///     async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
///         let (invoice_id,): (i64,) = ctx.parse_args()?;
///         self.mailer.send_invoice(invoice_id).await
///     }
///
///     fn retry_policy(&self) -> RetryPolicy {
///         RetryPolicy::fixed(Duration::from_secs(60))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Work the job. Returning `Err` reschedules it.
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;

    /// Backoff for this job type
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Delay after the `error_count`-th failure. Override for backoff that
    /// is not expressible as a [`RetryPolicy`].
    fn retry_interval(&self, error_count: i32) -> Duration {
        self.retry_policy().delay_for_error_count(error_count)
    }

    /// Called after a failure has been recorded. Errors are logged and
    /// otherwise ignored.
    async fn handle_failure(&self, _error: &JobError, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    /// Extra fields for this job's log events
    fn log_context(&self, _job: &Job) -> Option<serde_json::Value> {
        None
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`JobHandler`] with default retry behaviour.
///
/// # Example
///
/// ```
/// use everruns_queue::{handler_fn, HandlerRegistry};
///
/// let mut registry = HandlerRegistry::new();
/// registry
///     .register("Noop", handler_fn(|_ctx| async { Ok(()) }))
///     .unwrap();
/// assert!(registry.contains("Noop"));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}

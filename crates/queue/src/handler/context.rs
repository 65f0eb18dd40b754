//! Job execution context

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// Context provided to handlers during execution
///
/// The context provides:
/// - The locked job record and its arguments
/// - Cooperative stop detection
///
/// Stop requests never interrupt a handler by themselves. A handler that
/// ignores them keeps running until the pool's stop timeout elapses, at which
/// point its future is dropped and the job is failed.
///
/// # Example
///
/// ```ignore
/// async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
///     let (account_id,): (i64,) = ctx.parse_args()?;
///     for page in 0.. {
///         if ctx.is_cancelled() {
///             anyhow::bail!("stopped after {page} pages");
///         }
///         export_page(account_id, page).await?;
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    cancellation: CancellationToken,
}

impl JobContext {
    /// Create a new job context
    pub fn new(job: Job, cancellation: CancellationToken) -> Self {
        Self { job, cancellation }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> i64 {
        self.job.job_id
    }

    /// Number of previous failed attempts
    pub fn error_count(&self) -> i32 {
        self.job.error_count
    }

    pub fn args(&self) -> &[Value] {
        &self.job.args
    }

    /// Deserialize the argument array, typically into a tuple.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Array(self.job.args.clone()))
    }

    /// Check if a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Get a future that resolves when a stop is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => result,
    ///     _ = ctx.cancelled() => anyhow::bail!("stopped"),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

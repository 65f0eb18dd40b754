//! JobStore and JobConnection trait definitions

use std::time::Duration;

use async_trait::async_trait;

use crate::job::{Job, JobStats, NewJob, WorkerState};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (pool exhausted, connection dropped, I/O)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                Self::Unavailable(e.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => Self::Unavailable(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(e.to_string())
            }
            _ => Self::Database(e.to_string()),
        }
    }
}

/// One store session.
///
/// Advisory locks belong to the session that took them, so a worker holds a
/// single connection from lock to unlock. Dropping a connection that still
/// holds locks must release them.
#[async_trait]
pub trait JobConnection: Send {
    // =========================================================================
    // Locking
    // =========================================================================

    /// Lock the first eligible job of `queue`, scanning in
    /// `(priority, run_at, job_id)` order from the first row whose
    /// `job_id >= cursor`. Candidates are tried one at a time; at most one
    /// lock is taken.
    async fn lock_job(&mut self, queue: &str, cursor: i64) -> Result<Option<Job>, StoreError>;

    /// Whether the row still exists and is retryable, matched on its key columns.
    async fn job_exists(&mut self, job: &Job) -> Result<bool, StoreError>;

    /// Non-blocking session advisory lock on `job_id`.
    async fn try_lock(&mut self, job_id: i64) -> Result<bool, StoreError>;

    /// Release one hold of the advisory lock on `job_id`. Returns false if
    /// this session did not hold it.
    async fn unlock(&mut self, job_id: i64) -> Result<bool, StoreError>;

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Delete a worked job.
    async fn destroy_job(&mut self, job: &Job) -> Result<(), StoreError>;

    /// Record a failure and reschedule the job `delay` from now.
    async fn set_error(
        &mut self,
        job: &Job,
        error_count: i32,
        delay: Duration,
        message: &str,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Misc
    // =========================================================================

    /// Insert a job, returning the stored row.
    async fn enqueue(&mut self, job: NewJob) -> Result<Job, StoreError>;

    /// Whether the session is inside an open transaction.
    async fn in_transaction(&mut self) -> Result<bool, StoreError>;
}

/// Source of connections plus store-wide queries.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Check out a session for the duration of one unit of work.
    async fn checkout(&self) -> Result<Box<dyn JobConnection>, StoreError>;

    /// Insert a job on a short-lived session.
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut conn = self.checkout().await?;
        conn.enqueue(job).await
    }

    /// Fetch a job by id regardless of eligibility.
    async fn find_job(&self, job_id: i64) -> Result<Option<Job>, StoreError>;

    /// Counts per `(queue, job_type)`, largest first.
    async fn job_stats(&self) -> Result<Vec<JobStats>, StoreError>;

    /// Jobs currently locked, with the session holding each lock.
    async fn worker_states(&self) -> Result<Vec<WorkerState>, StoreError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_mean_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn test_query_errors_are_database_errors() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn test_io_errors_mean_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            StoreError::from(sqlx::Error::Io(io)),
            StoreError::Unavailable(_)
        ));
    }
}

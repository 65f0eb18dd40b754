//! Cursor-guided job locking
//!
//! Acquires the next eligible job of one queue. Each lock attempt starts
//! scanning from the last job this locker took, so busy workers do not keep
//! re-walking rows other workers hold near the head of the queue. The cursor
//! falls back to the start of the queue when it expires or a scan from it
//! finds nothing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::config::MAX_INTERVAL;
use crate::job::Job;
use crate::observability::WorkerObserver;
use crate::persistence::{JobConnection, StoreError};
use crate::reliability::RateLimiter;

/// Locks jobs of one queue for the duration of a callback
pub struct Locker {
    queue: String,
    cursor: i64,
    cursor_expiry: Duration,
    cursor_expires_at: Instant,
    limiter: Option<RateLimiter>,
    observers: Vec<Arc<dyn WorkerObserver>>,
}

impl Locker {
    /// Create a locker. The cursor starts expired, so the first attempt scans
    /// from the start of the queue.
    pub fn new(queue: impl Into<String>, cursor_expiry: Duration) -> Self {
        Self {
            queue: queue.into(),
            cursor: 0,
            cursor_expiry,
            cursor_expires_at: Instant::now(),
            limiter: None,
            observers: vec![],
        }
    }

    /// Throttle lock queries through `limiter`
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Report lock query timings to `observers`
    pub fn with_observers(mut self, observers: Vec<Arc<dyn WorkerObserver>>) -> Self {
        self.observers = observers;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// `job_id` the next lock attempt starts from
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Lock the next eligible job and run `f` with it.
    ///
    /// `f` receives `None` when nothing is eligible. The lock is released
    /// after `f` completes, including when it panics. If the returned future
    /// is dropped mid-callback the connection still holds the lock; dropping
    /// the connection releases it.
    ///
    /// Store errors while locking or unlocking are returned; errors inside
    /// `f` are `f`'s to report through `T`.
    pub async fn with_locked_job<T, F>(
        &mut self,
        conn: &mut dyn JobConnection,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn JobConnection, Option<Job>) -> BoxFuture<'c, T> + Send,
    {
        if Instant::now() >= self.cursor_expires_at {
            self.reset_cursor();
        }

        let mut job = self.lock_once(conn).await?;
        if job.is_none() && self.cursor != 0 {
            trace!(queue = %self.queue, cursor = self.cursor, "no job past cursor, rescanning");
            self.reset_cursor();
            job = self.lock_once(conn).await?;
        }

        let job = match job {
            Some(job) => self.verify(conn, job).await?,
            None => {
                self.reset_cursor();
                None
            }
        };

        let locked = job.as_ref().map(|job| job.job_id);
        let result = AssertUnwindSafe(f(&mut *conn, job)).catch_unwind().await;
        let unlocked = match locked {
            Some(job_id) => conn.unlock(job_id).await.map(|_| ()),
            None => Ok(()),
        };

        match (result, unlocked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(panic), unlocked) => {
                if let Err(e) = unlocked {
                    warn!(queue = %self.queue, "Failed to release lock after panic: {}", e);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Advisory locks ignore MVCC visibility: a row deleted by the worker that
    /// held it can still be locked by a scan that read it earlier.
    async fn verify(
        &mut self,
        conn: &mut dyn JobConnection,
        job: Job,
    ) -> Result<Option<Job>, StoreError> {
        match conn.job_exists(&job).await {
            Ok(true) => {
                self.cursor = job.job_id;
                Ok(Some(job))
            }
            Ok(false) => {
                debug!(queue = %self.queue, job_id = job.job_id, "locked job was already worked");
                conn.unlock(job.job_id).await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(unlock_err) = conn.unlock(job.job_id).await {
                    warn!(job_id = job.job_id, "Failed to release lock: {}", unlock_err);
                }
                Err(e)
            }
        }
    }

    async fn lock_once(
        &mut self,
        conn: &mut dyn JobConnection,
    ) -> Result<Option<Job>, StoreError> {
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.refill().await;
        }

        let started = Instant::now();
        let result = match self.limiter.as_mut() {
            Some(limiter) => limiter.observe(conn.lock_job(&self.queue, self.cursor)).await,
            None => conn.lock_job(&self.queue, self.cursor).await,
        };

        let elapsed = started.elapsed();
        for observer in &self.observers {
            observer.on_lock_attempt(&self.queue, elapsed);
        }
        result
    }

    fn reset_cursor(&mut self) {
        let now = Instant::now();
        self.cursor = 0;
        self.cursor_expires_at = now
            .checked_add(self.cursor_expiry)
            .unwrap_or(now + MAX_INTERVAL);
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("queue", &self.queue)
            .field("cursor", &self.cursor)
            .field("throttled", &self.limiter.is_some())
            .finish()
    }
}

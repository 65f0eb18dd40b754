//! # Job Queue
//!
//! A PostgreSQL job queue where workers claim jobs with session-scoped
//! advisory locks instead of row locks or status columns.
//!
//! ## Features
//!
//! - **Advisory locking**: a claimed job stays in the table untouched; a crashed worker's
//!   locks vanish with its session, so no reaper is needed
//! - **Cursor-guided scans**: each worker remembers the last job it locked and resumes
//!   from there, spreading concurrent workers across the queue
//! - **Polynomial backoff**: failed jobs are rescheduled `count^4 + 3` seconds out
//! - **Lock throttling**: an optional leaky bucket caps the time spent in lock queries
//! - **Bounded shutdown**: a pool asks workers to finish, then interrupts stragglers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (spawns workers, two-phase stop with forced escalation)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Worker  ─►  Locker  ─►  RateLimiter          │
//! │  (one job per iteration; events to tracing and observers)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 JobStore / JobConnection                     │
//! │  (PostgreSQL: queue_jobs + pg_try_advisory_lock)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_queue::prelude::*;
//!
//! let store = Arc::new(PostgresJobStore::connect(&database_url).await?);
//! store.migrate().await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("SendInvoice", handler_fn(|ctx| async move {
//!     let (invoice_id,): (i64,) = ctx.parse_args()?;
//!     send_invoice(invoice_id).await
//! }))?;
//!
//! store.enqueue(NewJob::new("SendInvoice").with_args(vec![json!(42)])).await?;
//!
//! let mut pool = WorkerPool::start(store, Arc::new(registry), WorkerPoolConfig::from_env()?)?;
//! // ...
//! pool.shutdown().await?;
//! ```

pub mod handler;
pub mod job;
pub mod observability;
pub mod persistence;
pub mod reliability;
pub mod worker;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::handler::{handler_fn, HandlerRegistry, JobContext, JobError, JobHandler};
    pub use crate::job::{Job, NewJob};
    pub use crate::observability::{QueueMetrics, WorkerEvent, WorkerObserver};
    pub use crate::persistence::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use handler::{handler_fn, HandlerRegistry, JobContext, JobError, JobHandler, RegistryError};
pub use job::{Job, JobStats, NewJob, WorkerState, DEFAULT_PRIORITY, DEFAULT_QUEUE};
pub use observability::{QueueMetrics, WorkerEvent, WorkerEventKind, WorkerObserver};
pub use persistence::{
    InMemoryJobStore, JobConnection, JobStore, PostgresJobStore, StoreError, MIGRATOR,
};
pub use reliability::{default_retry_interval, RateLimitError, RateLimiter, RetryPolicy};
pub use worker::{
    ConfigError, Locker, WeightedQueue, WorkOutcome, Worker, WorkerConfig, WorkerHandle,
    WorkerPool, WorkerPoolConfig, WorkerPoolError,
};

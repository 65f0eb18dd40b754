//! Workers and worker pools
//!
//! This module provides:
//! - [`Locker`] - Cursor-guided advisory lock acquisition
//! - [`Worker`] - Locks, runs and finalizes one job per iteration
//! - [`WorkerPool`] - N workers with bounded two-phase shutdown
//! - [`WeightedQueue`] - Weighted random queue selection for workers serving several queues
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  stop(timeout): ask ─► wait ─► interrupt ─► join ─► abort    │
//! │                                                              │
//! │  ┌─────────────┐  ┌─────────────┐        ┌─────────────┐    │
//! │  │  Worker 0   │  │  Worker 1   │  ...   │  Worker N   │    │
//! │  └──────┬──────┘  └─────────────┘        └─────────────┘    │
//! └─────────┼───────────────────────────────────────────────────┘
//!           │ work()
//!           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Locker (per queue): cursor, expiry, optional RateLimiter    │
//! │   lock_job(queue, cursor) ─► job_exists ─► callback ─► unlock│
//! └─────────────────────────────────────────────────────────────┘
//!           │
//!           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HandlerRegistry ─► JobHandler::run                          │
//! │   ok: destroy_job    err: set_error(count^4 + 3 s)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use everruns_queue::worker::{WorkerConfig, WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new(8, WorkerConfig::new("mail"))
//!     .with_stop_timeout(Duration::from_secs(10));
//!
//! let mut pool = WorkerPool::start(store, registry, config)?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod config;
mod locker;
mod pool;
mod runner;
mod weighted;

pub use config::{ConfigError, WorkerConfig, DEFAULT_WAKE_INTERVAL, MAX_INTERVAL};
pub use locker::Locker;
pub use pool::{
    StopReport, WorkerPool, WorkerPoolBuilder, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
pub use runner::{WorkOutcome, Worker, WorkerHandle};
pub use weighted::WeightedQueue;

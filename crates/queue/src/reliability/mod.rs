//! Reliability patterns for the job queue
//!
//! This module provides:
//! - [`RateLimiter`] - Leaky bucket bounding time spent polling for jobs
//! - [`RetryPolicy`] - Backoff applied to failed jobs

mod leaky_bucket;
mod retry;

pub use leaky_bucket::{RateLimitError, RateLimiter};
pub use retry::{default_retry_interval, RetryPolicy};

//! Leaky-bucket throttling of resource time
//!
//! A [`RateLimiter`] targets a budget of time to be spent inside observed
//! operations per rolling window. Workers use it to bound how much database
//! time their lock queries consume.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Error building a rate limiter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit window must be greater than zero")]
    ZeroWindow,

    #[error("rate limit budget must be greater than zero")]
    ZeroBudget,
}

/// Leaky bucket over wall-clock time.
///
/// `refill` must be awaited before each observed operation; it sleeps while
/// the bucket is overdrawn. `observe` charges the operation's duration, which
/// may drive the balance negative.
///
/// Not shareable: one limiter belongs to one locker.
///
/// # Example
///
/// ```
/// use everruns_queue::RateLimiter;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let mut limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(2)).unwrap();
/// limiter.refill().await;
/// let rows = limiter.observe(async { 42 }).await;
/// assert_eq!(rows, 42);
/// # });
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    budget: Duration,
    /// Seconds of budget left; negative when overdrawn.
    remaining: f64,
    last_refill: Option<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, budget: Duration) -> Result<Self, RateLimitError> {
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        if budget.is_zero() {
            return Err(RateLimitError::ZeroBudget);
        }
        Ok(Self {
            window,
            budget,
            remaining: 0.0,
            last_refill: None,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Seconds of budget left
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Budget seconds granted per elapsed second
    fn rate(&self) -> f64 {
        self.budget.as_secs_f64() / self.window.as_secs_f64()
    }

    /// Credit the time elapsed since the last refill, then wait until the
    /// balance would be non-negative.
    pub async fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = self
            .last_refill
            .map(|last| now.duration_since(last))
            .unwrap_or(Duration::ZERO);
        let grant = self.rate() * elapsed.as_secs_f64();

        self.last_refill = Some(now);
        self.remaining = (self.remaining + grant).min(self.budget.as_secs_f64());

        if self.remaining < 0.0 {
            let wait = Duration::from_secs_f64(-self.remaining / self.rate());
            trace!(remaining = self.remaining, ?wait, "rate limited");
            tokio::time::sleep(wait).await;
        }
    }

    /// Run `op`, charging its duration against the budget.
    ///
    /// The charge is applied even if `op` panics or the returned future is
    /// dropped before completion.
    pub async fn observe<F: Future>(&mut self, op: F) -> F::Output {
        let _charge = Charge {
            limiter: self,
            started: Instant::now(),
        };
        op.await
    }
}

struct Charge<'a> {
    limiter: &'a mut RateLimiter,
    started: Instant,
}

impl Drop for Charge<'_> {
    fn drop(&mut self) {
        self.limiter.remaining -= self.started.elapsed().as_secs_f64();
    }
}

//! Retry backoff for failed jobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_millis;

/// Default delay before a job that has failed `error_count` times runs again:
/// `error_count^4 + 3` seconds.
///
/// # Example
///
/// ```
/// use everruns_queue::default_retry_interval;
/// use std::time::Duration;
///
/// assert_eq!(default_retry_interval(1), Duration::from_secs(4));
/// assert_eq!(default_retry_interval(6), Duration::from_secs(1299));
/// ```
pub fn default_retry_interval(error_count: i32) -> Duration {
    let count = u64::from(error_count.max(0).unsigned_abs());
    Duration::from_secs(count.saturating_pow(4).saturating_add(3))
}

/// How long a failed job waits before becoming eligible again
///
/// Handlers pick a policy per job type; the delay is applied by the worker
/// as `run_at = now + delay`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// `error_count^4 + 3` seconds
    #[default]
    Polynomial,

    /// The same delay after every failure
    Fixed {
        #[serde(with = "duration_millis")]
        interval: Duration,
    },
}

impl RetryPolicy {
    /// Create a policy with a fixed interval
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed { interval }
    }

    /// Delay after the `error_count`-th failure
    pub fn delay_for_error_count(&self, error_count: i32) -> Duration {
        match self {
            Self::Polynomial => default_retry_interval(error_count),
            Self::Fixed { interval } => *interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_error_count(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_error_count(2), Duration::from_secs(19));
        assert_eq!(policy.delay_for_error_count(3), Duration::from_secs(84));
        assert_eq!(policy.delay_for_error_count(6), Duration::from_secs(1299));
    }

    #[test]
    fn test_backoff_of_zero_and_negative_counts() {
        assert_eq!(default_retry_interval(0), Duration::from_secs(3));
        assert_eq!(default_retry_interval(-5), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(
            default_retry_interval(i32::MAX),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        assert_eq!(policy.delay_for_error_count(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_error_count(10), Duration::from_secs(30));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1500));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json, serde_json::json!({"type": "fixed", "interval": 1500}));

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}

//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::weighted::WeightedQueue;
use crate::duration_millis;
use crate::job::DEFAULT_QUEUE;

/// Default pause after an iteration that found nothing or hit a store error
pub const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for every configured interval
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("invalid value for {name}: {reason}")]
    Env { name: String, reason: String },
}

/// Per-worker configuration
///
/// # Example
///
/// ```
/// use everruns_queue::{WeightedQueue, WorkerConfig};
/// use std::time::Duration;
///
/// let config = WorkerConfig::new("mail")
///     .with_wake_interval(Duration::from_secs(1))
///     .with_lock_budget(Duration::from_secs(60), Duration::from_secs(6));
/// assert!(config.validate().is_ok());
///
/// let weighted = WorkerConfig::default()
///     .with_weighted_queues(vec![WeightedQueue::new(90, ""), WeightedQueue::new(10, "reports")]);
/// assert_eq!(weighted.queues().len(), 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Queue to work when no weighted queues are set
    pub queue: String,

    /// Queues to pick from at random, proportionally to weight
    #[serde(default)]
    pub weighted_queues: Vec<WeightedQueue>,

    /// Pause after finding no job or hitting a store error
    #[serde(with = "duration_millis")]
    pub wake_interval: Duration,

    /// How long the lock cursor may be reused before scanning from the start
    #[serde(with = "duration_millis")]
    pub cursor_expiry: Duration,

    /// Rolling window for lock query throttling
    #[serde(with = "duration_millis::option", default)]
    pub lock_window: Option<Duration>,

    /// Lock query time allowed per window
    #[serde(with = "duration_millis::option", default)]
    pub lock_budget: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            weighted_queues: vec![],
            wake_interval: DEFAULT_WAKE_INTERVAL,
            cursor_expiry: DEFAULT_WAKE_INTERVAL,
            lock_window: None,
            lock_budget: None,
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for a single queue
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Read configuration from `QUEUE_*` environment variables
    ///
    /// - `QUEUE_NAME`: queue to work (default: the empty default queue)
    /// - `QUEUE_WEIGHTED_QUEUES`: comma-separated `weight:queue` pairs
    /// - `QUEUE_WAKE_INTERVAL_MS`, `QUEUE_CURSOR_EXPIRY_MS`
    /// - `QUEUE_LOCK_WINDOW_MS`, `QUEUE_LOCK_BUDGET_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(queue) = std::env::var("QUEUE_NAME") {
            config.queue = queue;
        }
        if let Ok(raw) = std::env::var("QUEUE_WEIGHTED_QUEUES") {
            config.weighted_queues = raw
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.parse())
                .collect::<Result<_, _>>()
                .map_err(|reason| ConfigError::Env {
                    name: "QUEUE_WEIGHTED_QUEUES".to_string(),
                    reason,
                })?;
        }
        if let Some(interval) = env_millis("QUEUE_WAKE_INTERVAL_MS")? {
            config.wake_interval = interval;
        }
        // Cursor expiry follows the wake interval unless set explicitly.
        config.cursor_expiry =
            env_millis("QUEUE_CURSOR_EXPIRY_MS")?.unwrap_or(config.wake_interval);
        config.lock_window = env_millis("QUEUE_LOCK_WINDOW_MS")?;
        config.lock_budget = env_millis("QUEUE_LOCK_BUDGET_MS")?;

        config.validate()?;
        Ok(config)
    }

    /// Set the queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set weighted queues, replacing the single queue
    pub fn with_weighted_queues(mut self, queues: Vec<WeightedQueue>) -> Self {
        self.weighted_queues = queues;
        self
    }

    /// Set wake interval
    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    /// Set cursor expiry
    pub fn with_cursor_expiry(mut self, expiry: Duration) -> Self {
        self.cursor_expiry = expiry;
        self
    }

    /// Throttle lock queries to `budget` of query time per `window`
    pub fn with_lock_budget(mut self, window: Duration, budget: Duration) -> Self {
        self.lock_window = Some(window);
        self.lock_budget = Some(budget);
        self
    }

    /// The queues this worker serves, with weights
    pub fn queues(&self) -> Vec<WeightedQueue> {
        if self.weighted_queues.is_empty() {
            vec![WeightedQueue::new(1, self.queue.clone())]
        } else {
            self.weighted_queues.clone()
        }
    }

    /// Label used for the worker's logs
    pub fn queue_label(&self) -> String {
        if self.weighted_queues.is_empty() {
            self.queue.clone()
        } else {
            "weighted_random".to_string()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.weighted_queues.is_empty()
            && self.weighted_queues.iter().all(|q| q.weight == 0)
        {
            return Err(ConfigError::Invalid(
                "weighted queues need at least one positive weight".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for queue in &self.weighted_queues {
            if !seen.insert(queue.queue.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "queue {:?} listed more than once",
                    queue.queue
                )));
            }
        }

        let intervals = [
            ("wake_interval", Some(self.wake_interval)),
            ("cursor_expiry", Some(self.cursor_expiry)),
            ("lock_window", self.lock_window),
            ("lock_budget", self.lock_budget),
        ];
        for (name, interval) in intervals {
            if interval.is_some_and(|interval| interval > MAX_INTERVAL) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not exceed {}s",
                    MAX_INTERVAL.as_secs()
                )));
            }
        }

        match (self.lock_window, self.lock_budget) {
            (None, None) => {}
            (Some(window), Some(budget)) => {
                if window.is_zero() || budget.is_zero() {
                    return Err(ConfigError::Invalid(
                        "lock window and budget must be greater than zero".to_string(),
                    ));
                }
            }
            _ => {
                return Err(ConfigError::Invalid(
                    "lock window and budget must be set together".to_string(),
                ))
            }
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::Env {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue, "");
        assert_eq!(config.wake_interval, Duration::from_secs(5));
        assert_eq!(config.cursor_expiry, Duration::from_secs(5));
        assert!(config.lock_window.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new("mail")
            .with_wake_interval(Duration::from_millis(100))
            .with_cursor_expiry(Duration::from_secs(1))
            .with_lock_budget(Duration::from_secs(10), Duration::from_secs(2));

        assert_eq!(config.queue, "mail");
        assert_eq!(config.wake_interval, Duration::from_millis(100));
        assert_eq!(config.cursor_expiry, Duration::from_secs(1));
        assert_eq!(config.lock_window, Some(Duration::from_secs(10)));
        assert_eq!(config.lock_budget, Some(Duration::from_secs(2)));
        assert_eq!(config.queues(), vec![WeightedQueue::new(1, "mail")]);
        assert_eq!(config.queue_label(), "mail");
    }

    #[test]
    fn test_weighted_queues_override_queue() {
        let config = WorkerConfig::new("ignored")
            .with_weighted_queues(vec![WeightedQueue::new(3, "a"), WeightedQueue::new(1, "b")]);

        assert_eq!(config.queues().len(), 2);
        assert_eq!(config.queue_label(), "weighted_random");
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let half_budget = WorkerConfig {
            lock_window: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(half_budget.validate().is_err());

        let zero_budget =
            WorkerConfig::default().with_lock_budget(Duration::from_secs(1), Duration::ZERO);
        assert!(zero_budget.validate().is_err());

        let zero_weights =
            WorkerConfig::default().with_weighted_queues(vec![WeightedQueue::new(0, "a")]);
        assert!(zero_weights.validate().is_err());

        let duplicate = WorkerConfig::default()
            .with_weighted_queues(vec![WeightedQueue::new(1, "a"), WeightedQueue::new(1, "a")]);
        assert!(duplicate.validate().is_err());

        let huge_expiry =
            WorkerConfig::default().with_cursor_expiry(Duration::from_millis(u64::MAX));
        assert!(huge_expiry.validate().is_err());

        let huge_window = WorkerConfig::default()
            .with_lock_budget(Duration::from_millis(u64::MAX), Duration::from_secs(1));
        assert!(huge_window.validate().is_err());

        let longest = WorkerConfig::default()
            .with_wake_interval(MAX_INTERVAL)
            .with_cursor_expiry(MAX_INTERVAL);
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = WorkerConfig::new("mail")
            .with_lock_budget(Duration::from_secs(10), Duration::from_secs(2));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["wake_interval"], 5000);
        assert_eq!(json["lock_window"], 10000);

        let parsed: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);

        let minimal: WorkerConfig = serde_json::from_str(
            r#"{"queue": "", "wake_interval": 100, "cursor_expiry": 100}"#,
        )
        .unwrap();
        assert!(minimal.lock_budget.is_none());
        assert!(minimal.weighted_queues.is_empty());
    }
}

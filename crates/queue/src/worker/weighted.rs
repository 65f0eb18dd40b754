//! Weighted random queue selection
//!
//! A worker serving several queues picks one per iteration with probability
//! proportional to its weight. Small queues can then share workers (and
//! database connections) with busy ones without being starved.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A queue and its selection weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedQueue {
    pub weight: u32,
    pub queue: String,
}

impl WeightedQueue {
    pub fn new(weight: u32, queue: impl Into<String>) -> Self {
        Self {
            weight,
            queue: queue.into(),
        }
    }
}

impl fmt::Display for WeightedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weight, self.queue)
    }
}

/// Parses `weight:queue`. The queue part may be empty (the default queue).
impl FromStr for WeightedQueue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (weight, queue) = s
            .split_once(':')
            .ok_or_else(|| format!("expected weight:queue, got {s:?}"))?;
        let weight = weight
            .trim()
            .parse()
            .map_err(|e| format!("invalid weight in {s:?}: {e}"))?;
        Ok(Self::new(weight, queue.trim()))
    }
}

/// Picks an index into a list of weighted queues
#[derive(Debug, Clone)]
pub(crate) struct QueueSelector {
    cumulative: Vec<u64>,
}

impl QueueSelector {
    /// `queues` must be non-empty with a positive total weight.
    pub(crate) fn new(queues: &[WeightedQueue]) -> Self {
        let mut total = 0u64;
        let cumulative = queues
            .iter()
            .map(|q| {
                total += u64::from(q.weight);
                total
            })
            .collect();
        Self { cumulative }
    }

    pub(crate) fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let total = self.cumulative.last().copied().unwrap_or(0);
        if self.cumulative.len() <= 1 || total == 0 {
            return 0;
        }
        let roll = rng.gen_range(0..total);
        self.cumulative.partition_point(|&upper| upper <= roll)
    }
}

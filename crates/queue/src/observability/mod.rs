//! Worker lifecycle events and metrics
//!
//! Workers always log their events through `tracing`. Any number of
//! [`WorkerObserver`]s can additionally receive them, e.g. [`QueueMetrics`].

mod events;
mod metrics;

pub use events::{WorkerEvent, WorkerEventKind, WorkerObserver};
pub use metrics::{AcquireCounters, JobCounters, JobLabels, MetricsSnapshot, QueueMetrics};

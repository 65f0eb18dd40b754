//! In-process queue metrics
//!
//! [`QueueMetrics`] aggregates worker events into counters that an exporter
//! can scrape through [`QueueMetrics::snapshot`]. Worked seconds of in-flight
//! jobs are accrued by a tracker task, so a job running for an hour shows up
//! as steady progress rather than one jump when it finishes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::{WorkerEvent, WorkerEventKind, WorkerObserver};

/// Labels for per-job-type counters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobLabels {
    pub queue: String,
    pub job_type: String,
    pub priority: i16,
}

impl JobLabels {
    fn from_event(event: &WorkerEvent) -> Option<Self> {
        Some(Self {
            queue: event.queue.clone(),
            job_type: event.job_type.clone()?,
            priority: event.priority?,
        })
    }
}

/// Counters for one [`JobLabels`] combination
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobCounters {
    pub jobs_worked: u64,
    pub jobs_errored: u64,
    pub worked_seconds: f64,
    pub latency_seconds: f64,
}

/// Counters for lock attempts on one queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquireCounters {
    pub attempts: u64,
    pub seconds: f64,
    pub not_found: u64,
    pub store_errors: u64,
}

/// Point-in-time copy of all counters, sorted by labels
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs: Vec<(JobLabels, JobCounters)>,
    pub acquire: Vec<(String, AcquireCounters)>,
    pub running_jobs: usize,
}

const MIN_TRACK_INTERVAL: Duration = Duration::from_millis(1);

struct RunningJob {
    labels: JobLabels,
    started: Instant,
    accounted: Duration,
}

/// Metrics observer
///
/// # Example
///
/// ```ignore
/// let metrics = Arc::new(QueueMetrics::new());
/// let tracker = metrics.clone().spawn_tracker(Duration::from_millis(500), shutdown.clone());
/// let pool = WorkerPool::builder(store, registry)
///     .with_observer(metrics.clone())
///     .start(config)?;
/// ```
#[derive(Default)]
pub struct QueueMetrics {
    jobs: DashMap<JobLabels, JobCounters>,
    acquire: DashMap<String, AcquireCounters>,
    running: DashMap<i64, RunningJob>,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut acquire: Vec<_> = self
            .acquire
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        acquire.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            jobs,
            acquire,
            running_jobs: self.running.len(),
        }
    }

    /// Credit in-flight jobs with the time they have run since the last tick.
    pub fn track_running(&self) {
        let now = Instant::now();
        for mut entry in self.running.iter_mut() {
            let running = entry.value_mut();
            let elapsed = now.duration_since(running.started);
            let delta = elapsed.saturating_sub(running.accounted);
            running.accounted = elapsed;
            self.jobs
                .entry(running.labels.clone())
                .or_default()
                .worked_seconds += delta.as_secs_f64();
        }
    }

    /// Run [`track_running`](Self::track_running) every `interval` until `shutdown`.
    ///
    /// Intervals below one millisecond are raised to one millisecond.
    pub fn spawn_tracker(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = interval.max(MIN_TRACK_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.track_running(),
                    _ = shutdown.cancelled() => {
                        debug!("Metrics tracker: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn job_begin(&self, job_id: i64, labels: JobLabels) {
        self.running.insert(
            job_id,
            RunningJob {
                labels,
                started: Instant::now(),
                accounted: Duration::ZERO,
            },
        );
    }

    fn job_finished(&self, event: &WorkerEvent, labels: JobLabels) {
        let accounted = event
            .job_id
            .and_then(|id| self.running.remove(&id))
            .map(|(_, running)| running.accounted)
            .unwrap_or(Duration::ZERO);
        let remaining = event.duration.unwrap_or(Duration::ZERO).saturating_sub(accounted);

        let mut counters = self.jobs.entry(labels).or_default();
        match event.kind {
            WorkerEventKind::JobWorked => counters.jobs_worked += 1,
            _ => counters.jobs_errored += 1,
        }
        counters.worked_seconds += remaining.as_secs_f64();
        counters.latency_seconds += event.latency.unwrap_or(Duration::ZERO).as_secs_f64();
    }
}

impl WorkerObserver for QueueMetrics {
    fn on_event(&self, event: &WorkerEvent) {
        match event.kind {
            WorkerEventKind::JobBegin => {
                if let (Some(job_id), Some(labels)) = (event.job_id, JobLabels::from_event(event)) {
                    self.job_begin(job_id, labels);
                }
            }
            WorkerEventKind::JobWorked | WorkerEventKind::JobError => {
                if let Some(labels) = JobLabels::from_event(event) {
                    self.job_finished(event, labels);
                }
            }
            WorkerEventKind::JobNotFound => {
                self.acquire.entry(event.queue.clone()).or_default().not_found += 1;
            }
            WorkerEventKind::PostgresError => {
                self.acquire.entry(event.queue.clone()).or_default().store_errors += 1;
            }
        }
    }

    fn on_lock_attempt(&self, queue: &str, elapsed: Duration) {
        let mut counters = self.acquire.entry(queue.to_string()).or_default();
        counters.attempts += 1;
        counters.seconds += elapsed.as_secs_f64();
    }

    fn on_job_released(&self, job_id: i64) {
        // Only jobs that ended without a terminal event are still here.
        if let Some((_, running)) = self.running.remove(&job_id) {
            let delta = running.started.elapsed().saturating_sub(running.accounted);
            self.jobs.entry(running.labels).or_default().worked_seconds += delta.as_secs_f64();
        }
    }
}

//! Worker pool
//!
//! Runs a fixed number of [`Worker`]s as tokio tasks and stops them in two
//! phases: first every worker is asked to finish its current job, then any
//! worker still busy after the stop timeout has its handler interrupted.
//! Interrupted jobs fail with [`JobError::Timeout`](crate::handler::JobError)
//! and are rescheduled like any other failure.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::config::{ConfigError, WorkerConfig};
use super::runner::{Worker, WorkerHandle};
use crate::duration_millis;
use crate::handler::HandlerRegistry;
use crate::observability::WorkerObserver;
use crate::persistence::JobStore;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Pool ID, used as the prefix of worker IDs (generated if not provided)
    pub pool_id: String,

    /// Number of workers
    pub worker_count: usize,

    /// Configuration shared by every worker
    pub worker: WorkerConfig,

    /// How long [`WorkerPool::shutdown`] waits before interrupting workers
    #[serde(with = "duration_millis")]
    pub stop_timeout: Duration,

    /// How long interrupted workers get to record the failure before
    /// their tasks are aborted
    #[serde(with = "duration_millis")]
    pub join_margin: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_id: format!("pool-{}", Uuid::now_v7()),
            worker_count: 4,
            worker: WorkerConfig::default(),
            stop_timeout: Duration::from_secs(5),
            join_margin: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration running `worker_count` workers
    pub fn new(worker_count: usize, worker: WorkerConfig) -> Self {
        Self {
            worker_count,
            worker,
            ..Default::default()
        }
    }

    /// Read configuration from `QUEUE_*` environment variables
    ///
    /// Adds `QUEUE_WORKER_COUNT`, `QUEUE_STOP_TIMEOUT_MS` and
    /// `QUEUE_JOIN_MARGIN_MS` to the variables read by
    /// [`WorkerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            worker: WorkerConfig::from_env()?,
            ..Default::default()
        };

        if let Ok(raw) = std::env::var("QUEUE_WORKER_COUNT") {
            config.worker_count = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Env {
                    name: "QUEUE_WORKER_COUNT".to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        for (name, target) in [
            ("QUEUE_STOP_TIMEOUT_MS", &mut config.stop_timeout),
            ("QUEUE_JOIN_MARGIN_MS", &mut config.join_margin),
        ] {
            if let Ok(raw) = std::env::var(name) {
                let ms: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::Env {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                *target = Duration::from_millis(ms);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the pool ID
    pub fn with_pool_id(mut self, id: impl Into<String>) -> Self {
        self.pool_id = id.into();
        self
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the stop timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the join margin
    pub fn with_join_margin(mut self, margin: Duration) -> Self {
        self.join_margin = margin;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        self.worker.validate()
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Workers are running
    Running,
    /// All workers have exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker pool already stopped
    #[error("worker pool is not running")]
    NotRunning,
}

/// How the workers exited during [`WorkerPool::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Finished their current job within the stop timeout
    pub finished: usize,
    /// Had their job interrupted, then exited within the join margin
    pub interrupted: usize,
    /// Still running after the join margin; their tasks were aborted
    pub aborted: usize,
    /// Exited by panicking
    pub panicked: usize,
}

enum WorkerExit {
    Finished,
    Interrupted,
    Aborted,
    Panicked,
}

struct RunningWorker {
    handle: WorkerHandle,
    task: JoinHandle<()>,
}

impl RunningWorker {
    async fn finish(mut self, timeout: Duration, join_margin: Duration) -> WorkerExit {
        let interrupted = match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(result) => return self.exit(result, WorkerExit::Finished),
            Err(_) => {
                info!(worker_id = %self.handle.id(), "Worker still running - forcing it to stop");
                self.handle.interrupt();
                WorkerExit::Interrupted
            }
        };

        match tokio::time::timeout(join_margin, &mut self.task).await {
            Ok(result) => self.exit(result, interrupted),
            Err(_) => {
                warn!(worker_id = %self.handle.id(), "Worker ignored interrupt, aborting task");
                self.task.abort();
                WorkerExit::Aborted
            }
        }
    }

    fn exit(&self, result: Result<(), tokio::task::JoinError>, ok: WorkerExit) -> WorkerExit {
        match result {
            Ok(()) => ok,
            Err(e) => {
                error!(worker_id = %self.handle.id(), "Worker task failed: {}", e);
                WorkerExit::Panicked
            }
        }
    }
}

/// Builder for a [`WorkerPool`] with observers attached to every worker
pub struct WorkerPoolBuilder {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    observers: Vec<Arc<dyn WorkerObserver>>,
}

impl WorkerPoolBuilder {
    /// Add an observer
    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Spawn the workers. Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(pool_id = %config.pool_id))]
    pub fn start(self, config: WorkerPoolConfig) -> Result<WorkerPool, WorkerPoolError> {
        config.validate()?;

        info!(
            worker_count = config.worker_count,
            queue = %config.worker.queue_label(),
            "Starting workers"
        );

        let workers = (0..config.worker_count)
            .map(|index| {
                let worker = Worker::new(
                    self.store.clone(),
                    self.registry.clone(),
                    config.worker.clone(),
                )?
                .with_id(format!("{}-{}", config.pool_id, index))
                .with_observers(self.observers.clone());

                let handle = worker.handle();
                let span = tracing::info_span!("worker", worker_id = %handle.id());
                let task = tokio::spawn(worker.work_loop().instrument(span));
                Ok(RunningWorker { handle, task })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(WorkerPool {
            config,
            workers,
            status: WorkerPoolStatus::Running,
        })
    }
}

/// A set of workers sharing one store and handler registry
///
/// # Example
///
/// ```ignore
/// use everruns_queue::worker::{WorkerPool, WorkerPoolConfig};
///
/// let mut pool = WorkerPool::start(store, registry, WorkerPoolConfig::default())?;
///
/// // ... later
/// let report = pool.stop(Duration::from_secs(5)).await?;
/// assert_eq!(report.aborted, 0);
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Vec<RunningWorker>,
    status: WorkerPoolStatus,
}

impl WorkerPool {
    pub fn builder(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            store,
            registry,
            observers: vec![],
        }
    }

    /// Spawn the configured number of workers
    pub fn start(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerPoolConfig,
    ) -> Result<Self, WorkerPoolError> {
        Self::builder(store, registry).start(config)
    }

    /// Stop all workers.
    ///
    /// Workers get `timeout` to finish their current job. Those still busy
    /// are interrupted and given the join margin to record the failure,
    /// after which their tasks are aborted. Returns within roughly
    /// `timeout` plus the join margin.
    #[instrument(skip(self), fields(pool_id = %self.config.pool_id))]
    pub async fn stop(&mut self, timeout: Duration) -> Result<StopReport, WorkerPoolError> {
        if self.status == WorkerPoolStatus::Stopped {
            return Err(WorkerPoolError::NotRunning);
        }

        info!(worker_count = self.workers.len(), "Asking workers to finish");
        for worker in &self.workers {
            worker.handle.stop();
        }

        let join_margin = self.config.join_margin;
        let exits = join_all(
            std::mem::take(&mut self.workers)
                .into_iter()
                .map(|worker| worker.finish(timeout, join_margin)),
        )
        .await;

        let mut report = StopReport::default();
        for exit in exits {
            match exit {
                WorkerExit::Finished => report.finished += 1,
                WorkerExit::Interrupted => report.interrupted += 1,
                WorkerExit::Aborted => report.aborted += 1,
                WorkerExit::Panicked => report.panicked += 1,
            }
        }

        self.status = WorkerPoolStatus::Stopped;
        info!(
            finished = report.finished,
            interrupted = report.interrupted,
            aborted = report.aborted,
            "All workers have finished"
        );
        Ok(report)
    }

    /// Stop with the configured stop timeout
    pub async fn shutdown(&mut self) -> Result<StopReport, WorkerPoolError> {
        let timeout = self.config.stop_timeout;
        self.stop(timeout).await
    }

    pub fn status(&self) -> WorkerPoolStatus {
        self.status
    }

    pub fn pool_id(&self) -> &str {
        &self.config.pool_id
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers whose task has not exited
    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.task.is_finished()).count()
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.iter().map(|w| w.handle.clone()).collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!(
                pool_id = %self.config.pool_id,
                "Worker pool dropped while running, stopping workers"
            );
            for worker in &self.workers {
                worker.handle.stop();
            }
        }
    }
}

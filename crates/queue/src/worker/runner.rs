//! A single worker: lock, run, finalize, repeat

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{ConfigError, WorkerConfig};
use super::locker::Locker;
use super::weighted::QueueSelector;
use crate::handler::{HandlerRegistry, JobContext, JobError, JobHandler};
use crate::job::Job;
use crate::observability::{WorkerEvent, WorkerObserver};
use crate::persistence::{JobConnection, JobStore, StoreError};
use crate::reliability::{default_retry_interval, RateLimiter};

/// Result of one [`Worker::work`] iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A job was run, whether it succeeded or was rescheduled
    JobWorked,
    /// Nothing was eligible
    JobNotFound,
    /// The store failed; the worker should pause before retrying
    PostgresError,
}

/// Stops a worker from another task
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: String,
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the worker to exit after its current job. The running handler
    /// sees the request through its context but is not interrupted.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Abandon the running handler. The job is failed with
    /// [`JobError::Timeout`] and rescheduled. Implies [`stop`](Self::stop).
    pub fn interrupt(&self) {
        self.stop.cancel();
        self.interrupt.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Tells observers a begun job has left the worker, on every exit path
struct InFlight<'a> {
    observers: &'a [Arc<dyn WorkerObserver>],
    job_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for observer in self.observers {
            observer.on_job_released(self.job_id);
        }
    }
}

/// State the per-job callback needs; shared so the callback owns what it uses.
#[derive(Clone)]
struct Execution {
    registry: Arc<HandlerRegistry>,
    observers: Vec<Arc<dyn WorkerObserver>>,
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl Execution {
    fn emit(&self, event: WorkerEvent) {
        event.log();
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    fn store_failed(&self, queue: &str, error: &StoreError) -> WorkOutcome {
        self.emit(WorkerEvent::postgres_error(queue, error));
        WorkOutcome::PostgresError
    }

    async fn perform(
        &self,
        queue: &str,
        conn: &mut dyn JobConnection,
        job: Option<Job>,
    ) -> Result<WorkOutcome, StoreError> {
        let Some(job) = job else {
            self.emit(WorkerEvent::job_not_found(queue));
            return Ok(WorkOutcome::JobNotFound);
        };

        let latency = job.latency(Utc::now());
        let handler = self.registry.resolve(&job.job_type);
        let context = handler.as_ref().ok().and_then(|h| h.log_context(&job));
        self.emit(WorkerEvent::job_begin(&job, latency).with_context(context.clone()));
        let _in_flight = InFlight {
            observers: &self.observers,
            job_id: job.job_id,
        };

        let started = Instant::now();
        let result = match &handler {
            Ok(handler) => self.run_handler(handler, &job).await,
            Err(e) => Err(JobError::Unresolved(e.clone())),
        };
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                conn.destroy_job(&job).await?;
                self.emit(WorkerEvent::job_worked(&job, latency, duration).with_context(context));
            }
            Err(error) => {
                let error_count = job.error_count.saturating_add(1);
                let delay = match &handler {
                    Ok(handler) => handler.retry_interval(error_count),
                    Err(_) => default_retry_interval(error_count),
                };

                self.emit(
                    WorkerEvent::job_error(&job, latency, duration, error_count, &error)
                        .with_context(context),
                );
                conn.set_error(&job, error_count, delay, &error.last_error())
                    .await?;

                if let Ok(handler) = &handler {
                    self.run_failure_hook(handler, &error, &job).await;
                }
            }
        }

        Ok(WorkOutcome::JobWorked)
    }

    async fn run_handler(&self, handler: &Arc<dyn JobHandler>, job: &Job) -> Result<(), JobError> {
        let ctx = JobContext::new(job.clone(), self.stop.child_token());
        let run = AssertUnwindSafe(handler.run(ctx)).catch_unwind();

        tokio::select! {
            biased;
            result = run => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(JobError::Handler(e)),
                Err(panic) => Err(JobError::from_panic(panic)),
            },
            _ = self.interrupt.cancelled() => {
                warn!(
                    job_id = job.job_id,
                    job_type = %job.job_type,
                    "Interrupting job on shutdown"
                );
                Err(JobError::Timeout)
            }
        }
    }

    async fn run_failure_hook(&self, handler: &Arc<dyn JobHandler>, error: &JobError, job: &Job) {
        match AssertUnwindSafe(handler.handle_failure(error, job))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = job.job_id, "Failure hook returned an error: {:#}", e),
            Err(panic) => warn!(
                job_id = job.job_id,
                "Failure hook panicked: {}",
                JobError::from_panic(panic)
            ),
        }
    }
}

/// Works jobs from one queue, or from weighted queues picked at random
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new(store, registry, WorkerConfig::new("mail"))?;
/// let handle = worker.handle();
/// let task = tokio::spawn(worker.work_loop());
///
/// handle.stop();
/// task.await?;
/// ```
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    lockers: Vec<Locker>,
    selector: QueueSelector,
    queue_label: String,
    wake_interval: Duration,
    execution: Execution,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let queues = config.queues();
        let lockers = queues
            .iter()
            .map(|weighted| {
                let locker = Locker::new(weighted.queue.clone(), config.cursor_expiry);
                match (config.lock_window, config.lock_budget) {
                    (Some(window), Some(budget)) => RateLimiter::new(window, budget)
                        .map(|limiter| locker.with_rate_limiter(limiter))
                        .map_err(|e| ConfigError::Invalid(e.to_string())),
                    _ => Ok(locker),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: format!("worker-{}", Uuid::now_v7()),
            store,
            lockers,
            selector: QueueSelector::new(&queues),
            queue_label: config.queue_label(),
            wake_interval: config.wake_interval,
            execution: Execution {
                registry,
                observers: vec![],
                stop: CancellationToken::new(),
                interrupt: CancellationToken::new(),
            },
        })
    }

    /// Set the worker ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Send events and lock timings to `observers`
    pub fn with_observers(mut self, observers: Vec<Arc<dyn WorkerObserver>>) -> Self {
        self.lockers = self
            .lockers
            .into_iter()
            .map(|locker| locker.with_observers(observers.clone()))
            .collect();
        self.execution.observers = observers;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id.clone(),
            stop: self.execution.stop.clone(),
            interrupt: self.execution.interrupt.clone(),
        }
    }

    /// Ask the worker to exit after its current job
    pub fn stop(&self) {
        self.execution.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.execution.stop.is_cancelled()
    }

    /// Lock and work at most one job.
    ///
    /// Store failures are reported as [`WorkOutcome::PostgresError`], never
    /// returned as errors.
    pub async fn work(&mut self) -> WorkOutcome {
        let index = self.selector.pick(&mut rand::thread_rng());
        let locker = &mut self.lockers[index];
        let queue = locker.queue().to_string();

        let mut conn = match self.store.checkout().await {
            Ok(conn) => conn,
            Err(e) => return self.execution.store_failed(&queue, &e),
        };

        let execution = self.execution.clone();
        let callback_queue = queue.clone();
        let result = locker
            .with_locked_job(&mut *conn, move |conn, job| {
                Box::pin(async move { execution.perform(&callback_queue, conn, job).await })
            })
            .await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) | Err(e) => self.execution.store_failed(&queue, &e),
        }
    }

    /// Work until stopped, pausing for the wake interval whenever an
    /// iteration finds nothing or fails on the store.
    pub async fn work_loop(mut self) {
        info!(worker_id = %self.id, queue = %self.queue_label, "Worker starting");

        while !self.is_stopped() {
            match self.work().await {
                WorkOutcome::JobWorked => {}
                WorkOutcome::JobNotFound | WorkOutcome::PostgresError => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.wake_interval) => {}
                        _ = self.execution.stop.cancelled() => {}
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Worker loop exited");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("queue", &self.queue_label)
            .field("lockers", &self.lockers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::job::NewJob;
    use crate::persistence::InMemoryJobStore;
    use crate::worker::WeightedQueue;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WorkerEvent>>,
        released: Mutex<Vec<i64>>,
    }

    impl WorkerObserver for Recorder {
        fn on_event(&self, event: &WorkerEvent) {
            self.events.lock().push(event.clone());
        }

        fn on_job_released(&self, job_id: i64) {
            self.released.lock().push(job_id);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|e| e.kind.as_str()).collect()
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register("Ok", handler_fn(|_ctx| async { Ok(()) }))
            .unwrap();
        registry
            .register("Fail", handler_fn(|_ctx| async { anyhow::bail!("nope") }))
            .unwrap();
        Arc::new(registry)
    }

    fn worker(store: &InMemoryJobStore, config: WorkerConfig) -> (Worker, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let worker = Worker::new(Arc::new(store.clone()), registry(), config)
            .unwrap()
            .with_observers(vec![recorder.clone()]);
        (worker, recorder)
    }

    #[tokio::test]
    async fn test_work_success_deletes_job() {
        let store = InMemoryJobStore::new();
        store.enqueue(NewJob::new("Ok")).await.unwrap();
        let (mut worker, recorder) = worker(&store, WorkerConfig::default());

        assert_eq!(worker.work().await, WorkOutcome::JobWorked);
        assert_eq!(store.job_count(), 0);
        assert_eq!(recorder.kinds(), vec!["job_begin", "job_worked"]);
        assert_eq!(recorder.released.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_failure_still_releases_job() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("Outage")).await.unwrap();

        let mut registry = HandlerRegistry::new();
        let outage = store.clone();
        registry
            .register(
                "Outage",
                handler_fn(move |_ctx| {
                    outage.set_unavailable(true);
                    async { Ok(()) }
                }),
            )
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut worker = Worker::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            WorkerConfig::default(),
        )
        .unwrap()
        .with_observers(vec![recorder.clone()]);

        assert_eq!(worker.work().await, WorkOutcome::PostgresError);
        assert_eq!(recorder.kinds(), vec!["job_begin", "postgres_error"]);
        assert_eq!(*recorder.released.lock(), vec![job.job_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_work_releases_job() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("Slow")).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "Slow",
                handler_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }),
            )
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut worker = Worker::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            WorkerConfig::default(),
        )
        .unwrap()
        .with_observers(vec![recorder.clone()]);

        let task = tokio::spawn(async move { worker.work().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.kinds(), vec!["job_begin"]);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(*recorder.released.lock(), vec![job.job_id]);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_work_failure_reschedules() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("Fail")).await.unwrap();
        let (mut worker, recorder) = worker(&store, WorkerConfig::default());

        assert_eq!(worker.work().await, WorkOutcome::JobWorked);
        let stored = store.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.error_count, 1);
        assert!(stored.last_error.unwrap().contains("nope"));
        assert_eq!(recorder.kinds(), vec!["job_begin", "job_error"]);
        assert_eq!(worker.work().await, WorkOutcome::JobNotFound);
    }

    #[tokio::test]
    async fn test_work_empty_queue() {
        let store = InMemoryJobStore::new();
        let (mut worker, recorder) = worker(&store, WorkerConfig::default());

        assert_eq!(worker.work().await, WorkOutcome::JobNotFound);
        assert_eq!(recorder.kinds(), vec!["job_not_found"]);
    }

    #[tokio::test]
    async fn test_store_outage_is_an_outcome() {
        let store = InMemoryJobStore::new();
        let (mut worker, recorder) = worker(&store, WorkerConfig::default());
        store.set_unavailable(true);

        assert_eq!(worker.work().await, WorkOutcome::PostgresError);
        assert_eq!(recorder.kinds(), vec!["postgres_error"]);
    }

    #[tokio::test]
    async fn test_weighted_worker_only_visits_weighted_queues() {
        let store = InMemoryJobStore::new();
        store.enqueue(NewJob::new("Ok").with_queue("a")).await.unwrap();
        store.enqueue(NewJob::new("Ok").with_queue("b")).await.unwrap();
        store.enqueue(NewJob::new("Ok").with_queue("c")).await.unwrap();
        let config = WorkerConfig::default()
            .with_weighted_queues(vec![WeightedQueue::new(1, "a"), WeightedQueue::new(1, "b")]);
        let (mut worker, _) = worker(&store, config);

        for _ in 0..50 {
            worker.work().await;
        }

        let left: Vec<String> = store.jobs().into_iter().map(|j| j.queue).collect();
        assert_eq!(left, vec!["c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_loop_exits_promptly_when_stopped_while_idle() {
        let store = InMemoryJobStore::new();
        let (worker, _) = worker(&store, WorkerConfig::default());
        let handle = worker.handle();
        let task = tokio::spawn(worker.work_loop());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stopped_at = Instant::now();
        handle.stop();
        task.await.unwrap();

        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_worker_does_not_start() {
        let store = InMemoryJobStore::new();
        store.enqueue(NewJob::new("Ok")).await.unwrap();
        let (worker, recorder) = worker(&store, WorkerConfig::default());

        worker.stop();
        worker.work_loop().await;

        assert_eq!(store.job_count(), 1);
        assert!(recorder.kinds().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = InMemoryJobStore::new();
        let config = WorkerConfig {
            lock_budget: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(Worker::new(Arc::new(store), registry(), config).is_err());
    }
}

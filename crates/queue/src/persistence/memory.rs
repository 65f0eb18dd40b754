//! In-memory implementation of JobStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::store::*;
use crate::job::{Job, JobStats, NewJob, WorkerState};

/// Advisory lock held by a session. Re-locking from the same session stacks.
struct LockHold {
    session: u64,
    count: u32,
}

struct Shared {
    jobs: RwLock<BTreeMap<i64, Job>>,
    locks: Mutex<HashMap<i64, LockHold>>,
    next_job_id: AtomicI64,
    next_session: AtomicU64,
    unavailable: AtomicBool,
}

/// In-memory implementation of JobStore
///
/// This is primarily for testing. It provides the same semantics as the
/// PostgreSQL implementation, including session-scoped advisory locks that
/// are released when a connection is dropped.
///
/// # Example
///
/// ```
/// use everruns_queue::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryJobStore {
    shared: Arc<Shared>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: RwLock::new(BTreeMap::new()),
                locks: Mutex::new(HashMap::new()),
                next_job_id: AtomicI64::new(1),
                next_session: AtomicU64::new(1),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Get the number of stored jobs
    pub fn job_count(&self) -> usize {
        self.shared.jobs.read().len()
    }

    /// Snapshot of all stored jobs in `job_id` order
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.jobs.read().values().cloned().collect()
    }

    /// Ids of jobs whose advisory lock is held by any session
    pub fn locked_job_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.shared.locks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Delete a row behind every session's back
    pub fn remove_job(&self, job_id: i64) -> Option<Job> {
        self.shared.jobs.write().remove(&job_id)
    }

    /// Make every operation fail as if the database went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Clear all data
    pub fn clear(&self) {
        self.shared.jobs.write().clear();
        self.shared.locks.lock().clear();
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        self.shared.ensure_available()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn same_row(a: &Job, b: &Job) -> bool {
    a.queue == b.queue && a.priority == b.priority && a.run_at == b.run_at && a.job_id == b.job_id
}

/// A session on the in-memory store
pub struct MemoryConnection {
    shared: Arc<Shared>,
    session: u64,
}

impl MemoryConnection {
    fn try_lock_held(&self, locks: &mut HashMap<i64, LockHold>, job_id: i64) -> bool {
        match locks.get_mut(&job_id) {
            Some(hold) if hold.session != self.session => false,
            Some(hold) => {
                hold.count += 1;
                true
            }
            None => {
                locks.insert(
                    job_id,
                    LockHold {
                        session: self.session,
                        count: 1,
                    },
                );
                true
            }
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let session = self.session;
        self.shared
            .locks
            .lock()
            .retain(|_, hold| hold.session != session);
    }
}

#[async_trait]
impl JobConnection for MemoryConnection {
    async fn lock_job(&mut self, queue: &str, cursor: i64) -> Result<Option<Job>, StoreError> {
        self.shared.ensure_available()?;

        let now = Utc::now();
        let jobs = self.shared.jobs.read();
        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|job| job.queue == queue && job.retryable && job.run_at <= now)
            .collect();
        candidates.sort_by_key(|job| job.sort_key());

        let Some(anchor) = candidates.iter().position(|job| job.job_id >= cursor) else {
            return Ok(None);
        };

        let mut locks = self.shared.locks.lock();
        for job in &candidates[anchor..] {
            if self.try_lock_held(&mut locks, job.job_id) {
                return Ok(Some((*job).clone()));
            }
        }
        Ok(None)
    }

    async fn job_exists(&mut self, job: &Job) -> Result<bool, StoreError> {
        self.shared.ensure_available()?;
        Ok(self
            .shared
            .jobs
            .read()
            .get(&job.job_id)
            .is_some_and(|stored| stored.retryable && same_row(stored, job)))
    }

    async fn try_lock(&mut self, job_id: i64) -> Result<bool, StoreError> {
        self.shared.ensure_available()?;
        let mut locks = self.shared.locks.lock();
        Ok(self.try_lock_held(&mut locks, job_id))
    }

    async fn unlock(&mut self, job_id: i64) -> Result<bool, StoreError> {
        self.shared.ensure_available()?;
        let mut locks = self.shared.locks.lock();
        match locks.get_mut(&job_id) {
            Some(hold) if hold.session == self.session => {
                hold.count -= 1;
                if hold.count == 0 {
                    locks.remove(&job_id);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn destroy_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.shared.ensure_available()?;
        let mut jobs = self.shared.jobs.write();
        if jobs.get(&job.job_id).is_some_and(|stored| same_row(stored, job)) {
            jobs.remove(&job.job_id);
        }
        Ok(())
    }

    async fn set_error(
        &mut self,
        job: &Job,
        error_count: i32,
        delay: Duration,
        message: &str,
    ) -> Result<(), StoreError> {
        self.shared.ensure_available()?;
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut jobs = self.shared.jobs.write();
        if let Some(stored) = jobs
            .get_mut(&job.job_id)
            .filter(|stored| same_row(stored, job))
        {
            stored.error_count = error_count;
            stored.run_at = Utc::now() + delay;
            stored.last_error = Some(message.to_string());
        }
        Ok(())
    }

    async fn enqueue(&mut self, job: NewJob) -> Result<Job, StoreError> {
        self.shared.ensure_available()?;
        let job_id = self.shared.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            queue: job.queue,
            priority: job.priority,
            run_at: job.run_at.unwrap_or_else(Utc::now),
            job_id,
            job_type: job.job_type,
            retryable: job.retryable,
            args: job.args,
            error_count: 0,
            last_error: None,
        };
        self.shared.jobs.write().insert(job_id, job.clone());
        Ok(job)
    }

    async fn in_transaction(&mut self) -> Result<bool, StoreError> {
        self.shared.ensure_available()?;
        Ok(false)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn checkout(&self) -> Result<Box<dyn JobConnection>, StoreError> {
        self.ensure_available()?;
        let session = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            session,
        }))
    }

    async fn find_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        self.ensure_available()?;
        Ok(self.shared.jobs.read().get(&job_id).cloned())
    }

    async fn job_stats(&self) -> Result<Vec<JobStats>, StoreError> {
        self.ensure_available()?;
        let jobs = self.shared.jobs.read();
        let locks = self.shared.locks.lock();

        let mut grouped: BTreeMap<(String, String), JobStats> = BTreeMap::new();
        for job in jobs.values() {
            let stats = grouped
                .entry((job.queue.clone(), job.job_type.clone()))
                .or_insert_with(|| JobStats {
                    queue: job.queue.clone(),
                    job_type: job.job_type.clone(),
                    count: 0,
                    count_working: 0,
                    count_errored: 0,
                    highest_error_count: 0,
                    oldest_run_at: None,
                });
            stats.count += 1;
            if locks.contains_key(&job.job_id) {
                stats.count_working += 1;
            }
            if job.error_count > 0 {
                stats.count_errored += 1;
            }
            stats.highest_error_count = stats.highest_error_count.max(job.error_count);
            stats.oldest_run_at = Some(match stats.oldest_run_at {
                Some(oldest) => oldest.min(job.run_at),
                None => job.run_at,
            });
        }

        let mut stats: Vec<JobStats> = grouped.into_values().collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(stats)
    }

    async fn worker_states(&self) -> Result<Vec<WorkerState>, StoreError> {
        self.ensure_available()?;
        let jobs = self.shared.jobs.read();
        let locks = self.shared.locks.lock();

        Ok(jobs
            .values()
            .filter_map(|job| {
                locks.get(&job.job_id).map(|hold| WorkerState {
                    job: job.clone(),
                    backend_pid: hold.session as i32,
                    state: Some("active".to_string()),
                    last_query: None,
                    transaction_started_at: None,
                    waiting: false,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn enqueue(store: &InMemoryJobStore, job: NewJob) -> Job {
        store.enqueue(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let store = InMemoryJobStore::new();
        let a = enqueue(&store, NewJob::new("A")).await;
        let b = enqueue(&store, NewJob::new("B").with_args(vec![json!(1)])).await;

        assert!(b.job_id > a.job_id);
        assert_eq!(b.args, vec![json!(1)]);
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_lock_job_respects_priority_order() {
        let store = InMemoryJobStore::new();
        for priority in [5, 4, 3, 2, 1] {
            enqueue(&store, NewJob::new("A").with_priority(priority)).await;
        }

        let mut conn = store.checkout().await.unwrap();
        let job = conn.lock_job("", 0).await.unwrap().unwrap();
        assert_eq!(job.priority, 1);
    }

    #[tokio::test]
    async fn test_lock_job_skips_future_and_other_queues() {
        let store = InMemoryJobStore::new();
        enqueue(
            &store,
            NewJob::new("A").with_run_at(Utc::now() + chrono::Duration::seconds(60)),
        )
        .await;
        enqueue(&store, NewJob::new("A").with_queue("other")).await;
        enqueue(&store, NewJob::new("A").with_retryable(false)).await;

        let mut conn = store.checkout().await.unwrap();
        assert!(conn.lock_job("", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_job_skips_jobs_locked_by_other_sessions() {
        let store = InMemoryJobStore::new();
        let first = enqueue(&store, NewJob::new("A")).await;
        let second = enqueue(&store, NewJob::new("A")).await;

        let mut a = store.checkout().await.unwrap();
        let mut b = store.checkout().await.unwrap();

        assert_eq!(a.lock_job("", 0).await.unwrap().unwrap().job_id, first.job_id);
        assert_eq!(b.lock_job("", 0).await.unwrap().unwrap().job_id, second.job_id);
        assert!(store.checkout().await.unwrap().lock_job("", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_job_anchors_at_cursor_then_walks_in_order() {
        let store = InMemoryJobStore::new();
        let low_id_late = enqueue(&store, NewJob::new("A").with_priority(50)).await;
        let high_id_early = enqueue(&store, NewJob::new("A").with_priority(10)).await;

        // Anchor is the first row in order with job_id >= cursor; rows after
        // it are walked regardless of their id.
        let mut conn = store.checkout().await.unwrap();
        let job = conn
            .lock_job("", high_id_early.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id, high_id_early.job_id);

        let mut other = store.checkout().await.unwrap();
        let job = other
            .lock_job("", high_id_early.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id, low_id_late.job_id);
    }

    #[tokio::test]
    async fn test_lock_job_with_cursor_past_every_job() {
        let store = InMemoryJobStore::new();
        enqueue(&store, NewJob::new("A")).await;

        let mut conn = store.checkout().await.unwrap();
        assert!(conn.lock_job("", 1_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advisory_locks_are_session_scoped() {
        let store = InMemoryJobStore::new();
        let mut a = store.checkout().await.unwrap();
        let mut b = store.checkout().await.unwrap();

        assert!(a.try_lock(7).await.unwrap());
        assert!(a.try_lock(7).await.unwrap());
        assert!(!b.try_lock(7).await.unwrap());
        assert!(!b.unlock(7).await.unwrap());

        assert!(a.unlock(7).await.unwrap());
        assert!(!b.try_lock(7).await.unwrap());
        assert!(a.unlock(7).await.unwrap());
        assert!(b.try_lock(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropping_connection_releases_locks() {
        let store = InMemoryJobStore::new();
        let mut a = store.checkout().await.unwrap();
        assert!(a.try_lock(1).await.unwrap());
        assert_eq!(store.locked_job_ids(), vec![1]);

        drop(a);
        assert!(store.locked_job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_set_error_reschedules() {
        let store = InMemoryJobStore::new();
        let job = enqueue(&store, NewJob::new("A")).await;

        let mut conn = store.checkout().await.unwrap();
        conn.set_error(&job, 1, Duration::from_secs(4), "boom")
            .await
            .unwrap();

        let stored = store.find_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.run_at > Utc::now() + chrono::Duration::seconds(3));
        assert!(stored.retryable);
    }

    #[tokio::test]
    async fn test_destroy_and_exists_match_key_columns() {
        let store = InMemoryJobStore::new();
        let job = enqueue(&store, NewJob::new("A")).await;

        let mut conn = store.checkout().await.unwrap();
        let mut stale = job.clone();
        stale.priority = 1;
        assert!(!conn.job_exists(&stale).await.unwrap());
        conn.destroy_job(&stale).await.unwrap();
        assert_eq!(store.job_count(), 1);

        assert!(conn.job_exists(&job).await.unwrap());
        conn.destroy_job(&job).await.unwrap();
        assert!(!conn.job_exists(&job).await.unwrap());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_fast() {
        let store = InMemoryJobStore::new();
        let mut conn = store.checkout().await.unwrap();
        store.set_unavailable(true);

        assert!(matches!(
            conn.lock_job("", 0).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.checkout().await.is_err());

        store.set_unavailable(false);
        assert!(conn.lock_job("", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_stats() {
        let store = InMemoryJobStore::new();
        let a = enqueue(&store, NewJob::new("A")).await;
        enqueue(&store, NewJob::new("A")).await;
        enqueue(&store, NewJob::new("B").with_queue("mail")).await;

        let mut conn = store.checkout().await.unwrap();
        conn.set_error(&a, 3, Duration::from_secs(60), "boom")
            .await
            .unwrap();
        let locked = conn.lock_job("", 0).await.unwrap().unwrap();

        let stats = store.job_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].job_type, "A");
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].count_working, 1);
        assert_eq!(stats[0].count_errored, 1);
        assert_eq!(stats[0].highest_error_count, 3);
        assert_eq!(stats[1].queue, "mail");

        let states = store.worker_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].job.job_id, locked.job_id);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryJobStore::new();
        enqueue(&store, NewJob::new("A")).await;
        store.clear();
        assert_eq!(store.job_count(), 0);
    }
}

//! PostgreSQL implementation of JobStore
//!
//! Jobs are arbitrated with session-scoped advisory locks keyed by `job_id`:
//! - A recursive CTE walks candidates one row at a time, so a query never
//!   holds more than one lock
//! - Locks outlive statements and transactions, so a worker keeps one
//!   pooled connection from lock to unlock
//! - A connection dropped while holding locks is closed, not returned to the
//!   pool, which makes the server release them

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, instrument, warn};

use super::store::*;
use crate::job::{Job, JobStats, NewJob, WorkerState};

/// Embedded schema for `queue_jobs`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const JOB_COLUMNS: &str =
    "queue, priority, run_at, job_id, job_type, retryable, args, error_count, last_error";

const LOCK_JOB: &str = r#"
    WITH RECURSIVE jobs AS (
        SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
        FROM (
            SELECT j
            FROM queue_jobs AS j
            WHERE queue = $1::text
            AND job_id >= $2
            AND run_at <= now()
            AND retryable = true
            ORDER BY priority, run_at, job_id
            LIMIT 1
        ) AS t1
        UNION ALL (
            SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
            FROM (
                SELECT (
                    SELECT j
                    FROM queue_jobs AS j
                    WHERE queue = $1::text
                    AND run_at <= now()
                    AND retryable = true
                    AND (priority, run_at, job_id) > (jobs.priority, jobs.run_at, jobs.job_id)
                    ORDER BY priority, run_at, job_id
                    LIMIT 1
                ) AS j
                FROM jobs
                WHERE jobs.job_id IS NOT NULL
                LIMIT 1
            ) AS t1
        )
    )
    SELECT queue, priority, run_at, job_id, job_type, retryable, args, error_count, last_error
    FROM jobs
    WHERE locked
    LIMIT 1
"#;

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use everruns_queue::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresJobStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::from(e)
        })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            error!("Failed to run migrations: {}", e);
            StoreError::Database(e.to_string())
        })
    }
}

/// A pooled session holding zero or more advisory locks
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
    held: HashMap<i64, u32>,
}

impl PostgresConnection {
    fn note_locked(&mut self, job_id: i64) {
        *self.held.entry(job_id).or_insert(0) += 1;
    }

    fn note_unlocked(&mut self, job_id: i64) {
        if let Some(count) = self.held.get_mut(&job_id) {
            *count -= 1;
            if *count == 0 {
                self.held.remove(&job_id);
            }
        }
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(
                locks = self.held.len(),
                "connection dropped while holding advisory locks, closing it"
            );
            self.conn.close_on_drop();
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let args: serde_json::Value = row.try_get("args")?;
    let args = match args {
        serde_json::Value::Array(values) => values,
        other => {
            return Err(StoreError::Serialization(format!(
                "job args must be a JSON array, got {other}"
            )))
        }
    };

    Ok(Job {
        queue: row.try_get("queue")?,
        priority: row.try_get("priority")?,
        run_at: row.try_get("run_at")?,
        job_id: row.try_get("job_id")?,
        job_type: row.try_get("job_type")?,
        retryable: row.try_get("retryable")?,
        args,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl JobConnection for PostgresConnection {
    #[instrument(skip(self))]
    async fn lock_job(&mut self, queue: &str, cursor: i64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(LOCK_JOB)
            .bind(queue)
            .bind(cursor)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| {
                error!("Failed to lock job: {}", e);
                StoreError::from(e)
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id: i64 = row.try_get("job_id")?;
        self.note_locked(job_id);
        let job = job_from_row(&row)?;

        debug!(job_id, %queue, "locked job");
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(job_id = job.job_id))]
    async fn job_exists(&mut self, job: &Job) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one
            FROM queue_jobs
            WHERE queue = $1::text
            AND retryable = true
            AND priority = $2::smallint
            AND run_at = $3::timestamptz
            AND job_id = $4::bigint
            "#,
        )
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.job_id)
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(|e| {
            error!("Failed to check job: {}", e);
            StoreError::from(e)
        })?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn try_lock(&mut self, job_id: i64) -> Result<bool, StoreError> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(job_id)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| {
                error!("Failed to take advisory lock: {}", e);
                StoreError::from(e)
            })?;

        if locked {
            self.note_locked(job_id);
        }
        Ok(locked)
    }

    #[instrument(skip(self))]
    async fn unlock(&mut self, job_id: i64) -> Result<bool, StoreError> {
        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(job_id)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| {
                error!("Failed to release advisory lock: {}", e);
                StoreError::from(e)
            })?;

        if unlocked {
            self.note_unlocked(job_id);
        } else {
            warn!(job_id, "advisory lock was not held by this session");
        }
        Ok(unlocked)
    }

    #[instrument(skip(self, job), fields(job_id = job.job_id))]
    async fn destroy_job(&mut self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE queue = $1::text
            AND priority = $2::smallint
            AND run_at = $3::timestamptz
            AND job_id = $4::bigint
            "#,
        )
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.job_id)
        .execute(&mut *self.conn)
        .await
        .map_err(|e| {
            error!("Failed to destroy job: {}", e);
            StoreError::from(e)
        })?;

        debug!(job_id = job.job_id, "destroyed job");
        Ok(())
    }

    #[instrument(skip(self, job, message), fields(job_id = job.job_id))]
    async fn set_error(
        &mut self,
        job: &Job,
        error_count: i32,
        delay: Duration,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET error_count = $1::integer,
                run_at = now() + $2::float8 * '1 second'::interval,
                last_error = $3::text
            WHERE queue = $4::text
            AND priority = $5::smallint
            AND run_at = $6::timestamptz
            AND job_id = $7::bigint
            "#,
        )
        .bind(error_count)
        .bind(delay.as_secs_f64())
        .bind(message)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.job_id)
        .execute(&mut *self.conn)
        .await
        .map_err(|e| {
            error!("Failed to set job error: {}", e);
            StoreError::from(e)
        })?;

        debug!(job_id = job.job_id, error_count, ?delay, "rescheduled failed job");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_type = %job.job_type, queue = %job.queue))]
    async fn enqueue(&mut self, job: NewJob) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO queue_jobs (queue, priority, run_at, job_type, retryable, args)
            VALUES ($1::text, $2::smallint, coalesce($3::timestamptz, now()), $4::text, $5::bool, $6::jsonb)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&job.queue)
            .bind(job.priority)
            .bind(job.run_at)
            .bind(&job.job_type)
            .bind(job.retryable)
            .bind(serde_json::Value::Array(job.args))
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| {
                error!("Failed to enqueue job: {}", e);
                StoreError::from(e)
            })?;

        let job = job_from_row(&row)?;
        debug!(job_id = job.job_id, "enqueued job");
        Ok(job)
    }

    async fn in_transaction(&mut self) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            r#"
            SELECT xact_start IS DISTINCT FROM query_start
            FROM pg_stat_activity
            WHERE pid = pg_backend_pid()
            "#,
        )
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| {
            error!("Failed to read transaction status: {}", e);
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn checkout(&self) -> Result<Box<dyn JobConnection>, StoreError> {
        let conn = self.pool.acquire().await.map_err(|e| {
            error!("Failed to acquire connection: {}", e);
            StoreError::from(e)
        })?;
        Ok(Box::new(PostgresConnection {
            conn,
            held: HashMap::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn find_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find job: {}", e);
                StoreError::from(e)
            })?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn job_stats(&self) -> Result<Vec<JobStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue,
                   job_type,
                   count(*)                    AS count,
                   count(locks.job_id)         AS count_working,
                   sum((error_count > 0)::int) AS count_errored,
                   max(error_count)            AS highest_error_count,
                   min(run_at)                 AS oldest_run_at
            FROM queue_jobs
            LEFT JOIN (
                SELECT (classid::bigint << 32) + objid::bigint AS job_id
                FROM pg_locks
                WHERE locktype = 'advisory'
            ) locks USING (job_id)
            GROUP BY queue, job_type
            ORDER BY count(*) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read job stats: {}", e);
            StoreError::from(e)
        })?;

        rows.iter()
            .map(|row| {
                Ok(JobStats {
                    queue: row.try_get("queue")?,
                    job_type: row.try_get("job_type")?,
                    count: row.try_get("count")?,
                    count_working: row.try_get("count_working")?,
                    count_errored: row.try_get("count_errored")?,
                    highest_error_count: row.try_get("highest_error_count")?,
                    oldest_run_at: row.try_get("oldest_run_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn worker_states(&self) -> Result<Vec<WorkerState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue_jobs.*,
                   pg.pid                       AS pg_backend_pid,
                   pg.state                     AS pg_state,
                   pg.query                     AS pg_last_query,
                   pg.xact_start                AS pg_transaction_started_at,
                   pg.wait_event_type = 'Lock'  AS pg_waiting_on_lock
            FROM queue_jobs
            JOIN (
                SELECT (classid::bigint << 32) + objid::bigint AS job_id, pg_stat_activity.*
                FROM pg_locks
                JOIN pg_stat_activity USING (pid)
                WHERE locktype = 'advisory'
            ) pg USING (job_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read worker states: {}", e);
            StoreError::from(e)
        })?;

        rows.iter()
            .map(|row| {
                let waiting: Option<bool> = row.try_get("pg_waiting_on_lock")?;
                let started: Option<DateTime<Utc>> = row.try_get("pg_transaction_started_at")?;
                Ok(WorkerState {
                    job: job_from_row(row)?,
                    backend_pid: row.try_get("pg_backend_pid")?,
                    state: row.try_get("pg_state")?,
                    last_query: row.try_get("pg_last_query")?,
                    transaction_started_at: started,
                    waiting: waiting.unwrap_or(false),
                })
            })
            .collect()
    }
}

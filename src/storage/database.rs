//! SQLite database client for the scheduler store.
//!
//! Every mutation runs inside one transaction while holding the store's writer
//! lock, so a logical operation ("claim this job for that worker", "requeue
//! after a worker failure") commits as a unit and never interleaves with
//! another writer. Reads go straight to the pool and see the latest committed
//! state (WAL mode).

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::scheduler::job::{
    AssignedJob, HistoryEntry, Job, JobStatus, NewJob, OrphanedJob, OverdueJob, QueuedJob,
    ResourceRequirements, RetryOutcome, MAX_PRIORITY,
};

use crate::scheduler::worker::WorkerStatus;

use super::migrations::{MigrationError, MigrationRunner};
use super::workers::{reservations, worker_from_row, WORKER_COLUMNS};

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Caller supplied an invalid value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested status change is not part of the job state machine.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Tuning knobs for opening a file-backed store.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// SQLite-backed scheduler store.
pub struct Database {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

const JOB_COLUMNS: &str = "job_id, name, config, status, priority, deadline_ms, retry_count, \
     max_retries, dependencies, resource_requirements, assigned_worker_id, created_ms, \
     started_ms, ended_ms, error_message";

fn parse_status(raw: &str) -> Result<JobStatus, DatabaseError> {
    raw.parse::<JobStatus>()
        .map_err(|e| DatabaseError::CorruptRow(e.to_string()))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, DatabaseError> {
    let status: String = row.try_get("status")?;
    let config: String = row.try_get("config")?;
    let dependencies: String = row.try_get("dependencies")?;
    let requirements: Option<String> = row.try_get("resource_requirements")?;

    Ok(Job {
        id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        config: serde_json::from_str(&config)?,
        status: parse_status(&status)?,
        priority: row.try_get::<i64, _>("priority")?.clamp(0, i64::from(MAX_PRIORITY)) as u8,
        deadline: row.try_get::<Option<i64>, _>("deadline_ms")?.map(from_ms),
        retry_count: row.try_get::<i64, _>("retry_count")?.max(0) as u32,
        max_retries: row.try_get::<i64, _>("max_retries")?.max(0) as u32,
        dependencies: serde_json::from_str(&dependencies)?,
        resource_requirements: requirements
            .as_deref()
            .map(serde_json::from_str::<ResourceRequirements>)
            .transpose()?,
        assigned_worker_id: row.try_get("assigned_worker_id")?,
        created_at: from_ms(row.try_get("created_ms")?),
        started_at: row.try_get::<Option<i64>, _>("started_ms")?.map(from_ms),
        ended_at: row.try_get::<Option<i64>, _>("ended_ms")?.map(from_ms),
        error_message: row.try_get("error_message")?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

async fn fetch_job(conn: &mut SqliteConnection, job_id: i64) -> Result<Option<Job>, DatabaseError> {
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS))
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Returns the status of every listed job that exists.
async fn dependency_states(
    conn: &mut SqliteConnection,
    dependencies: &[i64],
) -> Result<Vec<(i64, JobStatus)>, DatabaseError> {
    if dependencies.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT job_id, status FROM jobs WHERE job_id IN ({})",
        placeholders(dependencies.len())
    );
    let mut query = sqlx::query(&sql);
    for id in dependencies {
        query = query.bind(*id);
    }

    let rows = query.fetch_all(&mut *conn).await?;
    let mut states = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.try_get("status")?;
        states.push((row.try_get("job_id")?, parse_status(&status)?));
    }
    Ok(states)
}

async fn dependencies_completed(
    conn: &mut SqliteConnection,
    dependencies: &[i64],
) -> Result<bool, DatabaseError> {
    let states = dependency_states(conn, dependencies).await?;
    Ok(states.len() == dependencies.len()
        && states.iter().all(|(_, s)| *s == JobStatus::Completed))
}

/// Inserts a queue entry unless one exists. Returns whether a row was added.
async fn enqueue(
    conn: &mut SqliteConnection,
    job_id: i64,
    priority: u8,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO job_queue (job_id, priority, queued_ms) VALUES (?1, ?2, ?3)",
    )
    .bind(job_id)
    .bind(i64::from(priority))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn close_active_assignment(
    conn: &mut SqliteConnection,
    job_id: i64,
    status: &str,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE job_assignments SET status = ?1, released_ms = ?2
         WHERE job_id = ?3 AND status = 'active'",
    )
    .bind(status)
    .bind(now)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_history(
    conn: &mut SqliteConnection,
    job: &Job,
    status: JobStatus,
    error_message: Option<&str>,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO job_history (job_id, worker_id, started_ms, ended_ms, status, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(job.id)
    .bind(job.assigned_worker_id)
    .bind(job.started_at.map(|t| t.timestamp_millis()))
    .bind(now)
    .bind(status.as_str())
    .bind(error_message)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Pending jobs that list `job_id` among their dependencies.
async fn pending_dependents(
    conn: &mut SqliteConnection,
    job_id: i64,
) -> Result<Vec<(i64, u8, Vec<i64>)>, DatabaseError> {
    let rows = sqlx::query(
        "SELECT job_id, priority, dependencies FROM jobs
         WHERE status = 'pending' AND dependencies != '[]'
         ORDER BY job_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut dependents = Vec::new();
    for row in rows {
        let raw: String = row.try_get("dependencies")?;
        let dependencies: Vec<i64> = serde_json::from_str(&raw)?;
        if dependencies.contains(&job_id) {
            let priority = row.try_get::<i64, _>("priority")?.clamp(0, 100) as u8;
            dependents.push((row.try_get("job_id")?, priority, dependencies));
        }
    }
    Ok(dependents)
}

/// Moves a job to a terminal status and applies the side effects: queue entry
/// removed, active assignment closed, history written, dependents
/// re-evaluated. Failed or cancelled jobs fail their pending dependents, which
/// cascades through the same worklist.
async fn finish_job(
    conn: &mut SqliteConnection,
    job_id: i64,
    status: JobStatus,
    error_message: Option<String>,
    now: i64,
) -> Result<(), DatabaseError> {
    debug_assert!(status.is_terminal());
    let mut worklist = vec![(job_id, status, error_message)];

    while let Some((id, status, error_message)) = worklist.pop() {
        let Some(job) = fetch_job(conn, id).await? else {
            continue;
        };
        if job.status.is_terminal() {
            continue;
        }

        sqlx::query("DELETE FROM job_queue WHERE job_id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "UPDATE jobs SET status = ?1, ended_ms = ?2, error_message = ?3 WHERE job_id = ?4",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(error_message.as_deref())
        .bind(id)
        .execute(&mut *conn)
        .await?;

        close_active_assignment(conn, id, status.as_str(), now).await?;
        insert_history(conn, &job, status, error_message.as_deref(), now).await?;
        debug!(job_id = id, status = %status, "Job reached terminal status");

        for (dependent, priority, dependencies) in pending_dependents(conn, id).await? {
            if status == JobStatus::Completed {
                if dependencies_completed(conn, &dependencies).await?
                    && enqueue(conn, dependent, priority, now).await?
                {
                    info!(job_id = dependent, "Job queued, dependencies satisfied");
                }
            } else {
                warn!(job_id = dependent, dependency = id, "Dependency did not complete");
                worklist.push((
                    dependent,
                    JobStatus::Failed,
                    Some(format!("Dependency {} did not complete", id)),
                ));
            }
        }
    }

    Ok(())
}

fn check_transition(job: &Job, to: JobStatus) -> Result<(), DatabaseError> {
    let allowed = match to {
        JobStatus::Running => job.status.is_in_flight(),
        JobStatus::Completed => job.status == JobStatus::Running,
        JobStatus::Failed | JobStatus::Cancelled => true,
        JobStatus::Pending | JobStatus::Assigned => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to,
        })
    }
}

impl Database {
    /// Opens (creating if needed) a file-backed store and applies the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::connect_with(path, DatabaseOptions::default()).await
    }

    /// Opens a file-backed store with explicit options.
    pub async fn connect_with(
        path: impl AsRef<Path>,
        options: DatabaseOptions,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;

        info!(path = %path.display(), "Scheduler database opened");
        Ok(db)
    }

    /// Opens a private in-memory store. The pool holds exactly one connection
    /// for the lifetime of the store, since each SQLite memory connection is a
    /// separate database.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;
        Ok(db)
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Schema version the store is at.
    pub async fn schema_version(&self) -> Result<u32, DatabaseError> {
        Ok(MigrationRunner::new(self.pool.clone())
            .current_version()
            .await?)
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Scheduler database closed");
    }

    pub(crate) async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Adds a job and queues it when it has no dependencies or all of them
    /// have completed.
    ///
    /// Every dependency must name an existing job; since IDs are assigned here,
    /// this rules out dependency cycles. A job whose dependency already failed
    /// or was cancelled is failed immediately.
    pub async fn add_job(&self, job: NewJob) -> Result<i64, DatabaseError> {
        if job.name.trim().is_empty() {
            return Err(DatabaseError::InvalidInput(
                "job name must not be empty".to_string(),
            ));
        }
        if job.priority > MAX_PRIORITY {
            return Err(DatabaseError::InvalidInput(format!(
                "priority {} is outside 0-{}",
                job.priority, MAX_PRIORITY
            )));
        }

        let mut dependencies = job.dependencies.clone();
        dependencies.sort_unstable();
        dependencies.dedup();

        let requirements = job
            .resource_requirements
            .as_ref()
            .filter(|r| !r.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        let config = serde_json::to_string(&job.config)?;
        let dependencies_json = serde_json::to_string(&dependencies)?;
        let now = now_ms();

        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;

        let states = dependency_states(&mut tx, &dependencies).await?;
        if let Some(missing) = dependencies
            .iter()
            .find(|id| !states.iter().any(|(known, _)| known == *id))
        {
            return Err(DatabaseError::InvalidInput(format!(
                "unknown dependency job {}",
                missing
            )));
        }

        let result = sqlx::query(
            "INSERT INTO jobs (
                name, config, status, priority, deadline_ms, max_retries,
                dependencies, resource_requirements, created_ms
            ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&job.name)
        .bind(&config)
        .bind(i64::from(job.priority))
        .bind(job.deadline.map(|d| d.timestamp_millis()))
        .bind(i64::from(job.max_retries))
        .bind(&dependencies_json)
        .bind(requirements)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let job_id = result.last_insert_rowid();

        let broken = states
            .iter()
            .find(|(_, s)| matches!(s, JobStatus::Failed | JobStatus::Cancelled));
        if let Some((dependency, _)) = broken {
            finish_job(
                &mut tx,
                job_id,
                JobStatus::Failed,
                Some(format!("Dependency {} did not complete", dependency)),
                now,
            )
            .await?;
        } else if states.iter().all(|(_, s)| *s == JobStatus::Completed) {
            enqueue(&mut tx, job_id, job.priority, now).await?;
        }

        tx.commit().await?;

        info!(job_id, name = %job.name, priority = job.priority, "Added job");
        Ok(job_id)
    }

    /// Updates a job's status.
    ///
    /// Terminal statuses remove the queue entry, close the active assignment,
    /// write a history entry and re-evaluate dependents in the same
    /// transaction. Returns `None` for unknown jobs and for jobs that are
    /// already terminal.
    pub async fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Option<Job>, DatabaseError> {
        let now = now_ms();
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;

        let Some(job) = fetch_job(&mut tx, job_id).await? else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            debug!(job_id, current = %job.status, requested = %status, "Job already terminal");
            return Ok(None);
        }
        check_transition(&job, status)?;

        if status == JobStatus::Running {
            sqlx::query(
                "UPDATE jobs SET status = 'running', started_ms = COALESCE(started_ms, ?1)
                 WHERE job_id = ?2",
            )
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        } else {
            finish_job(&mut tx, job_id, status, error_message.map(str::to_string), now).await?;
        }

        let updated = fetch_job(&mut tx, job_id).await?;
        tx.commit().await?;

        debug!(job_id, status = %status, "Job status updated");
        Ok(updated)
    }

    /// Claims a queued job for an online worker.
    ///
    /// Deleting the queue entry is the claim: a job that is no longer queued
    /// cannot be assigned twice. The worker's free capacity is checked again
    /// inside the transaction, counting jobs already assigned to it that have
    /// not started, so a slot is never handed out twice. Returns `false` when
    /// the job is not queued, the worker is unknown or offline, or the job no
    /// longer fits.
    pub async fn assign_job_to_worker(
        &self,
        job_id: i64,
        worker_id: i64,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;

        let worker_row = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE worker_id = ?1",
            WORKER_COLUMNS
        ))
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut worker) = worker_row.as_ref().map(worker_from_row).transpose()? else {
            debug!(job_id, worker_id, "Worker unknown, not assigning");
            return Ok(false);
        };
        if worker.status != WorkerStatus::Online {
            debug!(job_id, worker_id, "Worker offline, not assigning");
            return Ok(false);
        }

        let requirements: Option<String> =
            sqlx::query_scalar("SELECT resource_requirements FROM jobs WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();
        if let Some(raw) = requirements {
            let requirements: ResourceRequirements = serde_json::from_str(&raw)?;
            worker.reserved = reservations(&mut tx).await?.remove(&worker_id).unwrap_or_default();
            if !worker.fits(&requirements) {
                debug!(job_id, worker_id, "Worker capacity already committed, not assigning");
                return Ok(false);
            }
        }

        let claimed = sqlx::query("DELETE FROM job_queue WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if claimed == 0 {
            debug!(job_id, "Job is not queued, not assigning");
            return Ok(false);
        }

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'assigned', assigned_worker_id = ?1
             WHERE job_id = ?2 AND status = 'pending'",
        )
        .bind(worker_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            warn!(job_id, "Queued job is not pending, leaving it untouched");
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO job_assignments (job_id, worker_id, assigned_ms, status)
             VALUES (?1, ?2, ?3, 'active')",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(job_id, worker_id, "Job assigned to worker");
        Ok(true)
    }

    /// Records a failed attempt and either requeues the job or, once the retry
    /// budget is spent, fails it with "Max retries (<n>) exceeded".
    ///
    /// The requeued entry keeps the job's priority but gets a fresh queued
    /// time. Returns `None` for unknown or terminal jobs.
    pub async fn increment_job_retry(
        &self,
        job_id: i64,
    ) -> Result<Option<RetryOutcome>, DatabaseError> {
        let now = now_ms();
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;

        let Some(job) = fetch_job(&mut tx, job_id).await? else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            debug!(job_id, status = %job.status, "Retry ignored, job already terminal");
            return Ok(None);
        }

        let retry_count = job.retry_count + 1;

        if retry_count >= job.max_retries {
            sqlx::query("UPDATE jobs SET retry_count = ?1 WHERE job_id = ?2")
                .bind(i64::from(retry_count.min(job.max_retries)))
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            finish_job(
                &mut tx,
                job_id,
                JobStatus::Failed,
                Some(format!("Max retries ({}) exceeded", job.max_retries)),
                now,
            )
            .await?;
            tx.commit().await?;

            warn!(job_id, max_retries = job.max_retries, "Job failed, max retries exceeded");
            return Ok(Some(RetryOutcome::Exhausted {
                max_retries: job.max_retries,
            }));
        }

        if job.status.is_in_flight() {
            let reason = format!("Attempt {} abandoned, job requeued", retry_count);
            insert_history(&mut tx, &job, JobStatus::Failed, Some(&reason), now).await?;
            close_active_assignment(&mut tx, job_id, "released", now).await?;
        }

        sqlx::query(
            "UPDATE jobs SET retry_count = ?1, status = 'pending', assigned_worker_id = NULL,
                 started_ms = NULL, error_message = NULL
             WHERE job_id = ?2",
        )
        .bind(i64::from(retry_count))
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM job_queue WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if dependencies_completed(&mut tx, &job.dependencies).await? {
            enqueue(&mut tx, job_id, job.priority, now).await?;
        }

        tx.commit().await?;

        info!(
            job_id,
            retry = retry_count,
            max_retries = job.max_retries,
            "Job re-queued"
        );
        Ok(Some(RetryOutcome::Requeued { retry_count }))
    }

    /// Retrieves a job by its ID.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, job_id).await
    }

    /// Lists jobs, optionally restricted to one status, in ID order.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, DatabaseError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs WHERE status = ?1 ORDER BY job_id",
                    JOB_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {} FROM jobs ORDER BY job_id", JOB_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(job_from_row).collect()
    }

    /// Returns the head of the queue: highest priority, then oldest queued
    /// time, then insertion order.
    pub async fn get_next_job_from_queue(&self) -> Result<Option<QueuedJob>, DatabaseError> {
        let row = sqlx::query(
            "SELECT j.job_id, j.name, j.resource_requirements, q.priority, q.queued_ms
             FROM job_queue q
             JOIN jobs j ON q.job_id = j.job_id
             ORDER BY q.priority DESC, q.queued_ms ASC, q.queue_id ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let requirements: Option<String> = row.try_get("resource_requirements")?;
        Ok(Some(QueuedJob {
            job_id: row.try_get("job_id")?,
            name: row.try_get("name")?,
            priority: row.try_get::<i64, _>("priority")?.clamp(0, 100) as u8,
            resource_requirements: requirements
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            queued_at: from_ms(row.try_get("queued_ms")?),
        }))
    }

    /// Returns whether the job currently has a queue entry.
    pub async fn is_queued(&self, job_id: i64) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE job_id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Returns every recorded attempt of a job, oldest first.
    pub async fn get_job_history(&self, job_id: i64) -> Result<Vec<HistoryEntry>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT history_id, job_id, worker_id, started_ms, ended_ms, status, error_message
             FROM job_history WHERE job_id = ?1 ORDER BY history_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            entries.push(HistoryEntry {
                id: row.try_get("history_id")?,
                job_id: row.try_get("job_id")?,
                worker_id: row.try_get("worker_id")?,
                started_at: row.try_get::<Option<i64>, _>("started_ms")?.map(from_ms),
                ended_at: row.try_get::<Option<i64>, _>("ended_ms")?.map(from_ms),
                status: parse_status(&status)?,
                error_message: row.try_get("error_message")?,
            });
        }
        Ok(entries)
    }

    /// Returns the number of active assignments held by a job.
    pub async fn count_active_assignments(&self, job_id: i64) -> Result<u64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_assignments WHERE job_id = ?1 AND status = 'active'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// In-flight jobs whose assigned worker is offline.
    pub async fn get_orphaned_jobs(&self) -> Result<Vec<OrphanedJob>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT j.job_id, j.name, j.assigned_worker_id
             FROM jobs j
             JOIN workers w ON j.assigned_worker_id = w.worker_id
             WHERE j.status IN ('assigned', 'running') AND w.status = 'offline'
             ORDER BY j.job_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OrphanedJob {
                    job_id: row.try_get("job_id")?,
                    name: row.try_get("name")?,
                    worker_id: row.try_get("assigned_worker_id")?,
                })
            })
            .collect()
    }

    /// Non-terminal jobs whose deadline is strictly before `now`.
    pub async fn get_overdue_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverdueJob>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT job_id, name, deadline_ms FROM jobs
             WHERE status IN ('pending', 'assigned', 'running')
               AND deadline_ms IS NOT NULL
               AND deadline_ms < ?1
             ORDER BY job_id",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OverdueJob {
                    job_id: row.try_get("job_id")?,
                    name: row.try_get("name")?,
                    deadline: from_ms(row.try_get("deadline_ms")?),
                })
            })
            .collect()
    }

    /// Jobs in `assigned` status with the address of their worker.
    pub async fn get_assigned_jobs(&self) -> Result<Vec<AssignedJob>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT j.job_id, j.name, j.config, w.worker_id, w.ip_address
             FROM jobs j
             JOIN workers w ON j.assigned_worker_id = w.worker_id
             WHERE j.status = 'assigned'
             ORDER BY j.job_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let config: String = row.try_get("config")?;
            jobs.push(AssignedJob {
                job_id: row.try_get("job_id")?,
                name: row.try_get("name")?,
                config: serde_json::from_str(&config)?,
                worker_id: row.try_get("worker_id")?,
                worker_ip: row.try_get("ip_address")?,
            });
        }
        Ok(jobs)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Job counts by status.
    pub async fn get_job_stats(&self) -> Result<BTreeMap<String, u64>, DatabaseError> {
        self.count_by_status("jobs").await
    }

    /// Worker counts by status.
    pub async fn get_worker_stats(&self) -> Result<BTreeMap<String, u64>, DatabaseError> {
        self.count_by_status("workers").await
    }

    /// Number of queued jobs.
    pub async fn get_queue_length(&self) -> Result<u64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_by_status(&self, table: &str) -> Result<BTreeMap<String, u64>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            table
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            stats.insert(status, count as u64);
        }
        Ok(stats)
    }
}

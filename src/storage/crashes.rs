//! Crash records reported by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info};

use super::database::{from_ms, now_ms, Database, DatabaseError};

/// A crash as reported by a worker, before it is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCrash {
    #[serde(default)]
    pub testcase_path: Option<String>,
    #[serde(default)]
    pub crash_type: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub exploitability: Option<String>,
    #[serde(default)]
    pub crash_file: Option<String>,
    /// When the worker observed the crash. Defaults to the time it is stored.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duplicate_count: u32,
}

/// A stored crash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Crash {
    pub id: i64,
    pub job_id: i64,
    pub worker_id: Option<i64>,
    pub testcase_path: Option<String>,
    pub crash_type: Option<String>,
    pub details: Option<String>,
    pub signature: Option<String>,
    pub exploitability: Option<String>,
    pub crash_file: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duplicate_count: u32,
}

impl Database {
    /// Stores a crash for a job.
    ///
    /// Returns `None` when the job or the worker is unknown.
    pub async fn add_crash(
        &self,
        job_id: i64,
        worker_id: i64,
        crash: &NewCrash,
    ) -> Result<Option<i64>, DatabaseError> {
        let timestamp = crash
            .timestamp
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(now_ms);

        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        let job_known: Option<i64> = sqlx::query_scalar("SELECT job_id FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let worker_known: Option<i64> =
            sqlx::query_scalar("SELECT worker_id FROM workers WHERE worker_id = ?1")
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await?;
        if job_known.is_none() || worker_known.is_none() {
            debug!(job_id, worker_id, "Crash for unknown job or worker dropped");
            return Ok(None);
        }

        let crash_id = sqlx::query(
            "INSERT INTO crashes (
                job_id, worker_id, testcase_path, crash_type, details, signature,
                exploitability, crash_file, timestamp_ms, duplicate_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(crash.testcase_path.as_deref())
        .bind(crash.crash_type.as_deref())
        .bind(crash.details.as_deref())
        .bind(crash.signature.as_deref())
        .bind(crash.exploitability.as_deref())
        .bind(crash.crash_file.as_deref())
        .bind(timestamp)
        .bind(i64::from(crash.duplicate_count))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        info!(crash_id, job_id, worker_id, "Crash recorded");
        Ok(Some(crash_id))
    }

    /// Lists crashes, optionally for one job, oldest first.
    pub async fn get_crashes(&self, job_id: Option<i64>) -> Result<Vec<Crash>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT crash_id, job_id, worker_id, testcase_path, crash_type, details, signature,
                    exploitability, crash_file, timestamp_ms, duplicate_count
             FROM crashes
             WHERE ?1 IS NULL OR job_id = ?1
             ORDER BY crash_id",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Crash {
                    id: row.try_get("crash_id")?,
                    job_id: row.try_get("job_id")?,
                    worker_id: row.try_get("worker_id")?,
                    testcase_path: row.try_get("testcase_path")?,
                    crash_type: row.try_get("crash_type")?,
                    details: row.try_get("details")?,
                    signature: row.try_get("signature")?,
                    exploitability: row.try_get("exploitability")?,
                    crash_file: row.try_get("crash_file")?,
                    timestamp: from_ms(row.try_get("timestamp_ms")?),
                    duplicate_count: row.try_get::<i64, _>("duplicate_count")?.max(0) as u32,
                })
            })
            .collect()
    }

    /// Total number of stored crashes.
    pub async fn get_crash_count(&self) -> Result<u64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crashes")
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }
}

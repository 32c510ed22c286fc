//! Worker registry operations.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use crate::scheduler::job::ResourceRequirements;
use crate::scheduler::worker::{
    Capabilities, CurrentLoad, Worker, WorkerRegistration, WorkerStatus, DEFAULT_HEARTBEAT_INTERVAL,
};

use super::database::{from_ms, now_ms, Database, DatabaseError};

pub(crate) const WORKER_COLUMNS: &str = "worker_id, ip_address, hostname, status, cpu_cores, ram_gb, \
     max_vms, cpu_usage, ram_usage, used_vms, tags, heartbeat_interval_secs, \
     last_heartbeat_ms, registered_ms";

pub(crate) fn worker_from_row(row: &SqliteRow) -> Result<Worker, DatabaseError> {
    let status: String = row.try_get("status")?;
    let tags: String = row.try_get("tags")?;

    Ok(Worker {
        id: row.try_get("worker_id")?,
        ip_address: row.try_get("ip_address")?,
        hostname: row.try_get("hostname")?,
        status: status
            .parse::<WorkerStatus>()
            .map_err(DatabaseError::CorruptRow)?,
        capabilities: Capabilities {
            cpu_cores: row.try_get("cpu_cores")?,
            ram_gb: row.try_get("ram_gb")?,
            max_vms: row.try_get::<i64, _>("max_vms")?.max(0) as u32,
        },
        current_load: CurrentLoad {
            cpu_usage: row.try_get("cpu_usage")?,
            ram_usage: row.try_get("ram_usage")?,
            used_vms: row.try_get::<i64, _>("used_vms")?.max(0) as u32,
        },
        reserved: CurrentLoad::default(),
        tags: serde_json::from_str(&tags)?,
        heartbeat_interval: Duration::from_secs(
            row.try_get::<i64, _>("heartbeat_interval_secs")?.max(0) as u64,
        ),
        last_heartbeat: row.try_get::<Option<i64>, _>("last_heartbeat_ms")?.map(from_ms),
        registered_at: from_ms(row.try_get("registered_ms")?),
    })
}

/// Sums the declared requirements of jobs that hold an active assignment but
/// have not started, keyed by worker.
pub(crate) async fn reservations(
    conn: &mut SqliteConnection,
) -> Result<HashMap<i64, CurrentLoad>, DatabaseError> {
    let rows = sqlx::query(
        "SELECT a.worker_id, j.resource_requirements
         FROM job_assignments a
         JOIN jobs j ON j.job_id = a.job_id
         WHERE a.status = 'active'
           AND j.status = 'assigned'
           AND j.resource_requirements IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut reserved: HashMap<i64, CurrentLoad> = HashMap::new();
    for row in &rows {
        let raw: String = row.try_get("resource_requirements")?;
        let requirements: ResourceRequirements = serde_json::from_str(&raw)?;
        reserved
            .entry(row.try_get("worker_id")?)
            .or_default()
            .add_requirements(&requirements);
    }
    Ok(reserved)
}

impl Database {
    // =========================================================================
    // Worker Operations
    // =========================================================================

    /// Registers a worker by IP address, or refreshes an existing one.
    ///
    /// Registration is idempotent: the same address always maps to the same
    /// worker ID. The worker is marked online and its heartbeat refreshed;
    /// fields left unset in `registration` keep their stored values.
    pub async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<i64, DatabaseError> {
        let ip = registration.ip_address.trim();
        if ip.is_empty() {
            return Err(DatabaseError::InvalidInput(
                "worker IP address must not be empty".to_string(),
            ));
        }

        let caps = registration.capabilities;
        let tags = registration
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let interval = registration
            .heartbeat_interval
            .map(|d| d.as_secs() as i64);
        let now = now_ms();

        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT worker_id FROM workers WHERE ip_address = ?1")
                .bind(ip)
                .fetch_optional(&mut *tx)
                .await?;

        let worker_id = match existing {
            Some(worker_id) => {
                sqlx::query(
                    "UPDATE workers SET
                        hostname = COALESCE(?1, hostname),
                        cpu_cores = COALESCE(?2, cpu_cores),
                        ram_gb = COALESCE(?3, ram_gb),
                        max_vms = COALESCE(?4, max_vms),
                        tags = COALESCE(?5, tags),
                        heartbeat_interval_secs = COALESCE(?6, heartbeat_interval_secs),
                        status = 'online',
                        last_heartbeat_ms = ?7
                     WHERE worker_id = ?8",
                )
                .bind(registration.hostname.as_deref())
                .bind(caps.map(|c| c.cpu_cores))
                .bind(caps.map(|c| c.ram_gb))
                .bind(caps.map(|c| i64::from(c.max_vms)))
                .bind(tags)
                .bind(interval)
                .bind(now)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
                debug!(worker_id, ip, "Worker re-registered");
                worker_id
            }
            None => {
                let caps = caps.unwrap_or_default();
                let result = sqlx::query(
                    "INSERT INTO workers (
                        ip_address, hostname, status, cpu_cores, ram_gb, max_vms, tags,
                        heartbeat_interval_secs, last_heartbeat_ms, registered_ms
                     ) VALUES (?1, ?2, 'online', ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                )
                .bind(ip)
                .bind(registration.hostname.as_deref())
                .bind(caps.cpu_cores)
                .bind(caps.ram_gb)
                .bind(i64::from(caps.max_vms))
                .bind(tags.unwrap_or_else(|| "[]".to_string()))
                .bind(interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL.as_secs() as i64))
                .bind(now)
                .execute(&mut *tx)
                .await?;
                let worker_id = result.last_insert_rowid();
                info!(worker_id, ip, "Worker registered");
                worker_id
            }
        };

        tx.commit().await?;
        Ok(worker_id)
    }

    /// Records a heartbeat: marks the worker online, refreshes its heartbeat
    /// time and, when given, replaces its current load.
    ///
    /// Returns `false` for an unknown worker.
    pub async fn update_worker_heartbeat(
        &self,
        worker_id: i64,
        load: Option<CurrentLoad>,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let _guard = self.write_guard().await;

        let result = sqlx::query(
            "UPDATE workers SET
                status = 'online',
                last_heartbeat_ms = ?1,
                cpu_usage = COALESCE(?2, cpu_usage),
                ram_usage = COALESCE(?3, ram_usage),
                used_vms = COALESCE(?4, used_vms)
             WHERE worker_id = ?5",
        )
        .bind(now)
        .bind(load.map(|l| l.cpu_usage))
        .bind(load.map(|l| l.ram_usage))
        .bind(load.map(|l| i64::from(l.used_vms)))
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks online workers whose last heartbeat is older than `timeout` as
    /// offline. Returns how many were marked.
    pub async fn mark_stale_workers_offline(&self, timeout: Duration) -> Result<u64, DatabaseError> {
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let _guard = self.write_guard().await;

        let marked = sqlx::query(
            "UPDATE workers SET status = 'offline'
             WHERE status = 'online'
               AND (last_heartbeat_ms IS NULL OR last_heartbeat_ms < ?1)",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        if marked > 0 {
            warn!(count = marked, timeout_secs = timeout.as_secs(), "Marked stale workers offline");
        }
        Ok(marked)
    }

    /// Retrieves a worker by ID.
    pub async fn get_worker(&self, worker_id: i64) -> Result<Option<Worker>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE worker_id = ?1",
            WORKER_COLUMNS
        ))
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(worker_from_row).transpose()
    }

    /// Retrieves a worker by IP address.
    pub async fn get_worker_by_ip(&self, ip_address: &str) -> Result<Option<Worker>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE ip_address = ?1",
            WORKER_COLUMNS
        ))
        .bind(ip_address)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(worker_from_row).transpose()
    }

    /// Lists all workers in ID order.
    pub async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workers ORDER BY worker_id",
            WORKER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(worker_from_row).collect()
    }

    /// Lists online workers in ID order.
    ///
    /// A non-empty `tags` slice keeps only workers carrying at least one of
    /// them. Each worker carries its current reservations.
    pub async fn get_available_workers(&self, tags: &[String]) -> Result<Vec<Worker>, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE status = 'online' ORDER BY worker_id",
            WORKER_COLUMNS
        ))
        .fetch_all(&mut *conn)
        .await?;
        let mut reserved = reservations(&mut conn).await?;

        let mut workers = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut worker = worker_from_row(row)?;
            if tags.is_empty() || worker.has_any_tag(tags) {
                worker.reserved = reserved.remove(&worker.id).unwrap_or_default();
                workers.push(worker);
            }
        }
        Ok(workers)
    }
}

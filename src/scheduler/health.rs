//! Worker liveness: stale heartbeat detection and recovery of orphaned jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::storage::Database;

use super::job::RetryOutcome;

/// Default time without a heartbeat before a worker is considered offline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Result of one health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Workers marked offline by this check.
    pub offline_workers: u64,
    /// Orphaned jobs returned to the queue.
    pub requeued_jobs: usize,
    /// Orphaned jobs failed because their retry budget ran out.
    pub failed_jobs: usize,
}

/// Marks silent workers offline and recovers the jobs they held.
pub struct WorkerHealthMonitor {
    db: Arc<Database>,
    heartbeat_timeout: Duration,
    metrics: SchedulerMetrics,
}

impl WorkerHealthMonitor {
    pub fn new(db: Arc<Database>, heartbeat_timeout: Duration, metrics: SchedulerMetrics) -> Self {
        Self {
            db,
            heartbeat_timeout,
            metrics,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Marks stale workers offline, then retries every in-flight job held by
    /// an offline worker.
    ///
    /// The orphan scan runs on every check, not only when a worker was just
    /// marked, so jobs left behind by a crash of the scheduler itself are
    /// picked up too.
    pub async fn check_worker_health(&self) -> Result<HealthReport, SchedulerError> {
        let mut report = HealthReport {
            offline_workers: self
                .db
                .mark_stale_workers_offline(self.heartbeat_timeout)
                .await?,
            ..Default::default()
        };

        for orphan in self.db.get_orphaned_jobs().await? {
            match self.db.increment_job_retry(orphan.job_id).await? {
                Some(RetryOutcome::Requeued { retry_count }) => {
                    report.requeued_jobs += 1;
                    info!(
                        job_id = orphan.job_id,
                        worker_id = orphan.worker_id,
                        retry = retry_count,
                        "Re-queued job from offline worker"
                    );
                }
                Some(RetryOutcome::Exhausted { max_retries }) => {
                    report.failed_jobs += 1;
                    warn!(
                        job_id = orphan.job_id,
                        worker_id = orphan.worker_id,
                        max_retries,
                        "Job from offline worker exceeded max retries"
                    );
                }
                // Finished or vanished between the scan and the retry.
                None => {}
            }
        }

        self.metrics.record_health(
            report.offline_workers,
            report.requeued_jobs as u64,
            report.failed_jobs as u64,
        );

        if report.offline_workers > 0 {
            warn!(
                offline_workers = report.offline_workers,
                requeued = report.requeued_jobs,
                failed = report.failed_jobs,
                "Health check found offline workers"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobStatus, NewJob};
    use crate::scheduler::worker::WorkerRegistration;

    #[tokio::test]
    async fn test_healthy_workers_are_left_alone() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.register_worker(WorkerRegistration::new("10.0.0.1"))
            .await
            .unwrap();

        let monitor = WorkerHealthMonitor::new(
            Arc::clone(&db),
            DEFAULT_HEARTBEAT_TIMEOUT,
            SchedulerMetrics::new().unwrap(),
        );
        let report = monitor.check_worker_health().await.unwrap();

        assert_eq!(report, HealthReport::default());
    }

    #[tokio::test]
    async fn test_orphan_with_no_retries_left_fails() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let worker = db
            .register_worker(WorkerRegistration::new("10.0.0.1"))
            .await
            .unwrap();
        let job = db
            .add_job(NewJob::new("fuzz", serde_json::json!({})).with_max_retries(1))
            .await
            .unwrap();
        assert!(db.assign_job_to_worker(job, worker).await.unwrap());

        // A zero timeout makes every worker stale.
        let monitor = WorkerHealthMonitor::new(
            Arc::clone(&db),
            Duration::ZERO,
            SchedulerMetrics::new().unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = monitor.check_worker_health().await.unwrap();

        assert_eq!(report.offline_workers, 1);
        assert_eq!(report.failed_jobs, 1);
        let stored = db.get_job(job).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Max retries (1) exceeded"));
    }
}

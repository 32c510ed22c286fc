//! Scheduler orchestrator: one cycle of health, deadline and scheduling
//! passes, plus aggregate status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::storage::Database;

use super::allocation::AllocationStrategy;
use super::deadline::DeadlineEnforcer;
use super::engine::{JobScheduler, StopReason};
use super::health::WorkerHealthMonitor;

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Workers marked offline by the health pass.
    pub offline_workers: u64,
    /// Orphaned jobs returned to the queue.
    pub requeued_jobs: usize,
    /// Orphaned jobs failed for exhausting their retries.
    pub failed_jobs: usize,
    /// Jobs failed by the deadline pass.
    pub overdue_jobs: usize,
    /// Jobs assigned by the scheduling pass.
    pub scheduled_jobs: usize,
    /// Why the scheduling pass stopped.
    pub stop_reason: StopReason,
}

/// Aggregate scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// Job counts by status.
    pub jobs: BTreeMap<String, u64>,
    /// Worker counts by status.
    pub workers: BTreeMap<String, u64>,
    pub queue_length: u64,
    pub crashes: u64,
    pub allocation_strategy: AllocationStrategy,
}

impl SchedulerStatus {
    /// Number of jobs with the given status.
    pub fn jobs_with(&self, status: &str) -> u64 {
        self.jobs.get(status).copied().unwrap_or(0)
    }

    /// Number of workers with the given status.
    pub fn workers_with(&self, status: &str) -> u64 {
        self.workers.get(status).copied().unwrap_or(0)
    }
}

/// Runs the scheduling components in a fixed order.
pub struct SchedulerOrchestrator {
    db: Arc<Database>,
    scheduler: JobScheduler,
    health: WorkerHealthMonitor,
    deadlines: DeadlineEnforcer,
    metrics: SchedulerMetrics,
    max_jobs_per_cycle: usize,
}

impl SchedulerOrchestrator {
    /// Creates an orchestrator with its own metrics registry.
    pub fn new(db: Arc<Database>, config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let metrics = SchedulerMetrics::new()?;
        Ok(Self::with_metrics(db, config, metrics))
    }

    /// Creates an orchestrator that records into `metrics`.
    pub fn with_metrics(
        db: Arc<Database>,
        config: &SchedulerConfig,
        metrics: SchedulerMetrics,
    ) -> Self {
        info!(
            strategy = %config.allocation_strategy,
            heartbeat_timeout_secs = config.heartbeat_timeout_secs,
            max_jobs_per_cycle = config.max_jobs_per_cycle,
            "Scheduler initialized"
        );

        Self {
            scheduler: JobScheduler::new(
                Arc::clone(&db),
                config.allocation_strategy,
                metrics.clone(),
            ),
            health: WorkerHealthMonitor::new(
                Arc::clone(&db),
                config.heartbeat_timeout(),
                metrics.clone(),
            ),
            deadlines: DeadlineEnforcer::new(Arc::clone(&db), metrics.clone()),
            db,
            metrics,
            max_jobs_per_cycle: config.max_jobs_per_cycle,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Runs one cycle: health, then deadlines, then scheduling.
    ///
    /// Each pass commits before the next starts, so jobs recovered from dead
    /// workers are back in the queue and overdue jobs are out of it by the
    /// time new assignments are made.
    pub async fn run_cycle(&self) -> Result<CycleStats, SchedulerError> {
        let started = Instant::now();

        let health = self.health.check_worker_health().await?;
        let overdue_jobs = self.deadlines.check_deadlines().await?;
        let report = self
            .scheduler
            .run_scheduling_cycle(self.max_jobs_per_cycle)
            .await?;

        let stats = CycleStats {
            offline_workers: health.offline_workers,
            requeued_jobs: health.requeued_jobs,
            failed_jobs: health.failed_jobs,
            overdue_jobs,
            scheduled_jobs: report.scheduled,
            stop_reason: report.stop_reason,
        };

        self.metrics.record_cycle(started.elapsed());
        debug!(?stats, elapsed_ms = started.elapsed().as_millis() as u64, "Scheduler cycle");

        Ok(stats)
    }

    /// Collects job, worker, queue and crash counts, and refreshes the queue
    /// depth and online worker gauges.
    pub async fn get_status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let status = SchedulerStatus {
            jobs: self.db.get_job_stats().await?,
            workers: self.db.get_worker_stats().await?,
            queue_length: self.db.get_queue_length().await?,
            crashes: self.db.get_crash_count().await?,
            allocation_strategy: self.scheduler.strategy(),
        };

        self.metrics
            .set_gauges(status.queue_length, status.workers_with("online"));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NewJob;
    use crate::scheduler::worker::{Capabilities, WorkerRegistration};

    #[tokio::test]
    async fn test_status_serializes_to_json() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.register_worker(
            WorkerRegistration::new("10.0.0.1").with_capabilities(Capabilities::new(4.0, 8.0, 2)),
        )
        .await
        .unwrap();
        db.add_job(NewJob::new("a", serde_json::json!({})))
            .await
            .unwrap();
        db.add_job(NewJob::new("b", serde_json::json!({})))
            .await
            .unwrap();

        let orchestrator =
            SchedulerOrchestrator::new(Arc::clone(&db), &SchedulerConfig::default()).unwrap();
        let stats = orchestrator.run_cycle().await.unwrap();
        assert_eq!(stats.scheduled_jobs, 2);
        assert_eq!(stats.stop_reason, StopReason::QueueEmpty);

        let status = orchestrator.get_status().await.unwrap();
        assert_eq!(status.jobs_with("assigned"), 2);
        assert_eq!(status.workers_with("online"), 1);
        assert_eq!(status.queue_length, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["allocation_strategy"], "load_aware");
        assert_eq!(json["jobs"]["assigned"], 2);
        assert!(orchestrator
            .metrics()
            .export()
            .contains("fuzz_scheduler_online_workers 1"));
    }
}

//! Job scheduler: queue head selection and worker allocation.
//!
//! The scheduler is stateless apart from the round-robin cursor. Every
//! decision is derived from a fresh read of the store and committed through a
//! single `assign_job_to_worker` transaction, which is also the claim that
//! keeps a job from being assigned twice.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::storage::Database;

use super::allocation::{self, AllocationOutcome, AllocationStrategy};
use super::job::QueuedJob;

/// Why a scheduling pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left in the queue.
    QueueEmpty,
    /// The queue head could not be placed; it stays queued for the next pass.
    NoSuitableWorker,
    /// The per-pass job limit was reached.
    BatchLimit,
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulingReport {
    /// Jobs assigned during the pass.
    pub scheduled: usize,
    /// Why the pass stopped.
    pub stop_reason: StopReason,
}

/// Matches queued jobs to workers.
pub struct JobScheduler {
    db: Arc<Database>,
    strategy: AllocationStrategy,
    cursor: AtomicUsize,
    metrics: SchedulerMetrics,
}

impl JobScheduler {
    /// Creates a scheduler with the given default strategy.
    pub fn new(db: Arc<Database>, strategy: AllocationStrategy, metrics: SchedulerMetrics) -> Self {
        Self {
            db,
            strategy,
            cursor: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Returns the default allocation strategy.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Returns the next job to place, without removing it from the queue.
    pub async fn schedule_next_job(&self) -> Result<Option<QueuedJob>, SchedulerError> {
        Ok(self.db.get_next_job_from_queue().await?)
    }

    /// Tries to place `job` on a worker using `strategy`.
    ///
    /// Candidates are the online workers (restricted to the job's tags when it
    /// declares any) whose free capacity covers every declared requirement.
    pub async fn allocate_job_to_worker(
        &self,
        job: &QueuedJob,
        strategy: AllocationStrategy,
    ) -> Result<AllocationOutcome, SchedulerError> {
        let requirements = job.resource_requirements.as_ref();
        let tags = requirements.map(|r| r.tags.as_slice()).unwrap_or_default();

        let workers = self.db.get_available_workers(tags).await?;
        if workers.is_empty() {
            debug!(job_id = job.job_id, "No workers online for job");
            return Ok(self.record(AllocationOutcome::NoWorkersOnline));
        }

        let candidates: Vec<_> = workers
            .into_iter()
            .filter(|w| allocation::satisfies(w, requirements))
            .collect();

        let Some(worker) = allocation::select(strategy, &candidates, &self.cursor) else {
            debug!(
                job_id = job.job_id,
                requirements = ?requirements,
                "No worker has enough free capacity"
            );
            return Ok(self.record(AllocationOutcome::NoCapacity));
        };

        let worker_id = worker.id;
        if self.db.assign_job_to_worker(job.job_id, worker_id).await? {
            info!(
                job_id = job.job_id,
                name = %job.name,
                worker_id,
                worker_ip = %worker.ip_address,
                strategy = %strategy,
                "Allocated job to worker"
            );
            Ok(self.record(AllocationOutcome::Assigned { worker_id }))
        } else {
            warn!(job_id = job.job_id, worker_id, "Assignment lost, job or worker changed");
            Ok(self.record(AllocationOutcome::Lost { worker_id }))
        }
    }

    /// Allocates using the scheduler's default strategy.
    pub async fn allocate(&self, job: &QueuedJob) -> Result<AllocationOutcome, SchedulerError> {
        self.allocate_job_to_worker(job, self.strategy).await
    }

    /// Places queued jobs until the queue is empty, the head cannot be
    /// placed, or `max_jobs` allocation attempts were made.
    ///
    /// The pass is greedy and stops at the first unplaceable job: a large job
    /// at the head blocks smaller ones behind it until capacity frees up.
    pub async fn run_scheduling_cycle(
        &self,
        max_jobs: usize,
    ) -> Result<SchedulingReport, SchedulerError> {
        let mut scheduled = 0;

        for _ in 0..max_jobs {
            let Some(job) = self.schedule_next_job().await? else {
                if scheduled == 0 {
                    self.metrics.record_empty_queue();
                }
                return Ok(SchedulingReport {
                    scheduled,
                    stop_reason: StopReason::QueueEmpty,
                });
            };

            match self.allocate(&job).await? {
                AllocationOutcome::Assigned { .. } => scheduled += 1,
                // The store changed under us; look at the queue again.
                AllocationOutcome::Lost { .. } => continue,
                AllocationOutcome::NoWorkersOnline | AllocationOutcome::NoCapacity => {
                    return Ok(SchedulingReport {
                        scheduled,
                        stop_reason: StopReason::NoSuitableWorker,
                    });
                }
            }
        }

        Ok(SchedulingReport {
            scheduled,
            stop_reason: StopReason::BatchLimit,
        })
    }

    fn record(&self, outcome: AllocationOutcome) -> AllocationOutcome {
        self.metrics.record_allocation(&outcome);
        outcome
    }
}

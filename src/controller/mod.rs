//! Controller loop.
//!
//! The controller drives the scheduler against real workers. Each iteration
//! runs one scheduler cycle, polls every online worker for status and
//! crashes, pushes newly assigned jobs, and logs a summary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fuzz_scheduler::config::ControllerConfig;
//! use fuzz_scheduler::controller::{Controller, TcpTransport};
//! use fuzz_scheduler::scheduler::SchedulerOrchestrator;
//! use fuzz_scheduler::storage::Database;
//!
//! let config = ControllerConfig::load("controller.yaml")?;
//! let db = Arc::new(Database::connect(&config.db_path).await?);
//! let orchestrator = SchedulerOrchestrator::new(db, &config.scheduler)?;
//! let transport = Arc::new(TcpTransport::new(config.worker_port));
//!
//! let controller = Controller::new(orchestrator, transport, &config);
//! let shutdown = controller.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     let _ = shutdown.send(());
//! });
//! controller.run().await?;
//! ```

pub mod package;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, WorkerEntry};
use crate::error::SchedulerError;
use crate::scheduler::job::{AssignedJob, JobStatus};
use crate::scheduler::orchestrator::{CycleStats, SchedulerOrchestrator};
use crate::scheduler::worker::{CurrentLoad, Worker};
use crate::storage::{Database, DatabaseError, NewCrash};

pub use package::{JobPackage, PackageError};
pub use transport::{
    ControlMessage, CrashReport, CrashResponse, JobReport, StatusResponse, TcpTransport,
    TransportError, WorkerTransport,
};

/// Why a job push failed.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("Packaging failed: {0}")]
    Package(#[from] PackageError),

    #[error("Packaging task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// What one controller iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationStats {
    pub cycle: CycleStats,
    /// Online workers asked for status.
    pub workers_polled: usize,
    /// Workers that answered.
    pub workers_responded: usize,
    /// Jobs moved to a terminal status from worker reports.
    pub jobs_finished: usize,
    /// Crash records stored.
    pub crashes_stored: usize,
    /// Jobs pushed and acknowledged.
    pub jobs_pushed: usize,
    /// Pushes that failed and went through the retry path.
    pub push_failures: usize,
}

#[derive(Debug, Default)]
struct PollStats {
    polled: usize,
    responded: usize,
    finished: usize,
    crashes: usize,
}

/// Runs scheduler cycles and shuttles jobs, status and crashes between the
/// store and the workers.
pub struct Controller {
    orchestrator: SchedulerOrchestrator,
    transport: Arc<dyn WorkerTransport>,
    poll_interval: Duration,
    workers: Vec<WorkerEntry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    /// Creates a controller.
    ///
    /// # Arguments
    ///
    /// * `orchestrator` - Scheduler components bound to the store
    /// * `transport` - Client used to reach workers
    /// * `config` - Poll interval and workers to register on startup
    pub fn new(
        orchestrator: SchedulerOrchestrator,
        transport: Arc<dyn WorkerTransport>,
        config: &ControllerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            orchestrator,
            transport,
            poll_interval: config.poll_interval(),
            workers: config.workers.clone(),
            shutdown_tx,
        }
    }

    /// Returns a sender that stops [`run`](Self::run) when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn orchestrator(&self) -> &SchedulerOrchestrator {
        &self.orchestrator
    }

    fn db(&self) -> &Database {
        self.orchestrator.database()
    }

    /// Registers the workers listed in the configuration.
    pub async fn register_configured_workers(&self) -> Result<usize, SchedulerError> {
        for entry in &self.workers {
            let worker_id = self.db().register_worker(entry.registration()).await?;
            debug!(worker_id, ip = entry.ip(), "Registered configured worker");
        }
        Ok(self.workers.len())
    }

    /// Runs until a shutdown signal arrives.
    ///
    /// Shutdown is checked between iterations and during the sleep, never in
    /// the middle of an iteration. A failed iteration is logged and the loop
    /// carries on.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let registered = self.register_configured_workers().await?;
        info!(
            workers = registered,
            strategy = %self.orchestrator.scheduler().strategy(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Controller started"
        );

        loop {
            // Check for shutdown signal (non-blocking)
            match shutdown_rx.try_recv() {
                Ok(())
                | Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    info!("Controller received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if let Err(e) = self.run_iteration().await {
                error!(error = %e, "Controller iteration failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("Controller received shutdown signal");
                    break;
                }
            }
        }

        info!("Controller stopped");
        Ok(())
    }

    /// Runs one iteration: scheduler cycle, worker polling, job pushes,
    /// status summary.
    pub async fn run_iteration(&self) -> Result<IterationStats, SchedulerError> {
        let cycle = self.orchestrator.run_cycle().await?;
        let poll = self.poll_workers().await?;
        let (jobs_pushed, push_failures) = self.push_assigned_jobs().await?;

        let status = self.orchestrator.get_status().await?;
        info!(
            queued = status.queue_length,
            running = status.jobs_with(JobStatus::Running.as_str()),
            assigned = status.jobs_with(JobStatus::Assigned.as_str()),
            online_workers = status.workers_with("online"),
            crashes = status.crashes,
            "Status"
        );

        Ok(IterationStats {
            cycle,
            workers_polled: poll.polled,
            workers_responded: poll.responded,
            jobs_finished: poll.finished,
            crashes_stored: poll.crashes,
            jobs_pushed,
            push_failures,
        })
    }

    async fn poll_workers(&self) -> Result<PollStats, SchedulerError> {
        let mut stats = PollStats::default();

        for worker in self.db().get_available_workers(&[]).await? {
            stats.polled += 1;

            let response = match self.transport.request_status(&worker.ip_address).await {
                Ok(response) => response,
                Err(e) => {
                    // The health monitor decides when silence means offline.
                    warn!(worker_id = worker.id, ip = %worker.ip_address, error = %e, "Worker did not answer status request");
                    continue;
                }
            };
            stats.responded += 1;

            let load = response.load.unwrap_or(CurrentLoad {
                used_vms: response.used_vms(),
                ..worker.current_load
            });
            self.db().update_worker_heartbeat(worker.id, Some(load)).await?;

            for (job_id, report) in &response.status {
                stats.crashes += self.collect_crashes(&worker, *job_id).await?;

                if let Some(status) = report.terminal_status() {
                    if self
                        .apply_report(&worker, *job_id, status, report.error.as_deref())
                        .await?
                    {
                        stats.finished += 1;
                    }
                }
            }
        }

        self.orchestrator
            .metrics()
            .record_crashes(stats.crashes as u64);
        Ok(stats)
    }

    async fn collect_crashes(&self, worker: &Worker, job_id: i64) -> Result<usize, SchedulerError> {
        let reports = match self
            .transport
            .request_crashes(&worker.ip_address, job_id)
            .await
        {
            Ok(reports) => reports,
            Err(e) => {
                debug!(worker_id = worker.id, job_id, error = %e, "Crash request failed");
                return Ok(0);
            }
        };

        let mut stored = 0;
        for report in reports {
            let crash = NewCrash::from(report);
            if self.db().add_crash(job_id, worker.id, &crash).await?.is_some() {
                stored += 1;
            }
        }
        if stored > 0 {
            info!(worker_id = worker.id, job_id, crashes = stored, "Stored crashes from worker");
        }
        Ok(stored)
    }

    /// Applies a terminal state reported by a worker. Reports about jobs the
    /// worker no longer holds are ignored.
    async fn apply_report(
        &self,
        worker: &Worker,
        job_id: i64,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, SchedulerError> {
        let Some(job) = self.db().get_job(job_id).await? else {
            return Ok(false);
        };
        if job.assigned_worker_id != Some(worker.id) || !job.status.is_in_flight() {
            debug!(job_id, worker_id = worker.id, status = %job.status, "Ignoring stale job report");
            return Ok(false);
        }

        match self
            .db()
            .update_job_status(job_id, status, error_message)
            .await
        {
            Ok(updated) => {
                if updated.is_some() {
                    info!(job_id, worker_id = worker.id, status = %status, "Worker reported job finished");
                }
                Ok(updated.is_some())
            }
            Err(DatabaseError::InvalidTransition { from, to, .. }) => {
                warn!(job_id, %from, %to, "Worker report does not fit job state");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pushes every `assigned` job. Returns (acknowledged, failed).
    async fn push_assigned_jobs(&self) -> Result<(usize, usize), SchedulerError> {
        let mut pushed = 0;
        let mut failed = 0;

        for job in self.db().get_assigned_jobs().await? {
            info!(job_id = job.job_id, worker_id = job.worker_id, ip = %job.worker_ip, "Pushing job to worker");

            match self.push_job(&job).await {
                Ok(()) => {
                    self.orchestrator.metrics().record_push(true);
                    self.db()
                        .update_job_status(job.job_id, JobStatus::Running, None)
                        .await?;
                    info!(job_id = job.job_id, worker_id = job.worker_id, "Job pushed, now running");
                    pushed += 1;
                }
                Err(e) => {
                    self.orchestrator.metrics().record_push(false);
                    warn!(job_id = job.job_id, worker_id = job.worker_id, error = %e, "Failed to push job");
                    self.db().increment_job_retry(job.job_id).await?;
                    failed += 1;
                }
            }
        }

        Ok((pushed, failed))
    }

    async fn push_job(&self, job: &AssignedJob) -> Result<(), PushError> {
        let mut config = job.config.clone();
        if let Some(map) = config.as_object_mut() {
            map.insert("job_id".to_string(), serde_json::Value::from(job.job_id));
        }

        let package_config = config.clone();
        let package =
            tokio::task::spawn_blocking(move || JobPackage::build(&package_config)).await??;

        self.transport
            .push_job(&job.worker_ip, job.job_id, &config, package.bytes())
            .await?;
        Ok(())
    }
}

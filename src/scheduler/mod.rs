//! Job scheduling and worker allocation.
//!
//! This module decides which job runs where and keeps that decision correct
//! as workers come and go:
//!
//! - **JobScheduler**: pulls the queue head and places it on a worker
//! - **allocation**: resource filtering, load scoring and strategies
//! - **WorkerHealthMonitor**: marks silent workers offline, recovers their jobs
//! - **DeadlineEnforcer**: fails jobs past their deadline
//! - **SchedulerOrchestrator**: runs the three passes in order as one cycle
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────┐
//!                 │ SchedulerOrchestrator │
//!                 └───────────┬───────────┘
//!                             │ run_cycle()
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!   ┌───────────┐      ┌─────────────┐      ┌──────────────┐
//!   │  Health   │ ───▶ │  Deadlines  │ ───▶ │ JobScheduler │
//!   └─────┬─────┘      └──────┬──────┘      └──────┬───────┘
//!         │                   │                    │
//!         └───────────────────┼────────────────────┘
//!                             ▼
//!                      ┌─────────────┐
//!                      │  Database   │
//!                      └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fuzz_scheduler::config::SchedulerConfig;
//! use fuzz_scheduler::scheduler::SchedulerOrchestrator;
//! use fuzz_scheduler::storage::Database;
//!
//! let db = Arc::new(Database::connect("scheduler.db").await?);
//! let orchestrator = SchedulerOrchestrator::new(db, &SchedulerConfig::default())?;
//!
//! let stats = orchestrator.run_cycle().await?;
//! println!("scheduled {} jobs", stats.scheduled_jobs);
//! ```

pub mod allocation;
pub mod deadline;
pub mod engine;
pub mod health;
pub mod job;
pub mod orchestrator;
pub mod worker;

// Re-export main types for convenience
pub use allocation::{AllocationOutcome, AllocationStrategy, ParseStrategyError};
pub use deadline::{DeadlineEnforcer, MISSED_DEADLINE};
pub use engine::{JobScheduler, SchedulingReport, StopReason};
pub use health::{HealthReport, WorkerHealthMonitor, DEFAULT_HEARTBEAT_TIMEOUT};
pub use job::{
    AssignedJob, HistoryEntry, Job, JobStatus, NewJob, OrphanedJob, OverdueJob, QueuedJob,
    ResourceRequirements, RetryOutcome,
};
pub use orchestrator::{CycleStats, SchedulerOrchestrator, SchedulerStatus};
pub use worker::{Capabilities, CurrentLoad, Worker, WorkerRegistration, WorkerStatus};

//! fuzz_scheduler: distributed scheduling of fuzzing jobs across remote workers.
//!
//! This library keeps a priority job queue with dependencies, deadlines,
//! retries and resource requirements in SQLite, places jobs on workers by
//! load, recovers jobs from workers that stop heartbeating, and drives the
//! workers over a small framed TCP protocol.

// Core modules
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ControllerConfig, SchedulerConfig};
pub use error::{ConfigError, SchedulerError};
pub use scheduler::{AllocationStrategy, Job, JobStatus, NewJob, SchedulerOrchestrator, Worker};
pub use storage::{Database, DatabaseError};

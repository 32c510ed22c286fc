//! SQLite persistent storage for the scheduler.
//!
//! This module is the single source of truth for workers, jobs, the job
//! queue, assignments, execution history and crash records.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: SQLite client with one transaction per logical operation
//! - **Workers**: registry, heartbeats and liveness
//! - **Crashes**: crash reports attached to jobs
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use fuzz_scheduler::scheduler::{NewJob, WorkerRegistration};
//! use fuzz_scheduler::storage::Database;
//!
//! let db = Database::connect("scheduler.db").await?;
//!
//! let worker_id = db.register_worker(WorkerRegistration::new("10.0.0.5")).await?;
//! let job_id = db
//!     .add_job(NewJob::new("libpng-afl", serde_json::json!({"fuzzer": "afl"})))
//!     .await?;
//!
//! if let Some(next) = db.get_next_job_from_queue().await? {
//!     db.assign_job_to_worker(next.job_id, worker_id).await?;
//! }
//! ```

pub mod crashes;
pub mod database;
pub mod migrations;
pub mod schema;
pub mod workers;

// Re-export main types for convenience
pub use crashes::{Crash, NewCrash};
pub use database::{Database, DatabaseError, DatabaseOptions};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the SQLite scheduler
//! store. Timestamps are integer Unix milliseconds.

/// SQL schema for creating the workers table.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    worker_id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE,
    hostname TEXT,
    status TEXT NOT NULL DEFAULT 'offline',
    cpu_cores REAL NOT NULL DEFAULT 0,
    ram_gb REAL NOT NULL DEFAULT 0,
    max_vms INTEGER NOT NULL DEFAULT 0,
    cpu_usage REAL NOT NULL DEFAULT 0,
    ram_usage REAL NOT NULL DEFAULT 0,
    used_vms INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]',
    heartbeat_interval_secs INTEGER NOT NULL DEFAULT 30,
    last_heartbeat_ms INTEGER,
    registered_ms INTEGER NOT NULL
)
"#;

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    config TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 50,
    deadline_ms INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    dependencies TEXT NOT NULL DEFAULT '[]',
    resource_requirements TEXT,
    assigned_worker_id INTEGER REFERENCES workers(worker_id),
    created_ms INTEGER NOT NULL,
    started_ms INTEGER,
    ended_ms INTEGER,
    error_message TEXT
)
"#;

/// SQL schema for creating the job_queue table.
pub const CREATE_JOB_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_queue (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL UNIQUE REFERENCES jobs(job_id),
    priority INTEGER NOT NULL,
    queued_ms INTEGER NOT NULL
)
"#;

/// SQL schema for creating the job_assignments table.
pub const CREATE_JOB_ASSIGNMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_assignments (
    assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(job_id),
    worker_id INTEGER NOT NULL REFERENCES workers(worker_id),
    assigned_ms INTEGER NOT NULL,
    released_ms INTEGER,
    status TEXT NOT NULL DEFAULT 'active'
)
"#;

/// SQL schema for creating the job_history table.
pub const CREATE_JOB_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_history (
    history_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(job_id),
    worker_id INTEGER REFERENCES workers(worker_id),
    started_ms INTEGER,
    ended_ms INTEGER,
    status TEXT NOT NULL,
    error_message TEXT
)
"#;

/// SQL schema for creating the crashes table.
pub const CREATE_CRASHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS crashes (
    crash_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(job_id),
    worker_id INTEGER REFERENCES workers(worker_id),
    testcase_path TEXT,
    crash_type TEXT,
    details TEXT,
    signature TEXT,
    exploitability TEXT,
    crash_file TEXT,
    timestamp_ms INTEGER NOT NULL,
    duplicate_count INTEGER NOT NULL DEFAULT 0
)
"#;

/// Indexes backing the status scans, the queue head lookup and per-job
/// lookups.
pub const CREATE_INDEXES: [&str; 7] = [
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_assigned_worker ON jobs(assigned_worker_id)",
    "CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status)",
    "CREATE INDEX IF NOT EXISTS idx_queue_priority ON job_queue(priority DESC, queued_ms ASC, queue_id ASC)",
    "CREATE INDEX IF NOT EXISTS idx_assignments_job ON job_assignments(job_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_history_job ON job_history(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_crashes_job ON crashes(job_id)",
];

/// A named schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Every schema step, oldest first. Parents are created before the tables
/// that reference them.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_workers",
        statements: &[CREATE_WORKERS_TABLE],
    },
    Migration {
        version: 2,
        name: "create_jobs",
        statements: &[CREATE_JOBS_TABLE, CREATE_JOB_QUEUE_TABLE],
    },
    Migration {
        version: 3,
        name: "create_job_tracking",
        statements: &[CREATE_JOB_ASSIGNMENTS_TABLE, CREATE_JOB_HISTORY_TABLE],
    },
    Migration {
        version: 4,
        name: "create_crashes",
        statements: &[CREATE_CRASHES_TABLE],
    },
    Migration {
        version: 5,
        name: "create_indexes",
        statements: &CREATE_INDEXES,
    },
];

/// Highest schema version this build knows.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

//! Job definitions for the scheduler.
//!
//! This module defines the job-side records the scheduler works with:
//!
//! - `NewJob`: a submission, before the store assigns an ID
//! - `Job`: a persisted job row
//! - `JobStatus`: the job state machine
//! - `ResourceRequirements`: per-dimension capacity a job needs on a worker
//! - `QueuedJob`, `AssignedJob`, `OrphanedJob`, `OverdueJob`: projections used
//!   by the scheduling components
//! - `HistoryEntry`: one recorded execution attempt

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum number of attempts before a job is terminally failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default priority for jobs (middle of the 0-100 band).
pub const DEFAULT_PRIORITY: u8 = 50;

/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 100;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue, or blocked on dependencies.
    Pending,
    /// Claimed by a worker, push not yet confirmed.
    Assigned,
    /// Running on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed terminally (retries exhausted, deadline, dependency, worker report).
    Failed,
    /// Cancelled externally.
    Cancelled,
}

impl JobStatus {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether a job in this state is held by a worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// Capacity a job needs on a worker.
///
/// Each dimension is checked independently against the worker's remaining
/// capacity. A dimension left as `None` imposes no filter. A non-empty `tags`
/// list restricts candidates to workers carrying at least one of the tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// RAM in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<f64>,
    /// VM slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vms: Option<u32>,
    /// Worker tag affinity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ResourceRequirements {
    /// Creates an empty requirement set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CPU requirement.
    pub fn with_cpu(mut self, cores: f64) -> Self {
        self.cpu = Some(cores);
        self
    }

    /// Sets the RAM requirement.
    pub fn with_ram(mut self, gb: f64) -> Self {
        self.ram = Some(gb);
        self
    }

    /// Sets the VM slot requirement.
    pub fn with_vms(mut self, vms: u32) -> Self {
        self.vms = Some(vms);
        self
    }

    /// Adds a tag to the affinity list.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Returns whether no dimension and no tag is declared.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.ram.is_none() && self.vms.is_none() && self.tags.is_empty()
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Human-readable name.
    pub name: String,
    /// Fuzzer-specific payload, passed through to the worker untouched.
    pub config: serde_json::Value,
    /// Priority (0-100, higher is more urgent).
    pub priority: u8,
    /// Absolute deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Jobs that must complete before this one is queued.
    pub dependencies: Vec<i64>,
    /// Capacity needed on a worker.
    pub resource_requirements: Option<ResourceRequirements>,
    /// Attempts allowed before the job is terminally failed.
    pub max_retries: u32,
}

impl NewJob {
    /// Creates a submission with default priority and retry budget.
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
            priority: DEFAULT_PRIORITY,
            deadline: None,
            dependencies: Vec::new(),
            resource_requirements: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, dependencies: Vec<i64>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the resource requirements.
    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.resource_requirements = Some(requirements);
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<i64>,
    pub resource_requirements: Option<ResourceRequirements>,
    pub assigned_worker_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Returns the number of requeues still allowed.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// Head-of-queue view of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: i64,
    pub name: String,
    pub priority: u8,
    pub resource_requirements: Option<ResourceRequirements>,
    pub queued_at: DateTime<Utc>,
}

/// An `assigned` job together with the worker address it must be pushed to.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedJob {
    pub job_id: i64,
    pub name: String,
    pub config: serde_json::Value,
    pub worker_id: i64,
    pub worker_ip: String,
}

/// An in-flight job whose worker has gone offline.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedJob {
    pub job_id: i64,
    pub name: String,
    pub worker_id: i64,
}

/// A non-terminal job past its deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct OverdueJob {
    pub job_id: i64,
    pub name: String,
    pub deadline: DateTime<Utc>,
}

/// Result of `increment_job_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job went back to the queue.
    Requeued { retry_count: u32 },
    /// The retry budget is spent and the job is now failed.
    Exhausted { max_retries: u32 },
}

impl RetryOutcome {
    /// Returns whether the job was requeued.
    pub fn is_requeued(&self) -> bool {
        matches!(self, RetryOutcome::Requeued { .. })
    }
}

/// One recorded execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub job_id: i64,
    pub worker_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub error_message: Option<String>,
}

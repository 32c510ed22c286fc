//! Worker selection: resource filtering, load scoring and allocation
//! strategies.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::ResourceRequirements;
use super::worker::Worker;

/// Weight of VM slot utilization in the load score.
pub const VM_WEIGHT: f64 = 0.6;
/// Weight of CPU utilization in the load score.
pub const CPU_WEIGHT: f64 = 0.3;
/// Weight of RAM utilization in the load score.
pub const RAM_WEIGHT: f64 = 0.1;

/// How a worker is chosen among the candidates that fit a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest weighted utilization wins.
    #[default]
    LoadAware,
    /// First candidate in worker ID order.
    FirstFit,
    /// Rotates through the candidate list across allocations.
    RoundRobin,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::LoadAware => "load_aware",
            AllocationStrategy::FirstFit => "first_fit",
            AllocationStrategy::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown strategy name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown allocation strategy '{0}' (expected load_aware, first_fit or round_robin)")]
pub struct ParseStrategyError(pub String);

impl FromStr for AllocationStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "load_aware" => Ok(AllocationStrategy::LoadAware),
            "first_fit" => Ok(AllocationStrategy::FirstFit),
            "round_robin" => Ok(AllocationStrategy::RoundRobin),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

/// Outcome of one allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// No online worker (after tag filtering).
    NoWorkersOnline,
    /// Workers are online but none has enough free capacity.
    NoCapacity,
    /// The job was committed to the worker.
    Assigned { worker_id: i64 },
    /// A worker was chosen but the claim failed, e.g. the job left the queue
    /// or the worker went offline in between.
    Lost { worker_id: i64 },
}

impl AllocationOutcome {
    /// Returns the assigned worker, if any.
    pub fn worker_id(&self) -> Option<i64> {
        match self {
            AllocationOutcome::Assigned { worker_id } => Some(*worker_id),
            _ => None,
        }
    }
}

/// Returns whether the worker's free capacity covers every declared
/// dimension. Tags are not checked here; they filter the candidate list
/// before capacity is considered.
pub fn satisfies(worker: &Worker, requirements: Option<&ResourceRequirements>) -> bool {
    requirements.map_or(true, |req| worker.fits(req))
}

fn ratio(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        used / total
    } else {
        0.0
    }
}

/// Weighted utilization of a worker, reservations included. Lower is less
/// loaded.
pub fn load_score(worker: &Worker) -> f64 {
    let caps = &worker.capabilities;
    let load = worker.effective_load();

    VM_WEIGHT * ratio(f64::from(load.used_vms), f64::from(caps.max_vms))
        + CPU_WEIGHT * ratio(load.cpu_usage, caps.cpu_cores)
        + RAM_WEIGHT * ratio(load.ram_usage, caps.ram_gb)
}

/// Picks a worker from `candidates` according to `strategy`.
///
/// `cursor` is the rotating position used by [`AllocationStrategy::RoundRobin`];
/// other strategies leave it untouched.
pub fn select<'a>(
    strategy: AllocationStrategy,
    candidates: &'a [Worker],
    cursor: &AtomicUsize,
) -> Option<&'a Worker> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        AllocationStrategy::FirstFit => candidates.first(),
        AllocationStrategy::RoundRobin => {
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            candidates.get(idx)
        }
        AllocationStrategy::LoadAware => {
            let mut best: Option<(&Worker, f64)> = None;
            for worker in candidates {
                let score = load_score(worker);
                // Strict comparison: the first listed worker wins ties.
                if best.map_or(true, |(_, s)| score < s) {
                    best = Some((worker, score));
                }
            }
            best.map(|(w, _)| w)
        }
    }
}

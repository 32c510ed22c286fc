//! Worker definitions.
//!
//! Capabilities are declared once at registration; load is refreshed by every
//! heartbeat. The scheduler only ever reads either. Jobs committed to a worker
//! but not yet started are not in its reported load yet, so they are carried
//! separately as a reservation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::ResourceRequirements;

/// Default heartbeat interval advertised by a worker.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(WorkerStatus::Online),
            "offline" => Ok(WorkerStatus::Offline),
            other => Err(format!("unknown worker status '{}'", other)),
        }
    }
}

/// Static capacity of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub ram_gb: f64,
    #[serde(default)]
    pub max_vms: u32,
}

impl Capabilities {
    pub fn new(cpu_cores: f64, ram_gb: f64, max_vms: u32) -> Self {
        Self {
            cpu_cores,
            ram_gb,
            max_vms,
        }
    }
}

/// Volatile load reported with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentLoad {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub ram_usage: f64,
    #[serde(default)]
    pub used_vms: u32,
}

impl CurrentLoad {
    pub fn new(cpu_usage: f64, ram_usage: f64, used_vms: u32) -> Self {
        Self {
            cpu_usage,
            ram_usage,
            used_vms,
        }
    }

    /// Adds the declared dimensions of `requirements`.
    pub fn add_requirements(&mut self, requirements: &ResourceRequirements) {
        self.cpu_usage += requirements.cpu.unwrap_or(0.0);
        self.ram_usage += requirements.ram.unwrap_or(0.0);
        self.used_vms = self.used_vms.saturating_add(requirements.vms.unwrap_or(0));
    }

    fn combined(&self, other: &CurrentLoad) -> CurrentLoad {
        CurrentLoad {
            cpu_usage: self.cpu_usage + other.cpu_usage,
            ram_usage: self.ram_usage + other.ram_usage,
            used_vms: self.used_vms.saturating_add(other.used_vms),
        }
    }
}

/// Registration request for a worker, keyed by IP address.
///
/// Fields left as `None` keep their stored value when an existing worker
/// re-registers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRegistration {
    pub ip_address: String,
    pub hostname: Option<String>,
    pub capabilities: Option<Capabilities>,
    pub tags: Option<Vec<String>>,
    pub heartbeat_interval: Option<Duration>,
}

impl WorkerRegistration {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            hostname: None,
            capabilities: None,
            tags: None,
            heartbeat_interval: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

/// A persisted worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Worker {
    pub id: i64,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub status: WorkerStatus,
    pub capabilities: Capabilities,
    pub current_load: CurrentLoad,
    /// Declared requirements of jobs assigned here that have not started.
    /// Only filled in by reads that feed allocation.
    pub reserved: CurrentLoad,
    pub tags: Vec<String>,
    pub heartbeat_interval: Duration,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Reported load plus reservations.
    pub fn effective_load(&self) -> CurrentLoad {
        self.current_load.combined(&self.reserved)
    }

    /// Remaining CPU cores. Negative when the worker is over-committed.
    pub fn free_cpu(&self) -> f64 {
        self.capabilities.cpu_cores - self.effective_load().cpu_usage
    }

    /// Remaining RAM in GB.
    pub fn free_ram(&self) -> f64 {
        self.capabilities.ram_gb - self.effective_load().ram_usage
    }

    /// Remaining VM slots.
    pub fn free_vms(&self) -> i64 {
        i64::from(self.capabilities.max_vms) - i64::from(self.effective_load().used_vms)
    }

    /// Returns whether free capacity covers every declared dimension of
    /// `requirements`. Tags are not considered.
    pub fn fits(&self, requirements: &ResourceRequirements) -> bool {
        requirements.cpu.map_or(true, |cpu| self.free_cpu() >= cpu)
            && requirements.ram.map_or(true, |ram| self.free_ram() >= ram)
            && requirements
                .vms
                .map_or(true, |vms| self.free_vms() >= i64::from(vms))
    }

    /// Returns whether the worker carries at least one of `tags`.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

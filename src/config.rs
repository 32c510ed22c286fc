//! Controller configuration.
//!
//! Configuration is read from a YAML file. Every field has a default, so an
//! empty file (or no file at all) yields a runnable controller with no
//! preconfigured workers.
//!
//! ```yaml
//! db_path: /var/lib/fuzz-scheduler/scheduler.db
//! poll_interval_secs: 30
//! worker_port: 9999
//! scheduler:
//!   allocation_strategy: load_aware
//!   heartbeat_timeout_secs: 90
//!   max_jobs_per_cycle: 100
//! workers:
//!   - 10.0.0.5
//!   - ip: 10.0.0.6
//!     hostname: fuzz-06
//!     capabilities: { cpu_cores: 16, ram_gb: 64, max_vms: 8 }
//!     tags: [kvm, x86_64]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::scheduler::allocation::AllocationStrategy;
use crate::scheduler::job::DEFAULT_MAX_RETRIES;
use crate::scheduler::worker::{Capabilities, WorkerRegistration};

/// Default port workers listen on.
pub const DEFAULT_WORKER_PORT: u16 = 9999;

/// Settings for the scheduling components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Strategy used to pick among workers that fit a job.
    pub allocation_strategy: AllocationStrategy,
    /// Seconds without a heartbeat before a worker is marked offline.
    pub heartbeat_timeout_secs: u64,
    /// Upper bound on allocation attempts per scheduling pass.
    pub max_jobs_per_cycle: usize,
    /// Retry budget for jobs submitted without one.
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allocation_strategy: AllocationStrategy::LoadAware,
            heartbeat_timeout_secs: 90,
            max_jobs_per_cycle: 100,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Detailed worker entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// A worker listed in the configuration: either a bare IP address or a
/// detailed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerEntry {
    Address(String),
    Detailed(WorkerSpec),
}

impl WorkerEntry {
    pub fn ip(&self) -> &str {
        match self {
            WorkerEntry::Address(ip) => ip,
            WorkerEntry::Detailed(spec) => &spec.ip,
        }
    }

    /// Builds the registration request for this entry.
    pub fn registration(&self) -> WorkerRegistration {
        match self {
            WorkerEntry::Address(ip) => WorkerRegistration::new(ip.as_str()),
            WorkerEntry::Detailed(spec) => WorkerRegistration {
                ip_address: spec.ip.clone(),
                hostname: spec.hostname.clone(),
                capabilities: spec.capabilities,
                tags: spec.tags.clone(),
                heartbeat_interval: None,
            },
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Seconds between controller iterations.
    pub poll_interval_secs: u64,
    /// TCP port workers listen on.
    pub worker_port: u16,
    /// Timeout for a job push, in seconds.
    pub push_timeout_secs: u64,
    /// Timeout for status and crash requests, in seconds.
    pub request_timeout_secs: u64,
    pub scheduler: SchedulerConfig,
    /// Workers registered on startup.
    pub workers: Vec<WorkerEntry>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("scheduler.db"),
            poll_interval_secs: 30,
            worker_port: DEFAULT_WORKER_PORT,
            push_timeout_secs: 10,
            request_timeout_secs: 5,
            scheduler: SchedulerConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parses and validates YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// The heartbeat timeout must exceed the poll interval: workers are only
    /// heard from once per iteration, so a shorter timeout would flap every
    /// worker offline between polls.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.max_jobs_per_cycle == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_jobs_per_cycle must be positive".to_string(),
            ));
        }
        if self.scheduler.heartbeat_timeout_secs <= self.poll_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "scheduler.heartbeat_timeout_secs ({}) must exceed poll_interval_secs ({})",
                self.scheduler.heartbeat_timeout_secs, self.poll_interval_secs
            )));
        }
        if self.scheduler.heartbeat_timeout_secs < 2 * self.poll_interval_secs {
            warn!(
                heartbeat_timeout_secs = self.scheduler.heartbeat_timeout_secs,
                poll_interval_secs = self.poll_interval_secs,
                "Heartbeat timeout is less than two poll intervals, workers may flap offline"
            );
        }
        if let Some(entry) = self.workers.iter().find(|w| w.ip().trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "worker entry has an empty IP address: {:?}",
                entry
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = ControllerConfig::from_yaml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.worker_port, 9999);
        assert_eq!(config.scheduler.heartbeat_timeout_secs, 90);
        assert_eq!(config.scheduler.allocation_strategy, AllocationStrategy::LoadAware);
    }

    #[test]
    fn test_worker_entries_accept_both_forms() {
        let yaml = r#"
workers:
  - 10.0.0.5
  - ip: 10.0.0.6
    hostname: fuzz-06
    capabilities: { cpu_cores: 16, ram_gb: 64, max_vms: 8 }
    tags: [kvm]
"#;
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0], WorkerEntry::Address("10.0.0.5".to_string()));

        let reg = config.workers[1].registration();
        assert_eq!(reg.ip_address, "10.0.0.6");
        assert_eq!(reg.hostname.as_deref(), Some("fuzz-06"));
        assert_eq!(reg.capabilities.map(|c| c.max_vms), Some(8));
        assert_eq!(reg.tags, Some(vec!["kvm".to_string()]));
    }

    #[test]
    fn test_strategy_and_overrides() {
        let yaml = "poll_interval_secs: 10\nscheduler:\n  allocation_strategy: round_robin\n  heartbeat_timeout_secs: 45\n";
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.scheduler.allocation_strategy, AllocationStrategy::RoundRobin);
        assert_eq!(config.scheduler.max_jobs_per_cycle, 100);
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let err = ControllerConfig::from_yaml_str("scheduler:\n  allocation_strategy: best_fit\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_rejects_timeout_not_above_poll_interval() {
        let err = ControllerConfig::from_yaml_str(
            "poll_interval_secs: 60\nscheduler:\n  heartbeat_timeout_secs: 60\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must exceed poll_interval_secs"));

        let err = ControllerConfig::from_yaml_str("scheduler:\n  max_jobs_per_cycle: 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}

//! Engine configuration: intervals, behavior flags, timeouts, and the worker
//! pool layout, loaded from TOML with compiled-in defaults for every field.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::errors::{FmError, Result};
use crate::objects::ServiceState;

/// A specialized worker pool bound to one command name.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecializedPool {
    /// Command name (first whitespace-delimited token of the command line).
    pub command: String,
    /// Number of workers to keep alive for it.
    pub count: usize,
}

/// Global engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Master switch for active host checks.
    pub execute_host_checks: bool,
    /// Master switch for active service checks.
    pub execute_service_checks: bool,
    /// Master switch for passive host results.
    pub accept_passive_host_checks: bool,
    /// Master switch for passive service results.
    pub accept_passive_service_checks: bool,

    /// Reuse a host state this recent instead of re-checking (seconds).
    pub cached_host_check_horizon_s: u64,
    /// Reuse a service state this recent instead of re-checking (seconds).
    pub cached_service_check_horizon_s: u64,

    /// Probe dependency masters one attempt before a host goes hard.
    pub enable_predictive_host_dependency_checks: bool,
    /// Probe dependency masters one attempt before a service goes hard.
    pub enable_predictive_service_dependency_checks: bool,
    /// Evaluate dependencies against soft states instead of last hard states.
    pub soft_state_dependencies: bool,

    /// Treat a WARNING return from a host check as DOWN instead of UP.
    pub use_aggressive_host_checking: bool,
    /// Passive host results enter the soft/hard machine instead of going
    /// straight to hard.
    pub passive_host_checks_are_soft: bool,
    /// Write passive results to the event log.
    pub log_passive_checks: bool,

    /// Run the host freshness sweep.
    pub check_host_freshness: bool,
    /// Run the service freshness sweep.
    pub check_service_freshness: bool,
    /// Seconds between host freshness sweeps.
    pub host_freshness_check_interval_s: u64,
    /// Seconds between service freshness sweeps.
    pub service_freshness_check_interval_s: u64,
    /// Slack added to derived freshness thresholds (seconds).
    pub additional_freshness_latency_s: u64,

    /// Recover hosts whose in-flight check never came back.
    pub check_orphaned_hosts: bool,
    /// Recover services whose in-flight check never came back.
    pub check_orphaned_services: bool,
    /// Seconds between orphan sweeps.
    pub orphan_check_interval_s: u64,
    /// Result-ingestion cadence term in the orphan window (seconds).
    pub check_reaper_interval_s: u64,

    /// Kill host checks after this many seconds.
    pub host_check_timeout_s: u64,
    /// Kill service checks after this many seconds.
    pub service_check_timeout_s: u64,
    /// State a timed-out service check reports.
    pub service_check_timeout_state: ServiceState,

    /// Cap on concurrently executing service checks; 0 means unlimited.
    pub max_parallel_service_checks: u32,

    /// Master switch for flap detection.
    pub enable_flap_detection: bool,
    /// Stop flapping below this weighted percent state change.
    pub low_flap_threshold_pct: f64,
    /// Start flapping above this weighted percent state change.
    pub high_flap_threshold_pct: f64,

    /// Workers in the default pool.
    pub worker_count: usize,
    /// Concurrent jobs per worker process.
    pub worker_max_jobs: usize,
    /// Extra pools bound to specific command names.
    pub specialized_workers: Vec<SpecializedPool>,

    /// JSONL event log path; `None` disables the log.
    pub event_log_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execute_host_checks: true,
            execute_service_checks: true,
            accept_passive_host_checks: true,
            accept_passive_service_checks: true,
            cached_host_check_horizon_s: 15,
            cached_service_check_horizon_s: 15,
            enable_predictive_host_dependency_checks: true,
            enable_predictive_service_dependency_checks: true,
            soft_state_dependencies: false,
            use_aggressive_host_checking: false,
            passive_host_checks_are_soft: false,
            log_passive_checks: true,
            check_host_freshness: false,
            check_service_freshness: true,
            host_freshness_check_interval_s: 60,
            service_freshness_check_interval_s: 60,
            additional_freshness_latency_s: 15,
            check_orphaned_hosts: true,
            check_orphaned_services: true,
            orphan_check_interval_s: 60,
            check_reaper_interval_s: 10,
            host_check_timeout_s: 30,
            service_check_timeout_s: 60,
            service_check_timeout_state: ServiceState::Critical,
            max_parallel_service_checks: 0,
            enable_flap_detection: false,
            low_flap_threshold_pct: 20.0,
            high_flap_threshold_pct: 30.0,
            worker_count: 4,
            worker_max_jobs: 64,
            specialized_workers: Vec::new(),
            event_log_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FmError::MissingConfig {
                    path: path.to_path_buf(),
                }
            } else {
                FmError::io(path, e)
            }
        })?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(FmError::InvalidConfig {
                details: "worker_count must be at least 1".to_string(),
            });
        }
        if self.high_flap_threshold_pct < self.low_flap_threshold_pct {
            return Err(FmError::InvalidConfig {
                details: "high_flap_threshold_pct must be >= low_flap_threshold_pct".to_string(),
            });
        }
        for p in &self.specialized_workers {
            if p.count == 0 {
                return Err(FmError::InvalidConfig {
                    details: format!("specialized pool '{}' has zero workers", p.command),
                });
            }
        }
        Ok(())
    }
}

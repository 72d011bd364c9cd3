// src/process/resource_limiter.rs
//! Advisory resource limits for worker processes
//!
//! Limits are never enforced by the kernel here. The health loop samples
//! worker RSS and reports pools that run over their aggregate budget.
//!
//! - CPU usage (percentage of one core, per worker)
//! - Memory consumption (MB per worker)
//! - Disk usage (MB per worker)

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Resource limits for one worker process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Percent of one core; 150 means one and a half cores
    pub cpu_quota: Option<u32>,

    /// Resident memory budget, MB
    pub memory_limit_mb: Option<u64>,

    /// Disk limit in megabytes
    pub disk_limit_mb: Option<u64>,
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Reject quotas that can never be met
    pub fn validate(&self) -> Result<()> {
        if let Some(quota) = self.cpu_quota {
            if quota == 0 {
                return Err(EngineError::ConfigError("CPU quota cannot be 0".into()));
            }
            if quota > 400 {
                return Err(EngineError::ConfigError(
                    "CPU quota cannot exceed 400% (4 cores)".into(),
                ));
            }
        }

        if let Some(memory) = self.memory_limit_mb {
            if memory < 16 {
                return Err(EngineError::ConfigError(
                    "Memory limit cannot be less than 16MB".into(),
                ));
            }
        }

        if self.disk_limit_mb == Some(0) {
            return Err(EngineError::ConfigError("Disk limit cannot be 0".into()));
        }

        Ok(())
    }
}

/// Checks sampled usage of a whole pool against per-worker limits
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Calculate aggregate limits for a pool of `num_workers`
    pub fn aggregate_limits(&self, num_workers: usize) -> ResourceLimits {
        let mut aggregate = self.limits.clone();

        // Memory and disk scale with the fleet; CPU quota stays per-process
        if let Some(memory) = aggregate.memory_limit_mb {
            aggregate.memory_limit_mb = Some(memory * num_workers as u64);
        }
        if let Some(disk) = aggregate.disk_limit_mb {
            aggregate.disk_limit_mb = Some(disk * num_workers as u64);
        }

        aggregate
    }

    /// Returns a description of the violated budget, if any
    pub fn check_memory(&self, rss_bytes: u64, num_workers: usize) -> Option<String> {
        let budget_mb = self.aggregate_limits(num_workers).memory_limit_mb?;
        let used_mb = rss_bytes / (1024 * 1024);
        if used_mb > budget_mb {
            Some(format!(
                "workers use {}MB, above the advisory budget of {}MB",
                used_mb, budget_mb
            ))
        } else {
            None
        }
    }
}

/// Resident set size of a process in bytes
#[cfg(target_os = "linux")]
pub fn process_rss_bytes(pid: u32) -> Option<u64> {
    let pid = i32::try_from(pid).ok()?;
    let statm = procfs::process::Process::new(pid).ok()?.statm().ok()?;
    Some(statm.resident * procfs::page_size())
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

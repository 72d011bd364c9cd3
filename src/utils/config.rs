// src/utils/config.rs
//! Engine and pool configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. `procfleet.{yaml,toml,json}` in the working directory (optional), or the
//!    file named by `PROCFLEET_CONFIG`
//! 2. `PROCFLEET__*` environment variables (`PROCFLEET__MANAGER__EVENT_HISTORY_SIZE=500`)
//!
//! Every field has a default, so an empty file is a valid engine config with
//! no pools.

use crate::process::resource_limiter::ResourceLimits;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "PROCFLEET_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub manager: ManagerConfig,
    pub observability: ObservabilityConfig,
    /// Pools created at startup
    pub pools: Vec<PoolConfig>,
}

impl EngineConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => config::File::from(PathBuf::from(path)).required(true),
            Err(_) => config::File::with_name("procfleet").required(false),
        };
        Self::from_sources(file)
    }

    /// Load from an explicit file plus the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_sources(config::File::from(path.as_ref()).required(true))
    }

    fn from_sources<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let engine: EngineConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("PROCFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        engine.validate()?;
        Ok(engine)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.event_history_size == 0 {
            return Err(EngineError::ConfigError(
                "manager.event_history_size must be at least 1".into(),
            ));
        }
        if self.manager.event_channel_capacity == 0 {
            return Err(EngineError::ConfigError(
                "manager.event_channel_capacity must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.id.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "duplicate pool id '{}'",
                    pool.id
                )));
            }
        }
        Ok(())
    }
}

/// Pool manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Events retained for the global view
    pub event_history_size: usize,

    /// Capacity of every broadcast channel (pool and manager)
    pub event_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            event_history_size: 1000,
            event_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Filter used when `RUST_LOG` is not set
    pub log_level: String,
    pub log_format: LogFormat,
    /// Prometheus listener, e.g. `0.0.0.0:9100`; disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

/// Scaling policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStrategy {
    /// Pool size never changes after start
    Fixed,
    #[default]
    Dynamic,
    OnDemand,
    Scheduled,
}

/// Rule for choosing the idle worker that receives the next task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    LeastBusy,
    Weighted,
    Random,
}

/// How to launch one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,

    /// Execution timeout applied to each task unless the task sets its own
    pub task_timeout_ms: Option<u64>,

    /// Retry count applied to tasks that don't set their own
    pub retries: u32,

    /// Time a fresh worker must stay alive before it counts as ready
    pub startup_grace_ms: u64,

    /// Upper bound on launch plus readiness
    pub startup_timeout_ms: u64,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            task_timeout_ms: None,
            retries: 0,
            startup_grace_ms: 100,
            startup_timeout_ms: 10_000,
        }
    }
}

impl WorkerSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub strategy: ScalingStrategy,
    /// Utilization at or above which the pool grows
    pub scale_up_threshold: f64,
    /// Utilization at or below which the pool shrinks
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,
    /// Tick of the scale-check loop
    pub check_interval_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            strategy: ScalingStrategy::Dynamic,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_cooldown_ms: 30_000,
            scale_down_cooldown_ms: 60_000,
            check_interval_ms: 5_000,
        }
    }
}

impl ScalingConfig {
    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_up_cooldown_ms)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_down_cooldown_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub algorithm: LoadBalancingAlgorithm,
    /// Weights by worker slot; slots past the end weigh 1
    pub weights: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    /// Idle workers above `min_workers` are retired after this long
    pub worker_idle_timeout_ms: u64,
    /// Consecutive failures tolerated before a forced restart
    pub worker_max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            worker_idle_timeout_ms: 300_000,
            worker_max_failures: 3,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPolicy {
    /// Bound for `wait_for_task`
    pub task_timeout_ms: u64,
    /// Delay before a failed task with retries left is queued again
    pub retry_delay_ms: u64,
    pub max_queue_size: usize,
    /// Dispatch loop sleep when the queue is empty
    pub dispatch_idle_ms: u64,
    /// Dispatch loop sleep when no worker is idle
    pub dispatch_backoff_ms: u64,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            task_timeout_ms: 300_000,
            retry_delay_ms: 1_000,
            max_queue_size: 1_000,
            dispatch_idle_ms: 50,
            dispatch_backoff_ms: 100,
        }
    }
}

impl TaskPolicy {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dispatch_idle(&self) -> Duration {
        Duration::from_millis(self.dispatch_idle_ms)
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait after the graceful stop signal
    pub graceful_timeout_ms: u64,
    /// Wait after the kill signal
    pub force_kill_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: 5_000,
            force_kill_timeout_ms: 2_000,
        }
    }
}

impl ShutdownConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }
}

/// Advisory only: nothing is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
        }
    }
}

/// Configuration of one worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub id: String,
    pub name: String,
    pub worker: WorkerSpec,
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub scaling: ScalingConfig,
    pub load_balancing: LoadBalancingConfig,
    pub health: HealthConfig,
    pub tasks: TaskPolicy,
    pub resources: ResourceLimits,
    pub shutdown: ShutdownConfig,
    pub persistence: PersistenceConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            worker: WorkerSpec::new(""),
            min_workers: 1,
            max_workers: 4,
            initial_workers: 2,
            scaling: ScalingConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            health: HealthConfig::default(),
            tasks: TaskPolicy::default(),
            resources: ResourceLimits::default(),
            shutdown: ShutdownConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Pool named after its id, launching `command` for every worker
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            worker: WorkerSpec::new(command),
            ..Default::default()
        }
    }

    /// Check the config and clamp `initial_workers` into `[min, max]`
    pub fn validated(mut self) -> Result<Self> {
        self.validate()?;
        self.initial_workers = self
            .initial_workers
            .clamp(self.min_workers, self.max_workers);
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(EngineError::ConfigError(format!("pool '{}': {}", self.id, msg)))
        };

        if self.id.trim().is_empty() {
            return Err(EngineError::ConfigError("pool id cannot be empty".into()));
        }
        if self.worker.command.trim().is_empty() {
            return fail("worker.command cannot be empty".into());
        }
        if self.max_workers == 0 {
            return fail("max_workers must be at least 1".into());
        }
        if self.min_workers > self.max_workers {
            return fail(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }

        let scaling = &self.scaling;
        for (name, value) in [
            ("scale_up_threshold", scaling.scale_up_threshold),
            ("scale_down_threshold", scaling.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("scaling.{} must be within [0, 1], got {}", name, value));
            }
        }
        if scaling.scale_down_threshold > scaling.scale_up_threshold {
            return fail("scaling.scale_down_threshold exceeds scale_up_threshold".into());
        }

        for (name, value) in [
            ("scaling.check_interval_ms", scaling.check_interval_ms),
            ("health.check_interval_ms", self.health.check_interval_ms),
            ("tasks.dispatch_idle_ms", self.tasks.dispatch_idle_ms),
            ("tasks.dispatch_backoff_ms", self.tasks.dispatch_backoff_ms),
            ("worker.startup_timeout_ms", self.worker.startup_timeout_ms),
        ] {
            if value == 0 {
                return fail(format!("{} must be greater than 0", name));
            }
        }

        if self.tasks.max_queue_size == 0 {
            return fail("tasks.max_queue_size must be at least 1".into());
        }

        self.resources.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pool_defaults_are_valid() {
        let config = PoolConfig::new("builds", "worker");
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "builds");
        assert_eq!(config.load_balancing.algorithm, LoadBalancingAlgorithm::RoundRobin);
        assert_eq!(config.scaling.strategy, ScalingStrategy::Dynamic);
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = PoolConfig {
            min_workers: 5,
            max_workers: 2,
            ..PoolConfig::new("p", "worker")
        };
        assert!(matches!(config.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_initial_workers_clamped() {
        let config = PoolConfig {
            min_workers: 2,
            max_workers: 3,
            initial_workers: 10,
            ..PoolConfig::new("p", "worker")
        }
        .validated()
        .unwrap();
        assert_eq!(config.initial_workers, 3);

        let config = PoolConfig {
            min_workers: 2,
            max_workers: 3,
            initial_workers: 0,
            ..PoolConfig::new("p", "worker")
        }
        .validated()
        .unwrap();
        assert_eq!(config.initial_workers, 2);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = PoolConfig::new("p", "worker");
        config.scaling.scale_up_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = PoolConfig::new("p", "  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
manager:
  event_history_size: 50
observability:
  log_format: json
pools:
  - id: render
    worker:
      command: /usr/bin/render-worker
      args: ["--serve"]
    min_workers: 1
    max_workers: 8
    scaling:
      strategy: on_demand
    load_balancing:
      algorithm: least_connections
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.manager.event_history_size, 50);
        assert_eq!(config.manager.event_channel_capacity, 1024);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.pools.len(), 1);

        let pool = &config.pools[0];
        assert_eq!(pool.id, "render");
        assert_eq!(pool.worker.command, "/usr/bin/render-worker");
        assert_eq!(pool.worker.args, vec!["--serve".to_string()]);
        assert_eq!(pool.max_workers, 8);
        assert_eq!(pool.scaling.strategy, ScalingStrategy::OnDemand);
        assert_eq!(pool.load_balancing.algorithm, LoadBalancingAlgorithm::LeastConnections);
        assert_eq!(pool.tasks.max_queue_size, 1_000);
    }

    #[test]
    fn test_duplicate_pool_ids_rejected() {
        let config = EngineConfig {
            pools: vec![PoolConfig::new("a", "w"), PoolConfig::new("a", "w")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

// src/utils/errors.rs
//! Error types for the process-pool engine
//!
//! Each failure class gets its own variant so callers can tell a full queue
//! apart from a pool that is not running, or a spawn failure from a scaling
//! failure.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Pool-manager lifecycle failure (duplicate id, manager not running,
    /// unknown pool on removal, start/stop failure)
    #[error("pool creation failed: {0}")]
    PoolCreationFailed(String),

    /// Worker process launch, readiness, termination or restart failure
    #[error("worker spawn failed: {0}")]
    WorkerSpawnFailed(String),

    /// Submission to a non-running or unknown pool, wait timeout,
    /// no pools available
    #[error("task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// Scaling action could not be applied
    #[error("pool scaling failed: {0}")]
    ScalingFailed(String),

    /// Worker selection failed
    #[error("load balancing failed: {0}")]
    LoadBalancingFailed(String),

    /// Task queue is at capacity
    #[error("task queue is full (max {max_size} tasks)")]
    QueueFull { max_size: usize },

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Configuration sources could not be read or deserialized
    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Tracing or metrics exporter setup failed
    #[error("observability setup failed: {0}")]
    Observability(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for errors the caller may retry later without changing anything
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::QueueFull { .. } | EngineError::WorkerSpawnFailed(_)
        )
    }
}

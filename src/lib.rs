// src/lib.rs
//! Procfleet process-pool engine
//!
//! Runs named pools of long-lived worker processes, queues prioritized
//! shell-style tasks onto them and keeps each pool healthy and sized to its
//! load.
//!
//! # Architecture
//!
//! - **pool**: task queue, load balancer, scaling engine, worker factory,
//!   the per-pool orchestrator and the multi-pool manager
//! - **process**: the executor capability plus process spawning/termination
//!   and advisory resource limits
//! - **observability**: tracing subscriber and Prometheus metrics
//! - **utils**: configuration and errors

pub mod observability;
pub mod pool;
pub mod process;
pub mod utils;

// Re-export commonly used types
pub use pool::manager::{GlobalStatus, PoolManager};
pub use pool::types::{TaskRequest, TaskResult};
pub use pool::worker_pool::WorkerPool;
pub use process::executor::{ProcessExecutor, SystemExecutor};
pub use utils::config::{EngineConfig, PoolConfig};
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

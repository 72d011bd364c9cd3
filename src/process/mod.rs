// src/process/mod.rs
//! Process execution layer
//!
//! - **Executor**: the capability the pool uses to launch workers and run tasks
//! - **Process Manager**: command construction and SIGTERM/SIGKILL shutdown
//! - **Resource Limiter**: advisory per-worker limits and RSS sampling

pub mod executor;
pub mod process_manager;
pub mod resource_limiter;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{ExecutionOutcome, ProcessExecutor, ProcessHandle, SystemExecutor, TaskInvocation};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use resource_limiter::{ResourceLimiter, ResourceLimits};

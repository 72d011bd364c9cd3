// src/process/executor.rs
//! Process execution capability
//!
//! The pool never touches OS processes directly. It goes through a
//! [`ProcessExecutor`], which launches long-lived worker processes, runs one
//! task at a time on behalf of a worker and stops workers again.
//! [`SystemExecutor`] is the real implementation; tests inject their own.

use crate::process::process_manager::{ProcessManager, SpawnConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, warn};

/// Handle to a launched worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Worker id the process was launched for
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// One task run on behalf of a worker
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// What came back from running a task
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Launches, drives and stops worker processes.
///
/// `execute` returns `Ok` for anything the task itself did, including a
/// non-zero exit or a timeout. `Err` means the worker could not run the task
/// at all and counts against the worker's health.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Launch a worker process. Readiness is judged by the caller.
    async fn spawn(&self, worker_id: &str, config: &SpawnConfig) -> Result<ProcessHandle>;

    async fn execute(&self, worker: &ProcessHandle, invocation: TaskInvocation) -> Result<ExecutionOutcome>;

    /// Graceful stop, then force-kill after `graceful`
    async fn terminate(&self, worker: &ProcessHandle, graceful: Duration, force: Duration) -> Result<()>;

    fn is_alive(&self, worker: &ProcessHandle) -> bool;
}

/// Executor backed by real child processes
#[derive(Debug, Default)]
pub struct SystemExecutor {
    manager: ProcessManager,
    /// Long-lived worker children by worker id
    children: DashMap<String, Child>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_count(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn spawn(&self, worker_id: &str, config: &SpawnConfig) -> Result<ProcessHandle> {
        let child = self.manager.spawn(config)?;
        let handle = ProcessHandle {
            id: worker_id.to_string(),
            pid: child.id(),
            command: config.command.clone(),
            started_at: Utc::now(),
        };
        self.children.insert(worker_id.to_string(), child);
        Ok(handle)
    }

    async fn execute(&self, worker: &ProcessHandle, invocation: TaskInvocation) -> Result<ExecutionOutcome> {
        if !self.is_alive(worker) {
            return Err(EngineError::TaskExecutionFailed(format!(
                "worker {} is not running",
                worker.id
            )));
        }

        let config = SpawnConfig {
            command: invocation.command.clone(),
            args: invocation.args.clone(),
            work_dir: invocation.cwd.clone(),
            env_vars: invocation.env.clone(),
            capture_output: true,
        };

        let started = Instant::now();
        let child = match self.manager.spawn(&config) {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecutionOutcome {
                    error: Some(e.to_string()),
                    duration: started.elapsed(),
                    ..Default::default()
                })
            }
        };
        debug!(
            "Worker {} running task {} as PID {:?}",
            worker.id,
            invocation.task_id,
            child.id()
        );

        // Dropping the future on timeout kills the child (kill_on_drop)
        let output = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Ok(ExecutionOutcome {
                        error: Some(format!("task timed out after {:?}", limit)),
                        duration: started.elapsed(),
                        ..Default::default()
                    })
                }
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => {
                let success = output.status.success();
                Ok(ExecutionOutcome {
                    success,
                    exit_code: output.status.code(),
                    stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                    stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
                    error: (!success).then(|| format!("process exited with {}", output.status)),
                    duration: started.elapsed(),
                })
            }
            Err(e) => Ok(ExecutionOutcome {
                error: Some(format!("failed to collect output: {}", e)),
                duration: started.elapsed(),
                ..Default::default()
            }),
        }
    }

    async fn terminate(&self, worker: &ProcessHandle, graceful: Duration, force: Duration) -> Result<()> {
        let Some((_, mut child)) = self.children.remove(&worker.id) else {
            warn!("Worker {} has no tracked process", worker.id);
            return Ok(());
        };
        self.manager.terminate(&mut child, graceful, force).await
    }

    fn is_alive(&self, worker: &ProcessHandle) -> bool {
        match self.children.get_mut(&worker.id) {
            Some(mut child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

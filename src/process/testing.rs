// src/process/testing.rs
//! Scripted executor for deterministic pool tests
//!
//! Task commands drive the behaviour:
//!
//! - `ok`: succeeds, echoes its args on stdout
//! - `fail [message]`: exits with code 1, reporting `message` as the error
//! - `sleep <ms>`: succeeds after sleeping
//! - `error`: the worker cannot run it (executor error)

use crate::process::executor::{ExecutionOutcome, ProcessExecutor, ProcessHandle, TaskInvocation};
use crate::process::process_manager::SpawnConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    alive: DashMap<String, bool>,
    spawns: AtomicUsize,
    terminations: AtomicUsize,
    executions: AtomicUsize,
    /// Number of upcoming spawns that fail
    failing_spawns: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_spawns(&self, count: usize) {
        self.failing_spawns.store(count, Ordering::SeqCst);
    }

    /// Simulate a worker process dying on its own
    pub fn crash(&self, worker_id: &str) {
        self.alive.insert(worker_id.to_string(), false);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessExecutor for ScriptedExecutor {
    async fn spawn(&self, worker_id: &str, config: &SpawnConfig) -> Result<ProcessHandle> {
        let should_fail = self
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EngineError::WorkerSpawnFailed(format!(
                "scripted spawn failure for {}",
                worker_id
            )));
        }

        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.alive.insert(worker_id.to_string(), true);
        Ok(ProcessHandle {
            id: worker_id.to_string(),
            pid: None,
            command: config.command.clone(),
            started_at: Utc::now(),
        })
    }

    async fn execute(&self, worker: &ProcessHandle, invocation: TaskInvocation) -> Result<ExecutionOutcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        match invocation.command.as_str() {
            "ok" => Ok(ExecutionOutcome {
                success: true,
                exit_code: Some(0),
                stdout: Some(invocation.args.join(" ")),
                stderr: Some(String::new()),
                error: None,
                duration: started.elapsed(),
            }),
            "fail" => Ok(ExecutionOutcome {
                success: false,
                exit_code: Some(1),
                stdout: Some(String::new()),
                stderr: Some("scripted failure".to_string()),
                error: Some(if invocation.args.is_empty() {
                    "process exited with code 1".to_string()
                } else {
                    invocation.args.join(" ")
                }),
                duration: started.elapsed(),
            }),
            "sleep" => {
                let ms = invocation
                    .args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ExecutionOutcome {
                    success: true,
                    exit_code: Some(0),
                    duration: started.elapsed(),
                    ..Default::default()
                })
            }
            other => Err(EngineError::TaskExecutionFailed(format!(
                "worker {} cannot run '{}'",
                worker.id, other
            ))),
        }
    }

    async fn terminate(&self, worker: &ProcessHandle, _graceful: Duration, _force: Duration) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.alive.remove(&worker.id);
        Ok(())
    }

    fn is_alive(&self, worker: &ProcessHandle) -> bool {
        self.alive.get(&worker.id).map(|alive| *alive).unwrap_or(false)
    }
}

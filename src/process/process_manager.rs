// src/process/process_manager.rs
//! Process manager for spawning and signalling OS processes
//!
//! Builds `tokio::process::Command`s from a [`SpawnConfig`] and implements
//! the two-phase shutdown used for workers: SIGTERM, wait, then SIGKILL.

use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Configuration for spawning a process
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub env_vars: HashMap<String, String>,
    /// Pipe stdout/stderr back to us instead of discarding them
    pub capture_output: bool,
}

/// Spawns and signals processes
#[derive(Debug, Clone, Default)]
pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        Self
    }

    /// Build the command for a spawn config
    pub fn command(&self, config: &SpawnConfig) -> Command {
        let mut command = Command::new(&config.command);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }
        command.envs(&config.env_vars);

        let output = || {
            if config.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);

        command
    }

    /// Spawn a new process
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        let child = self.command(config).spawn().map_err(|e| {
            EngineError::WorkerSpawnFailed(format!(
                "failed to spawn '{}': {}",
                config.command, e
            ))
        })?;

        debug!("Process '{}' spawned with PID: {:?}", config.command, child.id());
        Ok(child)
    }

    /// Stop a child: SIGTERM, wait `graceful`, then SIGKILL and wait `force`
    pub async fn terminate(&self, child: &mut Child, graceful: Duration, force: Duration) -> Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };

        debug!("Sending SIGTERM to PID {}", pid);
        if let Err(e) = self.signal(pid, Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
        }

        match tokio::time::timeout(graceful, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("PID {} exited with status: {}", pid, status);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Error waiting for PID {}: {}", pid, e),
            Err(_) => debug!("PID {} still alive after {:?}, sending SIGKILL", pid, graceful),
        }

        child.start_kill().map_err(|e| {
            EngineError::WorkerSpawnFailed(format!("failed to kill PID {}: {}", pid, e))
        })?;

        match tokio::time::timeout(force, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(EngineError::WorkerSpawnFailed(format!(
                "failed to reap PID {}: {}",
                pid, e
            ))),
            Err(_) => Err(EngineError::WorkerSpawnFailed(format!(
                "PID {} did not exit after SIGKILL",
                pid
            ))),
        }
    }

    /// Send a signal by PID
    pub fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| EngineError::WorkerSpawnFailed(format!("failed to send {:?}: {}", signal, e)))
    }

    /// Check if a process exists
    pub fn is_running(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

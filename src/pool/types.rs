// src/pool/types.rs
//! Core records shared by the queue, balancer, scaler and pools

use crate::process::executor::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Lifecycle of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One supervised worker process
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    pub id: String,
    pub pool_id: String,
    /// Roster position; kept across restarts
    pub slot: usize,
    pub process: ProcessHandle,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Monotonic twin of `last_activity_at` for idle timeouts
    pub last_activity: Instant,
    pub task_count: u64,
    /// Consecutive executor errors; reset once a task runs
    pub failure_count: u32,
    pub current_task_id: Option<String>,
}

impl WorkerProcess {
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }
}

/// Per-task options supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Execution timeout; falls back to the pool's worker spec
    pub timeout_ms: Option<u64>,
    /// Lower runs first
    pub priority: i32,
    /// Falls back to the pool's worker spec
    pub retries: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A unit of work as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.options.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// A task owned by a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTask {
    pub id: String,
    pub pool_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub options: TaskOptions,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub status: TaskStatus,
    /// Executions so far, retries included
    pub attempts: u32,
}

impl PoolTask {
    pub fn new(id: String, pool_id: String, request: TaskRequest) -> Self {
        Self {
            id,
            pool_id,
            command: request.command,
            args: request.args,
            options: request.options,
            created_at: Utc::now(),
            scheduled_at: None,
            assigned_worker: None,
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }

    pub fn priority(&self) -> i32 {
        self.options.priority
    }
}

/// Final outcome of a task; written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    /// Empty when the task never reached a worker
    pub worker_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl TaskResult {
    pub(crate) fn cancelled(task: &PoolTask) -> Self {
        Self {
            task_id: task.id.clone(),
            worker_id: task.assigned_worker.clone().unwrap_or_default(),
            success: false,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: Some("task cancelled".to_string()),
            duration: Duration::ZERO,
            completed_at: Utc::now(),
            metadata: (!task.options.metadata.is_empty()).then(|| task.options.metadata.clone()),
        }
    }
}

/// Live snapshot of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub name: String,
    pub state: PoolState,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub starting_workers: usize,
    pub stopping_workers: usize,
    pub failed_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub uptime: Duration,
    /// Summed RSS of worker processes, where the OS exposes it
    pub memory_bytes: u64,
}

impl PoolStatus {
    /// busy / total, 0 without workers
    pub fn utilization(&self) -> f64 {
        if self.total_workers == 0 {
            0.0
        } else {
            self.busy_workers as f64 / self.total_workers as f64
        }
    }
}

/// Running totals of one pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    pub total_task_duration: Duration,
    pub average_task_duration_ms: f64,
    /// Completed tasks per second of uptime
    pub throughput_per_sec: f64,
    pub workers_spawned: u64,
    pub workers_terminated: u64,
    pub worker_restarts: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

impl PoolMetrics {
    pub(crate) fn record_result(&mut self, result: &TaskResult) {
        if result.success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_task_duration += result.duration;
        let finished = self.tasks_completed + self.tasks_failed;
        self.average_task_duration_ms =
            self.total_task_duration.as_secs_f64() * 1000.0 / finished as f64;
    }

    /// Fold another pool's totals into this one
    pub fn merge(&mut self, other: &PoolMetrics) {
        self.tasks_submitted += other.tasks_submitted;
        self.tasks_completed += other.tasks_completed;
        self.tasks_failed += other.tasks_failed;
        self.tasks_cancelled += other.tasks_cancelled;
        self.tasks_retried += other.tasks_retried;
        self.total_task_duration += other.total_task_duration;
        self.throughput_per_sec += other.throughput_per_sec;
        self.workers_spawned += other.workers_spawned;
        self.workers_terminated += other.workers_terminated;
        self.worker_restarts += other.worker_restarts;
        self.scale_ups += other.scale_ups;
        self.scale_downs += other.scale_downs;

        let finished = self.tasks_completed + self.tasks_failed;
        self.average_task_duration_ms = if finished == 0 {
            0.0
        } else {
            self.total_task_duration.as_secs_f64() * 1000.0 / finished as f64
        };
    }
}

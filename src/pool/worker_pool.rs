// src/pool/worker_pool.rs
//! Worker pool orchestrator
//!
//! Owns the task queue, the worker roster, the load balancer and the scaling
//! engine, and runs three background loops per pool:
//!
//! ```text
//!   submit_task ──► TaskQueue ──► dispatch loop ──► LoadBalancer ──► worker
//!                                                                     │
//!   results / events ◄── finish_task ◄── ProcessExecutor::execute ◄───┘
//!
//!   health loop: restart failed/dead workers, retire idle ones, heal to min
//!   scale loop:  ScalingEngine::evaluate on a status snapshot, one action per tick
//! ```
//!
//! All mutable state sits behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Task execution runs in its own tokio task so a pool
//! with N idle workers runs N tasks at once.

use crate::observability;
use crate::pool::events::{EventBus, PoolEvent, PoolEventKind};
use crate::pool::load_balancer::{BalancingStats, LoadBalancer};
use crate::pool::scaling::{ScalingDecision, ScalingDirection, ScalingEngine, ScalingEvent};
use crate::pool::task_queue::TaskQueue;
use crate::pool::types::{
    PoolMetrics, PoolState, PoolStatus, PoolTask, TaskRequest, TaskResult, TaskStatus,
    WorkerProcess, WorkerStatus,
};
use crate::pool::worker_factory::WorkerFactory;
use crate::process::executor::{ExecutionOutcome, ProcessExecutor, ProcessHandle, TaskInvocation};
use crate::process::resource_limiter::{process_rss_bytes, ResourceLimiter};
use crate::utils::config::{PoolConfig, ScalingStrategy};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A task that left the queue but has no result yet
struct ActiveTask {
    task: PoolTask,
    /// Running execution; `None` while waiting for a retry
    execution: Option<AbortHandle>,
}

/// Final record of a task
struct FinishedTask {
    /// Completed, Failed or Cancelled
    status: TaskStatus,

    result: TaskResult,
}

/// Everything guarded by the pool lock
struct PoolShared {
    /// Pool lifecycle state
    lifecycle: PoolState,

    /// Set on start, cleared on stop
    started_at: Option<Instant>,

    /// Roster, ordered by slot
    workers: Vec<WorkerProcess>,

    /// Slots promised to spawns in flight
    reserved_slots: BTreeSet<usize>,

    /// Tasks waiting for a worker
    queue: TaskQueue,

    /// Assigned, running or retry-waiting tasks
    active: HashMap<String, ActiveTask>,

    /// Final results by task id
    completed: HashMap<String, FinishedTask>,

    /// One-shot completion signals by task id
    waiters: HashMap<String, Vec<oneshot::Sender<TaskResult>>>,

    /// Worker selection over the roster
    balancer: LoadBalancer,

    /// Scaling decisions and history
    scaling: ScalingEngine,

    /// Running totals
    metrics: PoolMetrics,

    /// Stops the background loops
    cancel: Option<CancellationToken>,

    /// Dispatch, health and scale loop handles
    loops: Vec<JoinHandle<()>>,
}

impl PoolShared {
    /// In-flight tasks that may still go back to the queue for a retry.
    /// Admission counts them so a requeue never overfills the queue.
    fn retry_reservations(&self, default_retries: u32) -> usize {
        self.active
            .values()
            .filter(|active| {
                active.task.attempts <= active.task.options.retries.unwrap_or(default_retries)
            })
            .count()
    }

    fn finish(&mut self, status: TaskStatus, result: TaskResult) {
        self.completed
            .insert(result.task_id.clone(), FinishedTask { status, result });
    }

    fn allocate_slot(&mut self) -> usize {
        let slot = (0..)
            .find(|slot| {
                !self.reserved_slots.contains(slot) && !self.workers.iter().any(|w| w.slot == *slot)
            })
            .unwrap_or(self.workers.len());
        self.reserved_slots.insert(slot);
        slot
    }

    /// Workers not on their way out
    fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !matches!(w.status, WorkerStatus::Stopping | WorkerStatus::Terminated))
            .count()
    }

    fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerProcess> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    fn remove_worker(&mut self, worker_id: &str) {
        self.workers.retain(|w| w.id != worker_id);
        self.balancer.remove_worker(worker_id);
    }

    /// Busy worker back to idle after its task ended
    fn release_worker(&mut self, worker_id: &str) {
        let mut released = false;
        if let Some(worker) = self.worker_mut(worker_id) {
            worker.current_task_id = None;
            worker.touch();
            if worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Idle;
                released = true;
            }
        }
        if released {
            self.balancer.update_worker_status(worker_id, WorkerStatus::Idle);
        }
    }
}

enum DispatchStep {
    Dispatched,
    Empty,
    NoWorker,
    Stopped,
}

struct PoolInner {
    config: PoolConfig,
    factory: WorkerFactory,
    executor: Arc<dyn ProcessExecutor>,
    limiter: ResourceLimiter,
    state: Mutex<PoolShared>,
    events: EventBus<PoolEvent>,
    results: EventBus<TaskResult>,
    work_available: Notify,
}

/// Handle to one worker pool; cheap to clone
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Build a stopped pool. The config is validated and `initial_workers`
    /// clamped into `[min_workers, max_workers]`.
    pub fn new(config: PoolConfig, executor: Arc<dyn ProcessExecutor>) -> Result<Self> {
        Self::with_channel_capacity(config, executor, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(
        config: PoolConfig,
        executor: Arc<dyn ProcessExecutor>,
        channel_capacity: usize,
    ) -> Result<Self> {
        let config = config.validated()?;

        let factory = WorkerFactory::new(
            config.id.clone(),
            config.worker.clone(),
            config.shutdown.clone(),
            Arc::clone(&executor),
        );
        let state = PoolShared {
            lifecycle: PoolState::Stopped,
            started_at: None,
            workers: Vec::new(),
            reserved_slots: BTreeSet::new(),
            queue: TaskQueue::new(config.tasks.max_queue_size),
            active: HashMap::new(),
            completed: HashMap::new(),
            waiters: HashMap::new(),
            balancer: LoadBalancer::new(
                config.load_balancing.algorithm,
                config.load_balancing.weights.clone(),
            ),
            scaling: ScalingEngine::new(
                config.scaling.clone(),
                config.min_workers,
                config.max_workers,
                config.initial_workers,
            ),
            metrics: PoolMetrics::default(),
            cancel: None,
            loops: Vec::new(),
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                limiter: ResourceLimiter::new(config.resources.clone()),
                config,
                factory,
                executor,
                state: Mutex::new(state),
                events: EventBus::new(channel_capacity),
                results: EventBus::new(channel_capacity),
                work_available: Notify::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PoolState {
        self.inner.state.lock().lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    pub fn queue_size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Spawn the initial workers and start the background loops.
    /// No-op unless the pool is stopped.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.lifecycle != PoolState::Stopped {
                debug!("Pool {} is already {:?}", inner.config.id, state.lifecycle);
                return Ok(());
            }
            state.lifecycle = PoolState::Starting;
            state.started_at = Some(Instant::now());
        }

        info!(
            "Starting pool {} with {} workers ({}..={})",
            inner.config.id, inner.config.initial_workers, inner.config.min_workers, inner.config.max_workers
        );

        // Partial failures are tolerated; the health loop heals up to min_workers
        let spawned = inner.spawn_workers(inner.config.initial_workers).await;
        if spawned < inner.config.initial_workers {
            warn!(
                "Pool {} started with {}/{} workers",
                inner.config.id, spawned, inner.config.initial_workers
            );
        }

        {
            let mut state = inner.state.lock();
            let token = CancellationToken::new();
            state.lifecycle = PoolState::Running;
            state.loops = vec![
                tokio::spawn(Arc::clone(inner).dispatch_loop(token.clone())),
                tokio::spawn(Arc::clone(inner).health_loop(token.clone())),
                tokio::spawn(Arc::clone(inner).scale_loop(token.clone())),
            ];
            state.cancel = Some(token);
        }

        inner.emit(PoolEventKind::PoolStarted { workers: spawned });
        Ok(())
    }

    /// Stop the loops, abandon in-flight tasks, terminate every worker and
    /// clear all queued and in-flight state. No-op unless the pool is running.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let (token, loops, executions) = {
            let mut state = inner.state.lock();
            if state.lifecycle != PoolState::Running {
                debug!("Pool {} is not running", inner.config.id);
                return Ok(());
            }
            state.lifecycle = PoolState::Stopping;
            let executions: Vec<AbortHandle> = state
                .active
                .values_mut()
                .filter_map(|active| active.execution.take())
                .collect();
            (state.cancel.take(), std::mem::take(&mut state.loops), executions)
        };

        info!("Stopping pool {}", inner.config.id);
        if let Some(token) = token {
            token.cancel();
        }
        for execution in executions {
            execution.abort();
        }
        for handle in loops {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Pool {} loop panicked: {}", inner.config.id, e);
                }
            }
        }

        let workers: Vec<WorkerProcess> = {
            let mut state = inner.state.lock();
            for worker in state.workers.iter_mut() {
                worker.status = WorkerStatus::Stopping;
            }
            state.workers.clone()
        };

        let outcomes = join_all(workers.iter().map(|w| inner.factory.terminate_worker(w))).await;
        for (worker, outcome) in workers.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!("Failed to terminate worker {}: {}", worker.id, e);
                inner.emit(PoolEventKind::PoolError {
                    error: format!("failed to terminate worker {}: {}", worker.id, e),
                });
            }
            observability::record_worker_event(&inner.config.id, "terminated");
            inner.emit(PoolEventKind::WorkerTerminated {
                worker_id: worker.id.clone(),
            });
        }

        {
            let mut state = inner.state.lock();
            for worker in &workers {
                state.remove_worker(&worker.id);
            }
            state.metrics.workers_terminated += workers.len() as u64;
            let dropped = state.queue.clear().len() + state.active.len();
            if dropped > 0 {
                warn!("Pool {} abandoned {} unfinished tasks", inner.config.id, dropped);
            }
            state.active.clear();
            // Dropping the senders wakes every waiter with an error
            state.waiters.clear();
            state.lifecycle = PoolState::Stopped;
            state.started_at = None;
        }

        observability::set_pool_gauges(&inner.config.id, 0, 0);
        inner.emit(PoolEventKind::PoolStopped);
        info!("Pool {} stopped", inner.config.id);
        Ok(())
    }

    /// Queue a task and return its id without waiting for it to run
    pub fn submit_task(&self, request: TaskRequest) -> Result<String> {
        let inner = &self.inner;
        if request.command.trim().is_empty() {
            return Err(EngineError::TaskExecutionFailed(
                "task command cannot be empty".into(),
            ));
        }

        let task_id = format!("task-{}", Ulid::new().to_string().to_lowercase());
        let task = PoolTask::new(task_id.clone(), inner.config.id.clone(), request);
        let priority = task.priority();

        let queued = {
            let mut state = inner.state.lock();
            if state.lifecycle != PoolState::Running {
                return Err(EngineError::TaskExecutionFailed(format!(
                    "pool {} is not running",
                    inner.config.id
                )));
            }
            let reserved = state.retry_reservations(inner.config.worker.retries);
            let max_size = state.queue.max_size();
            if state.queue.len() + reserved >= max_size {
                return Err(EngineError::QueueFull { max_size });
            }
            state.queue.enqueue(task)?;
            state.metrics.tasks_submitted += 1;
            // Published under the lock so task events stay ordered per task
            inner.emit(PoolEventKind::TaskQueued {
                task_id: task_id.clone(),
                priority,
            });
            state.queue.len()
        };

        debug!("Task {} queued in pool {} (priority {})", task_id, inner.config.id, priority);
        observability::set_queue_depth(&inner.config.id, queued);
        inner.work_available.notify_one();
        Ok(task_id)
    }

    /// Cancel a queued, assigned or running task.
    ///
    /// Returns `false` when the task already finished (its result is left
    /// untouched) or is unknown.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let (result, waiters) = {
            let mut state = inner.state.lock();
            if state.completed.contains_key(task_id) {
                return Ok(false);
            }

            let task = if let Some(task) = state.queue.remove(task_id) {
                task
            } else if let Some(active) = state.active.remove(task_id) {
                if let Some(execution) = active.execution {
                    execution.abort();
                }
                if let Some(worker_id) = &active.task.assigned_worker {
                    state.release_worker(worker_id);
                }
                active.task
            } else {
                debug!("Task {} is unknown to pool {}", task_id, inner.config.id);
                return Ok(false);
            };

            let result = TaskResult::cancelled(&task);
            state.finish(TaskStatus::Cancelled, result.clone());
            state.metrics.tasks_cancelled += 1;
            inner.emit(PoolEventKind::TaskCancelled {
                task_id: task_id.to_string(),
            });
            inner.results.publish(result.clone());
            (result, state.waiters.remove(task_id).unwrap_or_default())
        };

        info!("Task {} cancelled in pool {}", task_id, inner.config.id);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        inner.work_available.notify_one();
        Ok(true)
    }

    /// Non-blocking result lookup
    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner
            .state
            .lock()
            .completed
            .get(task_id)
            .map(|finished| finished.result.clone())
    }

    /// Current status of a task, including finished ones
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        let state = self.inner.state.lock();
        if let Some(finished) = state.completed.get(task_id) {
            return Some(finished.status);
        }
        if let Some(active) = state.active.get(task_id) {
            return Some(active.task.status);
        }
        state.queue.contains(task_id).then_some(TaskStatus::Pending)
    }

    /// Wait for a task's result, bounded by the pool's task timeout.
    /// A timed-out wait leaves the task running.
    pub async fn wait_for_task(&self, task_id: &str) -> Result<TaskResult> {
        self.wait_for_task_timeout(task_id, self.inner.config.tasks.task_timeout())
            .await
    }

    pub async fn wait_for_task_timeout(&self, task_id: &str, timeout: Duration) -> Result<TaskResult> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if let Some(finished) = state.completed.get(task_id) {
                return Ok(finished.result.clone());
            }
            if !state.queue.contains(task_id) && !state.active.contains_key(task_id) {
                return Err(EngineError::TaskExecutionFailed(format!(
                    "task {} is unknown to pool {}",
                    task_id, self.inner.config.id
                )));
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.entry(task_id.to_string()).or_default().push(sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(EngineError::TaskExecutionFailed(format!(
                "pool {} stopped before task {} finished",
                self.inner.config.id, task_id
            ))),
            Err(_) => Err(EngineError::TaskExecutionFailed(format!(
                "timed out after {:?} waiting for task {}",
                timeout, task_id
            ))),
        }
    }

    /// Add up to `count` workers, clamped to `max_workers`
    pub async fn scale_up(&self, count: usize) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.inner.apply_scale_up(count, "requested").await)
    }

    /// Remove up to `count` idle workers, clamped to `min_workers`
    pub async fn scale_down(&self, count: usize) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.inner.apply_scale_down(count, "requested").await)
    }

    /// Grow or shrink toward `size` (clamped); returns the resulting size
    pub async fn set_pool_size(&self, size: usize) -> Result<usize> {
        self.ensure_running()?;
        let config = &self.inner.config;
        let target = size.clamp(config.min_workers, config.max_workers);
        let current = {
            let state = self.inner.state.lock();
            state.live_workers() + state.reserved_slots.len()
        };

        if target > current {
            self.inner.apply_scale_up(target - current, "resize").await;
        } else if target < current {
            self.inner.apply_scale_down(current - target, "resize").await;
        }
        Ok(self.inner.state.lock().live_workers())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::ScalingFailed(format!(
                "pool {} is not running",
                self.inner.config.id
            )))
        }
    }

    /// Live snapshot
    pub fn get_status(&self) -> PoolStatus {
        let (mut status, pids) = {
            let state = self.inner.state.lock();
            let pids: Vec<u32> = state.workers.iter().filter_map(|w| w.process.pid).collect();
            (self.inner.status_of(&state), pids)
        };
        status.memory_bytes = pids.into_iter().filter_map(process_rss_bytes).sum();
        status
    }

    /// Running totals
    pub fn get_metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock();
        let mut metrics = state.metrics.clone();
        if let Some(started) = state.started_at {
            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                metrics.throughput_per_sec = metrics.tasks_completed as f64 / secs;
            }
        }
        metrics
    }

    pub fn balancing_stats(&self) -> BalancingStats {
        self.inner.state.lock().balancer.balancing_stats()
    }

    pub fn scaling_history(&self) -> Vec<ScalingEvent> {
        self.inner.state.lock().scaling.history()
    }

    /// Snapshot of the roster
    pub fn workers(&self) -> Vec<WorkerProcess> {
        self.inner.state.lock().workers.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<TaskResult> {
        self.inner.results.subscribe()
    }
}

impl PoolInner {
    fn emit(&self, kind: PoolEventKind) {
        self.events.publish(PoolEvent::new(self.config.id.clone(), kind));
    }

    fn status_of(&self, state: &PoolShared) -> PoolStatus {
        let count = |status: WorkerStatus| state.workers.iter().filter(|w| w.status == status).count();
        PoolStatus {
            pool_id: self.config.id.clone(),
            name: self.config.name.clone(),
            state: state.lifecycle,
            total_workers: state.workers.len(),
            idle_workers: count(WorkerStatus::Idle),
            busy_workers: count(WorkerStatus::Busy),
            starting_workers: count(WorkerStatus::Starting) + state.reserved_slots.len(),
            stopping_workers: count(WorkerStatus::Stopping),
            failed_workers: count(WorkerStatus::Failed),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            queue_size: state.queue.len(),
            active_tasks: state.active.len(),
            completed_tasks: state.completed.len(),
            uptime: state.started_at.map(|at| at.elapsed()).unwrap_or_default(),
            memory_bytes: 0,
        }
    }

    fn invocation(&self, task: &PoolTask) -> TaskInvocation {
        let spec = &self.config.worker;
        let mut env = spec.env.clone();
        env.extend(task.options.env.clone());
        TaskInvocation {
            task_id: task.id.clone(),
            command: task.command.clone(),
            args: task.args.clone(),
            cwd: task.options.cwd.clone().or_else(|| spec.cwd.clone()),
            env,
            timeout: task
                .options
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| spec.task_timeout()),
        }
    }

    /// Spawn up to `requested` workers in parallel, clamped to `max_workers`.
    /// Returns how many joined the roster.
    async fn spawn_workers(self: &Arc<Self>, requested: usize) -> usize {
        let slots: Vec<usize> = {
            let mut state = self.state.lock();
            let room = self
                .config
                .max_workers
                .saturating_sub(state.live_workers() + state.reserved_slots.len());
            (0..requested.min(room)).map(|_| state.allocate_slot()).collect()
        };
        if slots.is_empty() {
            return 0;
        }

        let outcomes = join_all(slots.iter().map(|&slot| self.factory.create_worker(slot))).await;

        let mut added = Vec::new();
        let mut orphans = Vec::new();
        let mut failures = Vec::new();
        {
            let mut state = self.state.lock();
            let accepting = matches!(state.lifecycle, PoolState::Starting | PoolState::Running);
            for (slot, outcome) in slots.iter().zip(outcomes) {
                state.reserved_slots.remove(slot);
                match outcome {
                    Ok(worker) if accepting => {
                        state.balancer.add_worker(&worker);
                        state.workers.push(worker.clone());
                        state.metrics.workers_spawned += 1;
                        added.push(worker);
                    }
                    Ok(worker) => orphans.push(worker),
                    Err(e) => failures.push(e),
                }
            }
            state.workers.sort_by_key(|w| w.slot);
        }

        // The pool stopped while these were starting
        for worker in orphans {
            if let Err(e) = self.factory.terminate_worker(&worker).await {
                warn!("Failed to terminate orphaned worker {}: {}", worker.id, e);
            }
        }

        for error in failures {
            warn!("Pool {} failed to spawn a worker: {}", self.config.id, error);
            observability::record_worker_event(&self.config.id, "spawn_failed");
            self.emit(PoolEventKind::WorkerFailed {
                worker_id: None,
                error: error.to_string(),
            });
            self.emit(PoolEventKind::PoolError {
                error: error.to_string(),
            });
        }

        for worker in &added {
            observability::record_worker_event(&self.config.id, "spawned");
            self.emit(PoolEventKind::WorkerSpawned {
                worker_id: worker.id.clone(),
                slot: worker.slot,
            });
        }
        if !added.is_empty() {
            self.work_available.notify_one();
        }
        added.len()
    }

    /// Terminate workers already marked `Stopping` and drop them from the roster
    async fn retire_workers(self: &Arc<Self>, workers: Vec<WorkerProcess>) -> usize {
        if workers.is_empty() {
            return 0;
        }
        let outcomes = join_all(workers.iter().map(|w| self.factory.terminate_worker(w))).await;

        {
            let mut state = self.state.lock();
            for worker in &workers {
                state.remove_worker(&worker.id);
            }
            state.metrics.workers_terminated += workers.len() as u64;
        }

        for (worker, outcome) in workers.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!("Worker {} did not terminate cleanly: {}", worker.id, e);
                self.emit(PoolEventKind::PoolError {
                    error: format!("failed to terminate worker {}: {}", worker.id, e),
                });
            }
            observability::record_worker_event(&self.config.id, "terminated");
            self.emit(PoolEventKind::WorkerTerminated {
                worker_id: worker.id.clone(),
            });
        }
        workers.len()
    }

    async fn restart_worker(self: &Arc<Self>, old: WorkerProcess) {
        info!("Restarting worker {} in pool {} (slot {})", old.id, self.config.id, old.slot);

        match self.factory.restart_worker(&old).await {
            Ok(new) => {
                let orphan = {
                    let mut state = self.state.lock();
                    state.balancer.remove_worker(&old.id);
                    if state.lifecycle == PoolState::Running {
                        match state.worker_mut(&old.id) {
                            Some(entry) => *entry = new.clone(),
                            None => {
                                state.workers.push(new.clone());
                                state.workers.sort_by_key(|w| w.slot);
                            }
                        }
                        state.balancer.add_worker(&new);
                        state.metrics.worker_restarts += 1;
                        state.metrics.workers_spawned += 1;
                        state.metrics.workers_terminated += 1;
                        None
                    } else {
                        state.workers.retain(|w| w.id != old.id);
                        Some(new.clone())
                    }
                };

                self.emit(PoolEventKind::WorkerTerminated {
                    worker_id: old.id.clone(),
                });
                match orphan {
                    Some(worker) => {
                        if let Err(e) = self.factory.terminate_worker(&worker).await {
                            warn!("Failed to terminate orphaned worker {}: {}", worker.id, e);
                        }
                    }
                    None => {
                        observability::record_worker_event(&self.config.id, "restarted");
                        self.emit(PoolEventKind::WorkerSpawned {
                            worker_id: new.id.clone(),
                            slot: new.slot,
                        });
                        self.work_available.notify_one();
                    }
                }
            }
            Err(e) => {
                error!("Failed to restart worker {}: {}", old.id, e);
                self.state.lock().remove_worker(&old.id);
                self.emit(PoolEventKind::WorkerFailed {
                    worker_id: Some(old.id.clone()),
                    error: e.to_string(),
                });
                self.emit(PoolEventKind::PoolError {
                    error: format!("failed to restart worker {}: {}", old.id, e),
                });
            }
        }
    }

    async fn apply_scale_up(self: &Arc<Self>, count: usize, reason: &str) -> usize {
        let from = self.state.lock().live_workers();
        let added = self.spawn_workers(count).await;
        if added > 0 {
            self.state.lock().metrics.scale_ups += 1;
            info!("Pool {} scaled up {} -> {} ({})", self.config.id, from, from + added, reason);
            self.emit(PoolEventKind::PoolScaled {
                from,
                to: from + added,
                reason: reason.to_string(),
            });
        }
        added
    }

    async fn apply_scale_down(self: &Arc<Self>, count: usize, reason: &str) -> usize {
        let (from, victims) = {
            let mut state = self.state.lock();
            let from = state.live_workers();
            let removable = from.saturating_sub(self.config.min_workers).min(count);
            let victims: Vec<WorkerProcess> = state
                .workers
                .iter_mut()
                .rev()
                .filter(|w| w.status == WorkerStatus::Idle)
                .take(removable)
                .map(|w| {
                    w.status = WorkerStatus::Stopping;
                    w.clone()
                })
                .collect();
            for victim in &victims {
                state.balancer.update_worker_status(&victim.id, WorkerStatus::Stopping);
            }
            (from, victims)
        };

        let removed = self.retire_workers(victims).await;
        if removed > 0 {
            self.state.lock().metrics.scale_downs += 1;
            info!("Pool {} scaled down {} -> {} ({})", self.config.id, from, from - removed, reason);
            self.emit(PoolEventKind::PoolScaled {
                from,
                to: from - removed,
                reason: reason.to_string(),
            });
        }
        removed
    }

    async fn dispatch_loop(self: Arc<Self>, token: CancellationToken) {
        debug!("Dispatch loop started for pool {}", self.config.id);
        loop {
            if token.is_cancelled() {
                break;
            }
            let wait = match self.dispatch_next() {
                DispatchStep::Dispatched => continue,
                DispatchStep::Empty => self.config.tasks.dispatch_idle(),
                DispatchStep::NoWorker => self.config.tasks.dispatch_backoff(),
                DispatchStep::Stopped => break,
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.work_available.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Dispatch loop stopped for pool {}", self.config.id);
    }

    /// Move at most one task from the queue onto an idle worker
    fn dispatch_next(self: &Arc<Self>) -> DispatchStep {
        let mut state = self.state.lock();
        if state.lifecycle != PoolState::Running {
            return DispatchStep::Stopped;
        }
        let Some(mut task) = state.queue.dequeue() else {
            return DispatchStep::Empty;
        };
        let Some(worker_id) = state.balancer.select_worker(&task) else {
            state.queue.requeue(task);
            return DispatchStep::NoWorker;
        };

        let handle = match state.worker_mut(&worker_id) {
            Some(worker) if worker.status == WorkerStatus::Idle => {
                worker.status = WorkerStatus::Busy;
                worker.current_task_id = Some(task.id.clone());
                worker.touch();
                worker.process.clone()
            }
            _ => {
                // Balancer view is stale; resync and retry later
                warn!("Worker {} selected but not idle in pool {}", worker_id, self.config.id);
                state.balancer.remove_worker(&worker_id);
                if let Some(worker) = state.workers.iter().find(|w| w.id == worker_id).cloned() {
                    state.balancer.add_worker(&worker);
                }
                state.queue.requeue(task);
                return DispatchStep::NoWorker;
            }
        };
        state.balancer.update_worker_status(&worker_id, WorkerStatus::Busy);

        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker_id.clone());
        task.scheduled_at = Some(Utc::now());
        task.attempts += 1;

        let task_id = task.id.clone();
        let invocation = self.invocation(&task);
        let execution = tokio::spawn(Arc::clone(self).run_task(
            task_id.clone(),
            worker_id.clone(),
            handle,
            invocation,
        ));
        state.active.insert(
            task_id.clone(),
            ActiveTask {
                task,
                execution: Some(execution.abort_handle()),
            },
        );
        self.emit(PoolEventKind::TaskAssigned {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
        });
        let queued = state.queue.len();
        drop(state);

        debug!("Task {} assigned to worker {}", task_id, worker_id);
        observability::set_queue_depth(&self.config.id, queued);
        DispatchStep::Dispatched
    }

    async fn run_task(
        self: Arc<Self>,
        task_id: String,
        worker_id: String,
        handle: ProcessHandle,
        invocation: TaskInvocation,
    ) {
        {
            let mut state = self.state.lock();
            match state.active.get_mut(&task_id) {
                Some(active) => active.task.status = TaskStatus::Running,
                // Cancelled before it started
                None => return,
            }
        }

        let started = Instant::now();
        let outcome = self.executor.execute(&handle, invocation).await;
        self.finish_task(&task_id, &worker_id, outcome, started.elapsed());
    }

    fn finish_task(
        self: &Arc<Self>,
        task_id: &str,
        worker_id: &str,
        outcome: Result<ExecutionOutcome>,
        elapsed: Duration,
    ) {
        let worker_error = outcome.is_err();
        let outcome = outcome.unwrap_or_else(|e| ExecutionOutcome {
            error: Some(e.to_string()),
            duration: elapsed,
            ..Default::default()
        });

        let mut state = self.state.lock();
        // Gone if cancelled or the pool stopped meanwhile
        let Some(active) = state.active.remove(task_id) else {
            return;
        };
        let mut task = active.task;

        let worker_alive = state
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| self.factory.is_alive(w))
            .unwrap_or(false);
        state.release_worker(worker_id);
        state.balancer.record_completion(worker_id);
        let max_failures = self.config.health.worker_max_failures;
        if let Some(worker) = state.worker_mut(worker_id) {
            worker.task_count += 1;
            if worker_error {
                worker.failure_count += 1;
            } else {
                worker.failure_count = 0;
            }
            let unhealthy = worker_error && (!worker_alive || worker.failure_count > max_failures);
            if unhealthy && worker.status == WorkerStatus::Idle {
                worker.status = WorkerStatus::Failed;
            }
        }
        if state
            .workers
            .iter()
            .any(|w| w.id == worker_id && w.status == WorkerStatus::Failed)
        {
            state.balancer.update_worker_status(worker_id, WorkerStatus::Failed);
        }

        let retries = task.options.retries.unwrap_or(self.config.worker.retries);
        if !outcome.success && task.attempts <= retries && state.lifecycle == PoolState::Running {
            task.status = TaskStatus::Pending;
            task.assigned_worker = None;
            let attempts = task.attempts;
            state.active.insert(
                task_id.to_string(),
                ActiveTask {
                    task,
                    execution: None,
                },
            );
            state.metrics.tasks_retried += 1;
            drop(state);

            info!(
                "Task {} failed on attempt {}, retrying in {:?}",
                task_id,
                attempts,
                self.config.tasks.retry_delay()
            );
            let inner = Arc::clone(self);
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.tasks.retry_delay()).await;
                inner.requeue_retry(&task_id);
            });
            self.work_available.notify_one();
            return;
        }

        let result = TaskResult {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            success: outcome.success,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            error: outcome.error,
            duration: outcome.duration,
            completed_at: Utc::now(),
            metadata: (!task.options.metadata.is_empty()).then(|| task.options.metadata.clone()),
        };
        if state.completed.contains_key(task_id) {
            return;
        }
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        state.finish(status, result.clone());
        state.metrics.record_result(&result);
        if result.success {
            self.emit(PoolEventKind::TaskCompleted {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                duration_ms: result.duration.as_millis() as u64,
            });
        } else {
            self.emit(PoolEventKind::TaskFailed {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                error: result.error.clone().unwrap_or_else(|| "task failed".to_string()),
            });
        }
        self.results.publish(result.clone());
        let waiters = state.waiters.remove(task_id).unwrap_or_default();
        drop(state);

        debug!("Task {} finished on worker {} ({:?})", task_id, worker_id, status);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        observability::record_task_result(&self.config.id, result.success, result.duration);
        self.work_available.notify_one();
    }

    fn requeue_retry(&self, task_id: &str) {
        let mut state = self.state.lock();
        if state.lifecycle != PoolState::Running {
            return;
        }
        // Cancelled during the delay if missing
        if let Some(active) = state.active.remove(task_id) {
            state.queue.requeue(active.task);
            drop(state);
            self.work_available.notify_one();
        }
    }

    async fn health_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.check_health().await;
        }
    }

    async fn check_health(self: &Arc<Self>) {
        let max_failures = self.config.health.worker_max_failures;
        let idle_timeout = self.config.health.worker_idle_timeout();
        let can_retire = self.config.scaling.strategy != ScalingStrategy::Fixed;

        let (restarts, retirements, crashed, deficit, pids) = {
            let mut state = self.state.lock();
            if state.lifecycle != PoolState::Running {
                return;
            }

            let mut live = state.live_workers();
            let mut restarts = Vec::new();
            let mut retirements = Vec::new();
            let mut crashed = Vec::new();
            for worker in state.workers.iter_mut() {
                if !matches!(worker.status, WorkerStatus::Idle | WorkerStatus::Failed) {
                    continue;
                }
                let alive = self.factory.is_alive(worker);
                if worker.status == WorkerStatus::Failed || worker.failure_count > max_failures || !alive {
                    if !alive && worker.status != WorkerStatus::Failed {
                        crashed.push(worker.id.clone());
                    }
                    worker.status = WorkerStatus::Stopping;
                    restarts.push(worker.clone());
                } else if can_retire
                    && live > self.config.min_workers
                    && worker.last_activity.elapsed() >= idle_timeout
                {
                    worker.status = WorkerStatus::Stopping;
                    live -= 1;
                    retirements.push(worker.clone());
                }
            }
            for worker in restarts.iter().chain(&retirements) {
                state.balancer.update_worker_status(&worker.id, WorkerStatus::Stopping);
            }

            // Restarts refill their own slots
            let deficit = self
                .config
                .min_workers
                .saturating_sub(state.live_workers() + restarts.len() + state.reserved_slots.len());
            let pids: Vec<u32> = state.workers.iter().filter_map(|w| w.process.pid).collect();
            (restarts, retirements, crashed, deficit, pids)
        };

        for worker_id in crashed {
            warn!("Worker {} in pool {} is no longer running", worker_id, self.config.id);
            self.emit(PoolEventKind::WorkerFailed {
                worker_id: Some(worker_id),
                error: "worker process exited".to_string(),
            });
        }

        join_all(restarts.into_iter().map(|w| self.restart_worker(w))).await;

        if !retirements.is_empty() {
            info!(
                "Retiring {} idle workers in pool {}",
                retirements.len(),
                self.config.id
            );
            self.retire_workers(retirements).await;
        }

        if deficit > 0 {
            info!("Pool {} below minimum, spawning {} workers", self.config.id, deficit);
            self.spawn_workers(deficit).await;
        }

        let rss: u64 = pids.iter().copied().filter_map(process_rss_bytes).sum();
        if let Some(violation) = self.limiter.check_memory(rss, pids.len()) {
            warn!("Pool {}: {}", self.config.id, violation);
            self.emit(PoolEventKind::PoolError { error: violation });
        }

        let status = self.status_of(&self.state.lock());
        observability::set_pool_gauges(&self.config.id, status.total_workers, status.busy_workers);
    }

    async fn scale_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.scaling.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.check_scaling().await;
        }
    }

    async fn check_scaling(self: &Arc<Self>) {
        let action = {
            let mut state = self.state.lock();
            if state.lifecycle != PoolState::Running {
                return;
            }
            let status = self.status_of(&state);
            match state.scaling.evaluate(&status) {
                ScalingDecision::None => None,
                ScalingDecision::ScaleUp { count, reason } => {
                    state.scaling.execute_scale_up(&status, count, &reason)
                }
                ScalingDecision::ScaleDown { count, reason } => {
                    state.scaling.execute_scale_down(&status, count, &reason)
                }
            }
        };

        let Some(action) = action else {
            return;
        };
        debug!(
            "Pool {} scaling {:?} {} -> {}: {}",
            self.config.id, action.direction, action.from, action.to, action.reason
        );
        match action.direction {
            ScalingDirection::Up => self.apply_scale_up(action.count, &action.reason).await,
            ScalingDirection::Down => self.apply_scale_down(action.count, &action.reason).await,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedExecutor;

    fn config(min: usize, max: usize, initial: usize) -> PoolConfig {
        let mut config = PoolConfig::new("test-pool", "worker");
        config.min_workers = min;
        config.max_workers = max;
        config.initial_workers = initial;
        config.worker.startup_grace_ms = 1;
        config.scaling.strategy = ScalingStrategy::Fixed;
        config.health.check_interval_ms = 60_000;
        config.scaling.check_interval_ms = 60_000;
        config.tasks.dispatch_idle_ms = 5;
        config.tasks.dispatch_backoff_ms = 5;
        config.tasks.retry_delay_ms = 5;
        config
    }

    async fn started(config: PoolConfig) -> (WorkerPool, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor::new());
        let pool = WorkerPool::new(config, executor.clone()).unwrap();
        pool.start().await.unwrap();
        (pool, executor)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let executor = Arc::new(ScriptedExecutor::new());
        let pool = WorkerPool::new(config(1, 4, 2), executor.clone()).unwrap();
        let mut events = pool.subscribe_events();
        assert_eq!(pool.state(), PoolState::Stopped);

        pool.start().await.unwrap();
        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert_eq!(executor.spawn_count(), 2);

        let status = pool.get_status();
        assert_eq!(status.total_workers, 2);
        assert_eq!(status.idle_workers, 2);

        pool.stop().await.unwrap();
        pool.stop().await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.get_status().total_workers, 0);
        assert_eq!(executor.termination_count(), 2);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&PoolEventKind::PoolStarted { workers: 2 }));
        assert_eq!(kinds.last(), Some(&PoolEventKind::PoolStopped));
    }

    #[tokio::test]
    async fn test_submit_requires_running_pool() {
        let executor = Arc::new(ScriptedExecutor::new());
        let pool = WorkerPool::new(config(1, 1, 1), executor).unwrap();
        let result = pool.submit_task(TaskRequest::new("ok"));
        assert!(matches!(result, Err(EngineError::TaskExecutionFailed(_))));
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let (pool, _executor) = started(config(1, 2, 2)).await;

        let id = pool.submit_task(TaskRequest::new("ok").arg("hello")).unwrap();
        let result = pool.wait_for_task(&id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, id);
        assert_eq!(result.stdout.as_deref(), Some("hello"));
        assert_eq!(pool.get_task_result(&id), Some(result));
        assert_eq!(pool.get_task_status(&id), Some(TaskStatus::Completed));

        let metrics = pool.get_metrics();
        assert_eq!(metrics.tasks_submitted, 1);
        assert_eq!(metrics.tasks_completed, 1);

        let status = pool.get_status();
        assert_eq!(status.idle_workers, 2);
        assert_eq!(status.completed_tasks, 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_task_is_isolated() {
        let (pool, _executor) = started(config(1, 1, 1)).await;

        let bad = pool.submit_task(TaskRequest::new("fail")).unwrap();
        let good = pool.submit_task(TaskRequest::new("ok")).unwrap();

        let bad = pool.wait_for_task(&bad).await.unwrap();
        assert!(!bad.success);
        assert_eq!(bad.exit_code, Some(1));
        assert!(pool.wait_for_task(&good).await.unwrap().success);

        let metrics = pool.get_metrics();
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.tasks_completed, 1);
        // A non-zero exit is not a worker failure
        assert_eq!(pool.workers()[0].failure_count, 0);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_every_task_gets_exactly_one_result() {
        let (pool, _executor) = started(config(3, 3, 3)).await;
        let mut results = pool.subscribe_results();

        let ids: Vec<String> = (0..20)
            .map(|i| {
                let command = if i % 3 == 0 { "fail" } else { "ok" };
                pool.submit_task(TaskRequest::new(command)).unwrap()
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..ids.len() {
            let result = results.recv().await.unwrap();
            assert!(seen.insert(result.task_id.clone()), "duplicate result");
        }
        for id in &ids {
            assert!(seen.contains(id));
            assert!(pool.get_task_result(id).is_some());
        }
        assert_eq!(pool.get_metrics().tasks_failed, 7);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_rejected() {
        let mut config = config(1, 1, 1);
        config.tasks.max_queue_size = 1;
        let (pool, _executor) = started(config).await;

        let blocker = pool.submit_task(TaskRequest::new("sleep").arg("300")).unwrap();
        assert!(eventually(|| pool.get_status().busy_workers == 1).await);

        pool.submit_task(TaskRequest::new("ok")).unwrap();
        let overflow = pool.submit_task(TaskRequest::new("ok"));
        assert!(matches!(overflow, Err(EngineError::QueueFull { max_size: 1 })));
        assert_eq!(pool.queue_size(), 1);

        pool.wait_for_task(&blocker).await.unwrap();
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_on_single_worker() {
        let (pool, _executor) = started(config(1, 1, 1)).await;
        let mut results = pool.subscribe_results();

        let blocker = pool.submit_task(TaskRequest::new("sleep").arg("100")).unwrap();
        assert!(eventually(|| pool.get_status().busy_workers == 1).await);

        let first = pool.submit_task(TaskRequest::new("ok").with_priority(5)).unwrap();
        let urgent = pool.submit_task(TaskRequest::new("ok").with_priority(1)).unwrap();
        let second = pool.submit_task(TaskRequest::new("ok").with_priority(5)).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(results.recv().await.unwrap().task_id);
        }
        assert_eq!(order, vec![blocker, urgent, first, second]);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (pool, executor) = started(config(1, 1, 1)).await;

        let blocker = pool.submit_task(TaskRequest::new("sleep").arg("100")).unwrap();
        assert!(eventually(|| pool.get_status().busy_workers == 1).await);
        let pending = pool.submit_task(TaskRequest::new("ok")).unwrap();
        assert_eq!(pool.get_task_status(&pending), Some(TaskStatus::Pending));

        assert!(pool.cancel_task(&pending).unwrap());
        assert_eq!(pool.queue_size(), 0);
        let cancelled = pool.wait_for_task(&pending).await.unwrap();
        assert!(!cancelled.success);
        assert_eq!(pool.get_task_status(&pending), Some(TaskStatus::Cancelled));

        pool.wait_for_task(&blocker).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.execution_count(), 1);
        assert_eq!(pool.get_metrics().tasks_cancelled, 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_noop() {
        let (pool, _executor) = started(config(1, 1, 1)).await;

        let id = pool.submit_task(TaskRequest::new("ok")).unwrap();
        let result = pool.wait_for_task(&id).await.unwrap();

        assert!(!pool.cancel_task(&id).unwrap());
        assert_eq!(pool.get_task_result(&id), Some(result));
        assert!(!pool.cancel_task("task-unknown").unwrap());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_task_frees_worker() {
        let (pool, _executor) = started(config(1, 1, 1)).await;

        let slow = pool.submit_task(TaskRequest::new("sleep").arg("5000")).unwrap();
        assert!(eventually(|| pool.get_task_status(&slow) == Some(TaskStatus::Running)).await);

        assert!(pool.cancel_task(&slow).unwrap());
        let status = pool.get_status();
        assert_eq!(status.idle_workers, 1);
        assert_eq!(status.active_tasks, 0);

        let next = pool.submit_task(TaskRequest::new("ok")).unwrap();
        assert!(pool.wait_for_task(&next).await.unwrap().success);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_before_final_failure() {
        let (pool, executor) = started(config(1, 1, 1)).await;

        let id = pool.submit_task(TaskRequest::new("fail").with_retries(2)).unwrap();
        let result = pool.wait_for_task(&id).await.unwrap();

        assert!(!result.success);
        assert_eq!(executor.execution_count(), 3);
        let metrics = pool.get_metrics();
        assert_eq!(metrics.tasks_retried, 2);
        assert_eq!(metrics.tasks_failed, 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_task_running() {
        let mut config = config(1, 1, 1);
        config.tasks.task_timeout_ms = 30;
        let (pool, _executor) = started(config).await;

        let id = pool.submit_task(TaskRequest::new("sleep").arg("150")).unwrap();
        let waited = pool.wait_for_task(&id).await;
        assert!(matches!(waited, Err(EngineError::TaskExecutionFailed(_))));

        let result = pool
            .wait_for_task_timeout(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.success);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task() {
        let (pool, _executor) = started(config(1, 1, 1)).await;
        assert!(pool.wait_for_task("task-missing").await.is_err());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_abandons_waiters() {
        let (pool, _executor) = started(config(1, 1, 1)).await;
        let id = pool.submit_task(TaskRequest::new("sleep").arg("5000")).unwrap();

        let waiter = {
            let pool = pool.clone();
            let id = id.clone();
            tokio::spawn(async move { pool.wait_for_task(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.stop().await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(matches!(waited, Err(EngineError::TaskExecutionFailed(_))));
        assert!(pool.get_task_result(&id).is_none());
        assert_eq!(pool.get_status().queue_size, 0);
    }

    #[tokio::test]
    async fn test_partial_startup_heals_to_minimum() {
        let mut config = config(2, 3, 2);
        config.health.check_interval_ms = 20;
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail_next_spawns(1);
        let pool = WorkerPool::new(config, executor.clone()).unwrap();
        let mut events = pool.subscribe_events();

        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert_eq!(pool.get_status().total_workers, 1);

        assert!(eventually(|| pool.get_status().total_workers == 2).await);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, PoolEventKind::WorkerFailed { worker_id: None, .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_restarts_crashed_worker() {
        let mut config = config(1, 1, 1);
        config.health.check_interval_ms = 20;
        let (pool, executor) = started(config).await;

        let original = pool.workers()[0].clone();
        executor.crash(&original.id);

        assert!(eventually(|| {
            let workers = pool.workers();
            workers.len() == 1 && workers[0].id != original.id && workers[0].is_idle()
        })
        .await);
        let replacement = pool.workers()[0].clone();
        assert_eq!(replacement.slot, original.slot);
        assert_eq!(pool.get_metrics().worker_restarts, 1);

        let id = pool.submit_task(TaskRequest::new("ok")).unwrap();
        assert!(pool.wait_for_task(&id).await.unwrap().success);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_worker_errors_force_restart() {
        let mut config = config(1, 1, 1);
        config.health.check_interval_ms = 20;
        config.health.worker_max_failures = 1;
        let (pool, _executor) = started(config).await;
        let original = pool.workers()[0].id.clone();

        for _ in 0..2 {
            let id = pool.submit_task(TaskRequest::new("error")).unwrap();
            let result = pool.wait_for_task(&id).await.unwrap();
            assert!(!result.success);
        }

        assert!(eventually(|| pool.workers().iter().all(|w| w.id != original && w.is_idle())).await);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_scale_up_when_busy() {
        let mut config = config(1, 3, 1);
        config.scaling.strategy = ScalingStrategy::Dynamic;
        config.scaling.scale_up_threshold = 0.8;
        config.scaling.scale_up_cooldown_ms = 0;
        config.scaling.scale_down_cooldown_ms = 60_000;
        config.scaling.check_interval_ms = 20;
        let (pool, _executor) = started(config).await;

        for _ in 0..4 {
            pool.submit_task(TaskRequest::new("sleep").arg("400")).unwrap();
        }

        assert!(eventually(|| pool.get_status().total_workers > 1).await);
        for _ in 0..10 {
            let status = pool.get_status();
            assert!(status.total_workers >= 1 && status.total_workers <= 3);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!pool.scaling_history().is_empty());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_down_never_removes_busy_worker() {
        let (pool, _executor) = started(config(0, 3, 3)).await;

        let busy = pool.submit_task(TaskRequest::new("sleep").arg("200")).unwrap();
        assert!(eventually(|| pool.get_status().busy_workers == 1).await);

        let removed = pool.scale_down(3).await.unwrap();
        assert_eq!(removed, 2);
        let status = pool.get_status();
        assert_eq!(status.total_workers, 1);
        assert_eq!(status.busy_workers, 1);

        assert!(pool.wait_for_task(&busy).await.unwrap().success);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_scaling_respects_bounds() {
        let (pool, executor) = started(config(1, 3, 1)).await;

        assert_eq!(pool.scale_up(10).await.unwrap(), 2);
        assert_eq!(pool.get_status().total_workers, 3);
        assert_eq!(pool.scale_down(10).await.unwrap(), 2);
        assert_eq!(pool.get_status().total_workers, 1);

        assert_eq!(pool.set_pool_size(2).await.unwrap(), 2);
        assert_eq!(pool.set_pool_size(0).await.unwrap(), 1);
        assert_eq!(executor.spawn_count(), 4);

        let slots: Vec<usize> = pool.workers().iter().map(|w| w.slot).collect();
        assert_eq!(slots, vec![0]);
        pool.stop().await.unwrap();

        assert!(matches!(pool.scale_up(1).await, Err(EngineError::ScalingFailed(_))));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (pool, _executor) = started(config(1, 1, 1)).await;
        pool.stop().await.unwrap();
        pool.start().await.unwrap();

        let id = pool.submit_task(TaskRequest::new("ok")).unwrap();
        assert!(pool.wait_for_task(&id).await.unwrap().success);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_retry_holds_queue_capacity() {
        let mut config = config(1, 1, 1);
        config.tasks.max_queue_size = 1;
        config.tasks.retry_delay_ms = 300;
        let (pool, _executor) = started(config).await;

        let flaky = pool.submit_task(TaskRequest::new("fail").with_retries(1)).unwrap();
        assert!(eventually(|| pool.get_metrics().tasks_retried == 1).await);

        // The queue is empty while the retry waits, but its slot is taken
        assert_eq!(pool.queue_size(), 0);
        let overflow = pool.submit_task(TaskRequest::new("ok"));
        assert!(matches!(overflow, Err(EngineError::QueueFull { max_size: 1 })));

        let result = pool.wait_for_task(&flaky).await.unwrap();
        assert!(!result.success);
        assert!(pool.queue_size() <= 1);

        let next = pool.submit_task(TaskRequest::new("ok")).unwrap();
        assert!(pool.wait_for_task(&next).await.unwrap().success);
        assert_eq!(pool.get_metrics().tasks_submitted, 2);
        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_events_arrive_in_lifecycle_order() {
        let executor = Arc::new(ScriptedExecutor::new());
        let pool = WorkerPool::with_channel_capacity(config(4, 4, 4), executor, 8192).unwrap();
        pool.start().await.unwrap();
        let mut events = pool.subscribe_events();

        let total = 500;
        for _ in 0..total {
            pool.submit_task(TaskRequest::new("ok")).unwrap();
        }

        // 1 = queued, 2 = assigned, 3 = finished
        let mut stages: HashMap<String, u8> = HashMap::new();
        let mut out_of_order = Vec::new();
        let mut finished = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while finished < total {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("timed out waiting for task events")
                .unwrap();
            let (task_id, stage) = match event.kind {
                PoolEventKind::TaskQueued { task_id, .. } => (task_id, 1),
                PoolEventKind::TaskAssigned { task_id, .. } => (task_id, 2),
                PoolEventKind::TaskCompleted { task_id, .. }
                | PoolEventKind::TaskFailed { task_id, .. } => (task_id, 3),
                _ => continue,
            };
            let previous = stages.get(&task_id).copied().unwrap_or(0);
            if stage != previous + 1 {
                out_of_order.push((task_id.clone(), previous, stage));
            }
            if stage == 3 {
                finished += 1;
            }
            stages.insert(task_id, stage);
        }

        assert!(out_of_order.is_empty(), "out of order: {:?}", out_of_order);
        assert_eq!(stages.len(), total);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_during_worker_restart() {
        let mut config = config(1, 1, 1);
        config.worker.startup_grace_ms = 200;
        config.health.check_interval_ms = 20;
        let (pool, executor) = started(config).await;

        let original = pool.workers()[0].id.clone();
        executor.crash(&original);
        assert!(eventually(|| {
            pool.workers()
                .iter()
                .any(|w| w.id == original && w.status == WorkerStatus::Stopping)
        })
        .await);

        pool.stop().await.unwrap();

        // The replacement that came up after stop began is shut down too
        assert_eq!(executor.spawn_count(), 2);
        assert_eq!(executor.termination_count(), 2);
        assert!(pool.workers().is_empty());
        assert_eq!(pool.get_metrics().worker_restarts, 0);
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn test_failure_message_does_not_change_status() {
        let (pool, _executor) = started(config(1, 1, 1)).await;

        let id = pool
            .submit_task(TaskRequest::new("fail").arg("task cancelled"))
            .unwrap();
        let result = pool.wait_for_task(&id).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("task cancelled"));
        assert_eq!(pool.get_task_status(&id), Some(TaskStatus::Failed));
        assert!(!pool.cancel_task(&id).unwrap());
        assert_eq!(pool.get_task_status(&id), Some(TaskStatus::Failed));
        pool.stop().await.unwrap();
    }
}

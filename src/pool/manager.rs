// src/pool/manager.rs
//! Multi-pool manager
//!
//! Keeps a named collection of worker pools, routes submissions to them and
//! fans every pool's event stream into one manager-wide bus with a bounded
//! history.

use crate::pool::events::{EventBus, PoolEvent};
use crate::pool::types::{PoolMetrics, PoolState, PoolStatus, TaskRequest};
use crate::pool::worker_pool::WorkerPool;
use crate::process::executor::ProcessExecutor;
use crate::utils::config::{ManagerConfig, PoolConfig};
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate view over every registered pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStatus {
    pub total_pools: usize,
    pub running_pools: usize,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub memory_bytes: u64,
    pub pools: Vec<PoolStatus>,
}

/// Last N events across all pools
#[derive(Debug)]
struct EventHistory {
    capacity: usize,
    entries: Mutex<VecDeque<PoolEvent>>,
}

impl EventHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn push(&self, event: PoolEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    fn snapshot(&self) -> Vec<PoolEvent> {
        self.entries.lock().iter().cloned().collect()
    }
}

struct ManagedPool {
    pool: WorkerPool,
    forwarder: JoinHandle<()>,
    forwarder_token: CancellationToken,
}

pub struct PoolManager {
    config: ManagerConfig,
    executor: Arc<dyn ProcessExecutor>,
    pools: DashMap<String, ManagedPool>,
    /// Pool ids in registration order
    order: Mutex<Vec<String>>,
    running: AtomicBool,
    events: EventBus<PoolEvent>,
    history: Arc<EventHistory>,
}

impl PoolManager {
    pub fn new(config: ManagerConfig, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            events: EventBus::new(config.event_channel_capacity),
            history: Arc::new(EventHistory::new(config.event_history_size)),
            config,
            executor,
            pools: DashMap::new(),
            order: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Pool manager started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop every pool and unregister it
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down pool manager ({} pools)", self.pools.len());

        let ids = std::mem::take(&mut *self.order.lock());
        let managed: Vec<ManagedPool> = ids
            .iter()
            .filter_map(|id| self.pools.remove(id).map(|(_, managed)| managed))
            .collect();

        let outcomes = futures::future::join_all(managed.iter().map(|m| m.pool.stop())).await;
        let mut first_error = None;
        for (entry, outcome) in managed.into_iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!("Pool {} did not stop cleanly: {}", entry.pool.id(), e);
                first_error.get_or_insert(e);
            }
            Self::finish_forwarder(entry).await;
        }

        info!("Pool manager stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Build, start and register a pool
    pub async fn create_pool(&self, config: PoolConfig) -> Result<WorkerPool> {
        if !self.is_running() {
            return Err(EngineError::PoolCreationFailed(
                "pool manager is not running".into(),
            ));
        }

        let pool_id = config.id.clone();
        let pool = WorkerPool::with_channel_capacity(
            config,
            Arc::clone(&self.executor),
            self.config.event_channel_capacity,
        )?;
        if pool.config().persistence.enabled {
            warn!("Pool {} requests persistence, which is not supported; ignoring", pool_id);
        }

        match self.pools.entry(pool_id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::PoolCreationFailed(format!(
                    "pool {} already exists",
                    pool_id
                )));
            }
            Entry::Vacant(slot) => {
                // Subscribe before start so pool_started is captured
                let forwarder_token = CancellationToken::new();
                let forwarder = tokio::spawn(forward_events(
                    pool.subscribe_events(),
                    self.events.clone(),
                    Arc::clone(&self.history),
                    forwarder_token.clone(),
                ));
                slot.insert(ManagedPool {
                    pool: pool.clone(),
                    forwarder,
                    forwarder_token,
                });
                self.order.lock().push(pool_id.clone());
            }
        }

        if let Err(e) = pool.start().await {
            self.unregister(&pool_id).await;
            return Err(EngineError::PoolCreationFailed(format!(
                "pool {} failed to start: {}",
                pool_id, e
            )));
        }

        info!("Pool {} created", pool_id);
        Ok(pool)
    }

    /// Stop and unregister a pool
    pub async fn remove_pool(&self, pool_id: &str) -> Result<()> {
        let Some((_, managed)) = self.pools.remove(pool_id) else {
            return Err(EngineError::PoolCreationFailed(format!(
                "pool {} not found",
                pool_id
            )));
        };
        self.order.lock().retain(|id| id != pool_id);

        let stopped = managed.pool.stop().await;
        Self::finish_forwarder(managed).await;
        info!("Pool {} removed", pool_id);
        stopped
    }

    async fn unregister(&self, pool_id: &str) {
        self.order.lock().retain(|id| id != pool_id);
        if let Some((_, managed)) = self.pools.remove(pool_id) {
            Self::finish_forwarder(managed).await;
        }
    }

    async fn finish_forwarder(managed: ManagedPool) {
        managed.forwarder_token.cancel();
        if let Err(e) = managed.forwarder.await {
            warn!("Event forwarder for pool {} failed: {}", managed.pool.id(), e);
        }
    }

    pub fn get_pool(&self, pool_id: &str) -> Option<WorkerPool> {
        self.pools.get(pool_id).map(|managed| managed.pool.clone())
    }

    pub fn pool_ids(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    /// Registered pools in registration order
    pub fn pools(&self) -> Vec<WorkerPool> {
        self.pool_ids()
            .iter()
            .filter_map(|id| self.get_pool(id))
            .collect()
    }

    pub fn submit_task_to_pool(&self, pool_id: &str, request: TaskRequest) -> Result<String> {
        let pool = self.get_pool(pool_id).ok_or_else(|| {
            EngineError::TaskExecutionFailed(format!("pool {} not found", pool_id))
        })?;
        if !pool.is_running() {
            return Err(EngineError::TaskExecutionFailed(format!(
                "pool {} is not running",
                pool_id
            )));
        }
        pool.submit_task(request)
    }

    /// Submit to the running pool with the shortest queue
    pub fn submit_task_to_any_pool(&self, request: TaskRequest) -> Result<String> {
        let pool = self
            .pools()
            .into_iter()
            .filter(|pool| pool.is_running())
            .min_by_key(|pool| pool.queue_size())
            .ok_or_else(|| EngineError::TaskExecutionFailed("no running pools available".into()))?;

        debug!("Routing task to pool {}", pool.id());
        pool.submit_task(request)
    }

    pub fn get_global_status(&self) -> GlobalStatus {
        self.pools()
            .iter()
            .map(WorkerPool::get_status)
            .fold(GlobalStatus::default(), |mut global, status| {
                global.total_pools += 1;
                if status.state == PoolState::Running {
                    global.running_pools += 1;
                }
                global.total_workers += status.total_workers;
                global.idle_workers += status.idle_workers;
                global.busy_workers += status.busy_workers;
                global.queued_tasks += status.queue_size;
                global.active_tasks += status.active_tasks;
                global.completed_tasks += status.completed_tasks;
                global.memory_bytes += status.memory_bytes;
                global.pools.push(status);
                global
            })
    }

    pub fn get_global_metrics(&self) -> PoolMetrics {
        self.pools()
            .iter()
            .fold(PoolMetrics::default(), |mut total, pool| {
                total.merge(&pool.get_metrics());
                total
            })
    }

    /// Events from every pool
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Most recent events across all pools, oldest first
    pub fn event_history(&self) -> Vec<PoolEvent> {
        self.history.snapshot()
    }
}

async fn forward_events(
    mut receiver: broadcast::Receiver<PoolEvent>,
    bus: EventBus<PoolEvent>,
    history: Arc<EventHistory>,
    token: CancellationToken,
) {
    let relay = |event: PoolEvent| {
        history.push(event.clone());
        bus.publish(event);
    };

    loop {
        tokio::select! {
            biased;
            received = receiver.recv() => match received {
                Ok(event) => relay(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event forwarder lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = token.cancelled() => {
                // Drain what the pool published before it was stopped
                loop {
                    match receiver.try_recv() {
                        Ok(event) => relay(event),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
}

// src/pool/mod.rs
//! Worker pools: queueing, dispatch, scaling and supervision of worker
//! processes, plus the manager that owns a set of pools.

pub mod events;
pub mod load_balancer;
pub mod manager;
pub mod scaling;
pub mod task_queue;
pub mod types;
pub mod worker_factory;
pub mod worker_pool;

pub use events::{EventBus, PoolEvent, PoolEventKind};
pub use load_balancer::{BalancingStats, LoadBalancer};
pub use manager::{GlobalStatus, PoolManager};
pub use scaling::{ScalingDecision, ScalingEngine, ScalingEvent};
pub use task_queue::TaskQueue;
pub use types::{
    PoolMetrics, PoolState, PoolStatus, PoolTask, TaskOptions, TaskRequest, TaskResult,
    TaskStatus, WorkerProcess, WorkerStatus,
};
pub use worker_factory::WorkerFactory;
pub use worker_pool::WorkerPool;

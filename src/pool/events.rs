// src/pool/events.rs
//! Pool events and the broadcast bus that carries them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEventKind {
    PoolStarted { workers: usize },
    PoolStopped,
    WorkerSpawned { worker_id: String, slot: usize },
    WorkerTerminated { worker_id: String },
    WorkerFailed { worker_id: Option<String>, error: String },
    TaskQueued { task_id: String, priority: i32 },
    TaskAssigned { task_id: String, worker_id: String },
    TaskCompleted { task_id: String, worker_id: String, duration_ms: u64 },
    TaskFailed { task_id: String, worker_id: String, error: String },
    TaskCancelled { task_id: String },
    PoolScaled { from: usize, to: usize, reason: String },
    PoolError { error: String },
}

/// An event stamped with its pool and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PoolEventKind,
}

impl PoolEvent {
    pub fn new(pool_id: impl Into<String>, kind: PoolEventKind) -> Self {
        Self {
            pool_id: pool_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Single-producer-side fan-out; slow subscribers lag rather than block
#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish; having no subscribers is fine
    pub fn publish(&self, item: T) {
        if self.sender.send(item).is_err() {
            trace!("No subscribers for published item");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

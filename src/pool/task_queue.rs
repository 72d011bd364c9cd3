// src/pool/task_queue.rs
//! Priority task queue
//!
//! Lower numeric priority runs first; equal priorities run in submission
//! order. The queue never blocks: `dequeue` on an empty queue returns `None`
//! and the dispatch loop polls.

use crate::pool::types::PoolTask;
use crate::utils::errors::{EngineError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct QueuedTask {
    priority: i32,
    seq: i64,
    task: PoolTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: the "greatest" entry is the lowest priority
    // number, then the earliest sequence
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue of pending tasks
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    max_size: usize,
    /// Next sequence for new tasks (grows)
    next_seq: i64,
    /// Next sequence for requeued tasks (shrinks, so they sort first)
    front_seq: i64,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_size,
            next_seq: 0,
            front_seq: -1,
        }
    }

    /// Insert a task; fails when the queue is at capacity
    pub fn enqueue(&mut self, task: PoolTask) -> Result<()> {
        if self.is_full() {
            return Err(EngineError::QueueFull {
                max_size: self.max_size,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.push(task, seq);
        Ok(())
    }

    /// Put an already admitted task back at the head of its priority class.
    /// Capacity is not checked; the pool reserves room for retries at admission.
    pub fn requeue(&mut self, task: PoolTask) {
        let seq = self.front_seq;
        self.front_seq -= 1;
        self.push(task, seq);
    }

    fn push(&mut self, task: PoolTask, seq: i64) {
        self.heap.push(QueuedTask {
            priority: task.priority(),
            seq,
            task,
        });
    }

    /// Remove and return the most urgent task
    pub fn dequeue(&mut self) -> Option<PoolTask> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn peek(&self) -> Option<&PoolTask> {
        self.heap.peek().map(|entry| &entry.task)
    }

    /// Remove a specific task (cancellation)
    pub fn remove(&mut self, task_id: &str) -> Option<PoolTask> {
        if !self.contains(task_id) {
            return None;
        }
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| entry.task.id == task_id);
        self.heap = BinaryHeap::from(kept);
        removed.into_iter().next().map(|entry| entry.task)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|entry| entry.task.id == task_id)
    }

    /// Drop every pending task, returning them
    pub fn clear(&mut self) -> Vec<PoolTask> {
        self.heap.drain().map(|entry| entry.task).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

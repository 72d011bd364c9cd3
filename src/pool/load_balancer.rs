// src/pool/load_balancer.rs
//! Worker selection
//!
//! The balancer keeps its own view of the roster (id, slot, status,
//! completed-task count) which the pool updates on every transition.
//! Only idle workers are ever candidates.

use crate::pool::types::{PoolTask, WorkerProcess, WorkerStatus};
use crate::utils::config::LoadBalancingAlgorithm;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone)]
struct WorkerLoad {
    id: String,
    slot: usize,
    status: WorkerStatus,
    task_count: u64,
    selections: u64,
}

/// Selection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancingStats {
    pub algorithm: LoadBalancingAlgorithm,
    pub total_selections: u64,
    /// Share of all selections per worker id
    pub worker_utilization: HashMap<String, f64>,
    /// Mean selections per worker
    pub average_load: f64,
    /// `1 - variance / mean²` over selection counts, floored at 0
    pub balancing_efficiency: f64,
}

pub struct LoadBalancer {
    algorithm: LoadBalancingAlgorithm,
    /// Weights by slot
    weights: Vec<u32>,
    workers: Vec<WorkerLoad>,
    round_robin_index: usize,
    total_selections: u64,
}

impl LoadBalancer {
    pub fn new(algorithm: LoadBalancingAlgorithm, weights: Vec<u32>) -> Self {
        Self {
            algorithm,
            weights,
            workers: Vec::new(),
            round_robin_index: 0,
            total_selections: 0,
        }
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        self.algorithm
    }

    pub fn add_worker(&mut self, worker: &WorkerProcess) {
        if self.workers.iter().any(|w| w.id == worker.id) {
            return;
        }
        self.workers.push(WorkerLoad {
            id: worker.id.clone(),
            slot: worker.slot,
            status: worker.status,
            task_count: worker.task_count,
            selections: 0,
        });
    }

    pub fn remove_worker(&mut self, worker_id: &str) {
        self.workers.retain(|w| w.id != worker_id);
    }

    pub fn update_worker_status(&mut self, worker_id: &str, status: WorkerStatus) {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            worker.status = status;
        }
    }

    /// Count a finished task against the worker
    pub fn record_completion(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            worker.task_count += 1;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Pick an idle worker for `task`, or `None` if every worker is occupied
    pub fn select_worker(&mut self, task: &PoolTask) -> Option<String> {
        let idle: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.status == WorkerStatus::Idle)
            .map(|(i, _)| i)
            .collect();

        if idle.is_empty() {
            return None;
        }

        let chosen = match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => {
                let pick = idle[self.round_robin_index % idle.len()];
                self.round_robin_index = self.round_robin_index.wrapping_add(1);
                pick
            }
            // Candidates are idle, so the busy term of least-busy is always 0
            LoadBalancingAlgorithm::LeastConnections | LoadBalancingAlgorithm::LeastBusy => {
                *idle
                    .iter()
                    .min_by_key(|&&i| self.load_of(i))
                    .unwrap_or(&idle[0])
            }
            LoadBalancingAlgorithm::Random => idle[rand::thread_rng().gen_range(0..idle.len())],
            LoadBalancingAlgorithm::Weighted => self.pick_weighted(&idle),
        };

        let worker = &mut self.workers[chosen];
        worker.selections += 1;
        self.total_selections += 1;
        trace!("Selected worker {} for task {} ({:?})", worker.id, task.id, self.algorithm);
        Some(worker.id.clone())
    }

    fn load_of(&self, index: usize) -> u64 {
        let worker = &self.workers[index];
        let busy = u64::from(worker.status == WorkerStatus::Busy);
        worker.task_count + busy
    }

    fn pick_weighted(&self, idle: &[usize]) -> usize {
        if self.weights.is_empty() {
            return idle[0];
        }
        let weights: Vec<u32> = idle
            .iter()
            .map(|&i| self.weights.get(self.workers[i].slot).copied().unwrap_or(1))
            .collect();

        match WeightedIndex::new(&weights) {
            Ok(dist) => idle[dist.sample(&mut rand::thread_rng())],
            // All weights zero
            Err(_) => idle[0],
        }
    }

    pub fn balancing_stats(&self) -> BalancingStats {
        let total = self.total_selections;
        let worker_utilization = self
            .workers
            .iter()
            .map(|w| {
                let share = if total == 0 {
                    0.0
                } else {
                    w.selections as f64 / total as f64
                };
                (w.id.clone(), share)
            })
            .collect();

        let n = self.workers.len() as f64;
        let (average_load, balancing_efficiency) = if self.workers.is_empty() {
            (0.0, 1.0)
        } else {
            let mean = self.workers.iter().map(|w| w.selections as f64).sum::<f64>() / n;
            if mean == 0.0 {
                (0.0, 1.0)
            } else {
                let variance = self
                    .workers
                    .iter()
                    .map(|w| (w.selections as f64 - mean).powi(2))
                    .sum::<f64>()
                    / n;
                (mean, (1.0 - variance / (mean * mean)).max(0.0))
            }
        };

        BalancingStats {
            algorithm: self.algorithm,
            total_selections: total,
            worker_utilization,
            average_load,
            balancing_efficiency,
        }
    }
}

// src/pool/scaling.rs
//! Scaling decisions
//!
//! The engine never holds a reference to its pool. The pool hands it a
//! [`PoolStatus`] snapshot each tick and applies whatever [`ScalingAction`]
//! comes back.

use crate::pool::types::PoolStatus;
use crate::utils::config::{ScalingConfig, ScalingStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// Utilization `calculate_optimal_size` aims for
const TARGET_UTILIZATION: f64 = 0.7;

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    None,
    ScaleUp { count: usize, reason: String },
    ScaleDown { count: usize, reason: String },
}

/// A clamped scaling step the pool must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingAction {
    pub direction: ScalingDirection,
    pub count: usize,
    pub from: usize,
    pub to: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub direction: ScalingDirection,
    pub from_size: usize,
    pub to_size: usize,
    pub reason: String,
}

pub struct ScalingEngine {
    /// Strategy, thresholds and cooldowns
    config: ScalingConfig,

    /// Lower bound on live workers
    min_workers: usize,

    /// Upper bound on live workers
    max_workers: usize,

    /// Target size under the fixed strategy
    initial_workers: usize,

    /// When the last scale-up was recorded
    last_scale_up: Option<Instant>,

    /// When the last scale-down was recorded
    last_scale_down: Option<Instant>,

    /// Recent scaling events, oldest first
    history: VecDeque<ScalingEvent>,
}

impl ScalingEngine {
    pub fn new(config: ScalingConfig, min_workers: usize, max_workers: usize, initial_workers: usize) -> Self {
        Self {
            config,
            min_workers,
            max_workers,
            initial_workers,
            last_scale_up: None,
            last_scale_down: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn strategy(&self) -> ScalingStrategy {
        self.config.strategy
    }

    pub fn should_scale_up(&self, status: &PoolStatus) -> bool {
        if self.config.strategy == ScalingStrategy::Fixed {
            return false;
        }
        if within(self.last_scale_up, self.config.scale_up_cooldown()) {
            return false;
        }
        if status.total_workers >= self.max_workers {
            return false;
        }

        status.utilization() >= self.config.scale_up_threshold
            || (status.queue_size > 0 && status.idle_workers == 0)
    }

    pub fn should_scale_down(&self, status: &PoolStatus) -> bool {
        if self.config.strategy == ScalingStrategy::Fixed {
            return false;
        }
        if within(self.last_scale_down, self.config.scale_down_cooldown()) {
            return false;
        }
        if status.total_workers <= self.min_workers {
            return false;
        }

        status.utilization() <= self.config.scale_down_threshold
    }

    /// Pool size that would put utilization near 70%
    pub fn calculate_optimal_size(&self, status: &PoolStatus) -> usize {
        if self.config.strategy == ScalingStrategy::Fixed {
            return self.initial_workers;
        }
        let demand = (status.busy_workers + status.queue_size) as f64;
        let optimal = (demand / TARGET_UTILIZATION).ceil() as usize;
        optimal.clamp(self.min_workers, self.max_workers)
    }

    /// Decide at most one action for this tick
    pub fn evaluate(&self, status: &PoolStatus) -> ScalingDecision {
        if self.should_scale_up(status) {
            let optimal = self.calculate_optimal_size(status);
            let count = optimal.saturating_sub(status.total_workers).max(1);
            return ScalingDecision::ScaleUp {
                count,
                reason: format!(
                    "utilization {:.0}% with {} queued tasks",
                    status.utilization() * 100.0,
                    status.queue_size
                ),
            };
        }

        if self.should_scale_down(status) {
            let optimal = self.calculate_optimal_size(status);
            let count = status.total_workers.saturating_sub(optimal).max(1);
            return ScalingDecision::ScaleDown {
                count,
                reason: format!("utilization {:.0}%", status.utilization() * 100.0),
            };
        }

        ScalingDecision::None
    }

    /// Clamp a scale-up to `max_workers`, record it and start the cooldown
    pub fn execute_scale_up(&mut self, status: &PoolStatus, count: usize, reason: &str) -> Option<ScalingAction> {
        let from = status.total_workers;
        let to = (from + count).min(self.max_workers);
        if to <= from {
            return None;
        }
        self.last_scale_up = Some(Instant::now());
        Some(self.record(ScalingDirection::Up, from, to, reason))
    }

    /// Clamp a scale-down to `min_workers`, record it and start the cooldown
    pub fn execute_scale_down(&mut self, status: &PoolStatus, count: usize, reason: &str) -> Option<ScalingAction> {
        let from = status.total_workers;
        let to = from.saturating_sub(count).max(self.min_workers);
        if to >= from {
            return None;
        }
        self.last_scale_down = Some(Instant::now());
        Some(self.record(ScalingDirection::Down, from, to, reason))
    }

    fn record(&mut self, direction: ScalingDirection, from: usize, to: usize, reason: &str) -> ScalingAction {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(ScalingEvent {
            timestamp: Utc::now(),
            direction,
            from_size: from,
            to_size: to,
            reason: reason.to_string(),
        });

        ScalingAction {
            direction,
            count: from.abs_diff(to),
            from,
            to,
            reason: reason.to_string(),
        }
    }

    pub fn history(&self) -> Vec<ScalingEvent> {
        self.history.iter().cloned().collect()
    }
}

fn within(last: Option<Instant>, cooldown: std::time::Duration) -> bool {
    last.map(|at| at.elapsed() < cooldown).unwrap_or(false)
}

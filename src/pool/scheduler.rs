// src/pool/scheduler.rs
//! Load-balanced unit selection
//!
//! An idle unit is scored on health, idle time, error rate, and memory
//! footprint; the highest score wins the next task. The weights are
//! tunable defaults, not a contract.

use crate::unit::protocol::UnitId;
use std::time::Duration;

/// Scoring weights; must describe a convex combination in spirit, though
/// nothing enforces they sum to 1
#[derive(Debug, Clone, Copy)]
pub struct SchedulerWeights {
    pub health: f64,
    pub idle: f64,
    pub error: f64,
    pub memory: f64,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            health: 0.4,
            idle: 0.2,
            error: 0.3,
            memory: 0.1,
        }
    }
}

/// Inputs for scoring one idle unit
#[derive(Debug, Clone, Copy)]
pub struct UnitScoreInputs {
    /// Health signal in [0, 100]
    pub health_score: f64,

    /// Time since the unit last ran a task
    pub idle_time: Duration,

    /// tasks_errored / total tasks, in [0, 1]
    pub error_rate: f64,

    /// Last reported working set
    pub memory_usage_bytes: u64,

    /// Per-unit memory budget
    pub max_memory_bytes: u64,
}

/// Composite score; higher is a better dispatch target
pub fn score(weights: &SchedulerWeights, inputs: &UnitScoreInputs) -> f64 {
    let idle_score = (inputs.idle_time.as_millis() as f64 / 1000.0).min(100.0);
    let error_score = (100.0 - inputs.error_rate * 200.0).max(0.0);
    let memory_ratio = if inputs.max_memory_bytes == 0 {
        0.0
    } else {
        inputs.memory_usage_bytes as f64 / inputs.max_memory_bytes as f64
    };
    let memory_score = (100.0 - memory_ratio * 100.0).max(0.0);

    inputs.health_score * weights.health
        + idle_score * weights.idle
        + error_score * weights.error
        + memory_score * weights.memory
}

/// Highest score wins; ties break toward the first candidate seen
pub fn pick_best<I>(candidates: I) -> Option<UnitId>
where
    I: IntoIterator<Item = (UnitId, f64)>,
{
    let mut best: Option<(UnitId, f64)> = None;
    for (id, candidate_score) in candidates {
        match best {
            Some((_, best_score)) if candidate_score <= best_score => {}
            _ => best = Some((id, candidate_score)),
        }
    }
    best.map(|(id, _)| id)
}

// src/pool/stats.rs
//! Pool statistics
//!
//! Per-unit health accounting plus the aggregate snapshot returned by
//! `WorkerPool::stats()`.

use crate::pool::breaker::BreakerStats;
use crate::pool::queue::QueueDepths;
use crate::pool::task::TaskId;
use crate::unit::encoder::EncodedImage;
use crate::unit::protocol::UnitId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Mutable per-unit accounting
///
/// Health starts at 100, drops 10 per error, and recovers 1 per success.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub tasks_completed: u64,
    pub tasks_errored: u64,
    pub avg_processing_ms: f64,
    pub health_score: f64,
    pub last_activity: Instant,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            tasks_completed: 0,
            tasks_errored: 0,
            avg_processing_ms: 0.0,
            health_score: 100.0,
            last_activity: Instant::now(),
        }
    }

    pub fn record_success(&mut self, processing: Duration) {
        self.tasks_completed += 1;
        self.health_score = (self.health_score + 1.0).min(100.0);
        let ms = processing.as_secs_f64() * 1000.0;
        self.avg_processing_ms += (ms - self.avg_processing_ms) / self.tasks_completed as f64;
        self.last_activity = Instant::now();
    }

    pub fn record_error(&mut self) {
        self.tasks_errored += 1;
        self.health_score = (self.health_score - 10.0).max(0.0);
        self.last_activity = Instant::now();
    }

    /// Errored fraction of all finished attempts, in [0, 1]
    pub fn error_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_errored;
        if total == 0 {
            0.0
        } else {
            self.tasks_errored as f64 / total as f64
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one unit
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: UnitId,
    pub state: &'static str,
    pub tasks_completed: u64,
    pub tasks_errored: u64,
    pub avg_processing_time_ms: f64,
    pub health_score: f64,
    pub memory_usage_bytes: u64,
    pub restart_count: u32,
    pub fallback_mode: bool,
    pub last_activity_ms: u64,
}

/// Pool-wide counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_processing_time_ms: f64,
    pub peak_concurrent_units: usize,
    pub memory_usage_bytes: u64,
    pub uptime_ms: u64,
    pub restart_count: u64,
}

impl GlobalStats {
    pub fn record_completion(&mut self, processing: Duration) {
        self.completed_tasks += 1;
        let ms = processing.as_secs_f64() * 1000.0;
        self.avg_processing_time_ms +=
            (ms - self.avg_processing_time_ms) / self.completed_tasks as f64;
    }
}

/// Queue depths for the stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

impl From<QueueDepths> for QueueStats {
    fn from(depths: QueueDepths) -> Self {
        Self {
            high: depths.high,
            normal: depths.normal,
            low: depths.low,
            total: depths.total(),
        }
    }
}

/// Derived throughput/latency figures
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub avg_processing_time_ms: f64,
    pub avg_queue_wait_ms: f64,
    pub tasks_per_second: f64,
}

/// Aggregate snapshot returned by `WorkerPool::stats()`
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub global: GlobalStats,
    pub workers: Vec<WorkerSnapshot>,
    pub queue: QueueStats,
    pub circuit_breaker: BreakerStats,
    pub performance: PerformanceStats,
}

/// One entry in the bounded completed-task history
///
/// Holds the encoded output itself, so clearing the history under memory
/// pressure actually releases payload memory.
#[derive(Debug, Clone)]
pub struct CompletedTaskRecord {
    pub task_id: TaskId,
    pub unit_id: UnitId,
    pub output: EncodedImage,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

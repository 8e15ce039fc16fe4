// src/utils/config.rs
//! Pool configuration
//!
//! [`PoolConfig`] carries every construction knob with sane defaults;
//! [`PoolSettings`] layers an optional `pixelpress.toml` file under
//! `PIXELPRESS_`-prefixed environment overrides.

use crate::pool::capacity;
use crate::utils::errors::{PoolError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Construction configuration for the worker pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live execution units
    pub max_workers: usize,

    /// Floor the pool recovers toward after failures
    pub min_workers: usize,

    /// Per-task deadline in milliseconds (default: 5 minutes)
    pub task_timeout_ms: u64,

    /// Retry attempts before a task is finally rejected
    pub max_retries: u32,

    /// Health monitor period in milliseconds (default: 30s)
    pub health_check_interval_ms: u64,

    /// Memory monitor period in milliseconds (default: 60s)
    pub memory_check_interval_ms: u64,

    /// Memory budget per execution unit in bytes (default: 256MB)
    pub max_memory_per_worker_bytes: u64,

    /// Heap-pressure ratio that triggers history cleanup (default: 0.8)
    pub memory_cleanup_threshold: f64,

    /// Consecutive-failure count that opens the circuit breaker
    pub circuit_breaker_threshold: u32,

    /// Cool-down before the open breaker admits a probe (default: 60s)
    pub half_open_window_ms: u64,

    /// Idle time after which a unit becomes a recycle candidate (default: 5 minutes)
    pub worker_idle_timeout_ms: u64,

    /// Probability that one over-idle unit is recycled per health cycle.
    /// A leak-mitigation heuristic, not a guarantee.
    pub idle_recycle_probability: f64,

    /// Base delay for task-retry and unit-restart backoff (default: 1s)
    pub retry_base_delay_ms: u64,

    /// Backoff cap shared by task retries and unit restarts (default: 30s)
    pub retry_max_delay_ms: u64,

    /// Deadline for a freshly created unit to report Ready (default: 30s)
    pub unit_ready_timeout_ms: u64,

    /// Consecutive creation failures before a restart chain gives up
    pub max_restart_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: capacity::optimal_unit_count(),
            min_workers: 2,
            task_timeout_ms: 300_000,
            max_retries: 3,
            health_check_interval_ms: 30_000,
            memory_check_interval_ms: 60_000,
            max_memory_per_worker_bytes: 256 * 1024 * 1024,
            memory_cleanup_threshold: 0.8,
            circuit_breaker_threshold: 5,
            half_open_window_ms: 60_000,
            worker_idle_timeout_ms: 300_000,
            idle_recycle_probability: 0.10,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            unit_ready_timeout_ms: 30_000,
            max_restart_attempts: 5,
        }
    }
}

impl PoolConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig("max_workers cannot be 0".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.task_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig("task_timeout_ms cannot be 0".into()));
        }
        if !(0.0..=1.0).contains(&self.memory_cleanup_threshold) {
            return Err(PoolError::InvalidConfig(
                "memory_cleanup_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.idle_recycle_probability) {
            return Err(PoolError::InvalidConfig(
                "idle_recycle_probability must be within [0, 1]".into(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "circuit_breaker_threshold cannot be 0".into(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    pub fn unit_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_ready_timeout_ms)
    }
}

/// Settings for the demo binary workload
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of synthetic tasks to run
    pub task_count: usize,

    /// Payload size per synthetic task in bytes
    pub payload_bytes: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            task_count: 16,
            payload_bytes: 64 * 1024,
        }
    }
}

/// Layered settings: optional file source under environment overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub pool: PoolConfig,
    pub demo: DemoConfig,
}

impl PoolSettings {
    /// Load settings from `pixelpress.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::with_name("pixelpress").required(false))
            .add_source(config::Environment::with_prefix("PIXELPRESS").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.pool.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        settings.pool.validate()?;
        Ok(settings)
    }
}

// src/utils/errors.rs
//! Error types for the worker pool
//!
//! All pool operations return [`Result`]. Recoverable conditions (unit
//! crashes, retryable task failures) are handled inside the pool and never
//! reach the caller; only final rejections surface here.

use crate::pool::task::TaskId;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the worker pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid construction configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Settings file / environment parsing failed
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Tracing or metrics setup failed
    #[error("observability init failed: {0}")]
    Observability(String),

    /// No execution unit became ready during pool initialization
    #[error("pool initialization failed: {0}")]
    UnitInitialization(String),

    /// Circuit breaker is open, submission rejected without dispatch
    #[error("circuit breaker open, submission rejected")]
    CircuitOpen,

    /// Task exceeded its deadline and exhausted its retries
    #[error("task {id} timed out after {timeout_ms}ms")]
    TaskTimeout { id: TaskId, timeout_ms: u64 },

    /// Task failed on every allowed attempt
    #[error("task {id} failed after {attempts} attempt(s): {message}")]
    EncodingFailed {
        id: TaskId,
        message: String,
        attempts: u32,
    },

    /// Task failed with an error that is never retried
    #[error("task {id} rejected: {message}")]
    NonRetryable { id: TaskId, message: String },

    /// Task was cancelled by the caller
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// Pool is shutting down, new work is not accepted
    #[error("pool is shutting down")]
    ShuttingDown,

    /// The pool control loop is gone (handle outlived the pool)
    #[error("pool control loop unavailable")]
    PoolClosed,

    /// Batch stopped after its first failure (`abort_on_first_error`)
    #[error("batch aborted after first failure ({success_count} succeeded, {error_count} failed of {total_count})")]
    BatchAborted {
        success_count: usize,
        error_count: usize,
        total_count: usize,
    },
}

impl PoolError {
    /// True for errors that reject a submission before any dispatch
    pub fn is_rejection(&self) -> bool {
        matches!(self, PoolError::CircuitOpen | PoolError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_task_id() {
        let id = TaskId::new();
        let err = PoolError::Cancelled(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_rejection_classification() {
        assert!(PoolError::CircuitOpen.is_rejection());
        assert!(PoolError::ShuttingDown.is_rejection());
        assert!(!PoolError::PoolClosed.is_rejection());
    }
}

// src/pool/task.rs
//! Task model
//!
//! A task is one unit of image-encoding work: a payload, a priority, and
//! a result future. The pool owns the task from submission until its
//! ticket resolves.

use crate::unit::encoder::{EncodeRequest, EncodedImage};
use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use ulid::Ulid;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Scheduling tier. High drains before Normal, Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Progress callback: fraction in [0, 1] plus a short stage label
pub type ProgressFn = Arc<dyn Fn(f32, &str) + Send + Sync>;

/// Per-submission options
#[derive(Clone, Default)]
pub struct SubmitOptions {
    pub priority: TaskPriority,

    /// Per-task deadline override; pool default applies when None
    pub timeout: Option<Duration>,

    pub on_progress: Option<ProgressFn>,
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// A live task as the pool tracks it
pub struct Task {
    pub id: TaskId,
    pub request: EncodeRequest,
    pub priority: TaskPriority,
    pub submitted_at: Instant,
    pub timeout: Duration,
    pub retry_count: u32,
    pub cancelled: bool,
    pub on_progress: Option<ProgressFn>,
}

/// Terminal outcome delivered through a [`TaskTicket`]
pub type TaskResult = Result<EncodedImage>;

/// Handle to a submitted task's eventual result
///
/// `submit()` returns immediately; the encode resolves here.
pub struct TaskTicket {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskTicket {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<TaskResult>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Await the task's terminal result
    pub async fn wait(self) -> TaskResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::PoolClosed),
        }
    }
}

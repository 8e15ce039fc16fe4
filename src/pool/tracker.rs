// src/pool/tracker.rs
//! Task lifecycle tracking
//!
//! Every live task is in this map in exactly one phase: waiting in a
//! queue tier, assigned to a unit, or parked for a retry. The tracker
//! also keeps the bounded history of recently completed tasks.

use crate::pool::stats::CompletedTaskRecord;
use crate::pool::task::{Task, TaskId, TaskResult};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Bounded completed-task history size; oldest entries evicted first
pub const COMPLETED_HISTORY_CAP: usize = 100;

/// Where a live task currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// In a queue tier, waiting for a free unit
    Queued,

    /// Running on the given unit
    Assigned { unit_id: crate::unit::protocol::UnitId },

    /// Failed an attempt; its retry timer is pending
    RetryWait,
}

/// A task plus its runtime bookkeeping
pub struct TrackedTask {
    pub task: Task,
    pub phase: TaskPhase,
    pub result_tx: Option<oneshot::Sender<TaskResult>>,
    pub timeout_timer: Option<AbortHandle>,
    pub retry_timer: Option<AbortHandle>,
}

impl TrackedTask {
    pub fn new(task: Task, result_tx: oneshot::Sender<TaskResult>) -> Self {
        Self {
            task,
            phase: TaskPhase::Queued,
            result_tx: Some(result_tx),
            timeout_timer: None,
            retry_timer: None,
        }
    }

    /// Stop both pending timers, if any
    pub fn abort_timers(&mut self) {
        if let Some(timer) = self.timeout_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Deliver the terminal result; a dropped ticket is fine
    pub fn resolve(mut self, result: TaskResult) {
        self.abort_timers();
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(result);
        }
    }
}

/// Map of in-flight tasks plus the completed-task history
pub struct TaskTracker {
    tasks: HashMap<TaskId, TrackedTask>,
    history: VecDeque<CompletedTaskRecord>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            history: VecDeque::with_capacity(COMPLETED_HISTORY_CAP),
        }
    }

    pub fn register(&mut self, tracked: TrackedTask) {
        self.tasks.insert(tracked.task.id, tracked);
    }

    pub fn get(&self, id: &TaskId) -> Option<&TrackedTask> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TrackedTask> {
        self.tasks.get_mut(id)
    }

    /// Remove a task, stopping its timers
    pub fn take(&mut self, id: &TaskId) -> Option<TrackedTask> {
        let mut tracked = self.tasks.remove(id)?;
        tracked.abort_timers();
        Some(tracked)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    /// Append to the bounded history, evicting the oldest past the cap
    pub fn record_completion(&mut self, record: CompletedTaskRecord) {
        if self.history.len() == COMPLETED_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Drop the entire history, returning how many entries were freed
    pub fn clear_history(&mut self) -> usize {
        let dropped = self.history.len();
        self.history.clear();
        dropped
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

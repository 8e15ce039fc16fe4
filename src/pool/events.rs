// src/pool/events.rs
//! Typed lifecycle event bus
//!
//! Every observable pool transition is published as a [`PoolEvent`].
//! Subscribers get their own unbounded channel; a dropped or closed
//! [`Subscription`] unsubscribes itself, and publishing never blocks the
//! control loop.

use crate::pool::task::{TaskId, TaskPriority};
use crate::unit::protocol::UnitId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Lifecycle and statistics events
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Initialized {
        units: usize,
    },
    TaskQueued {
        task_id: TaskId,
        priority: TaskPriority,
        queue_depth: usize,
    },
    TaskProgress {
        task_id: TaskId,
        pct: f32,
        message: String,
    },
    TaskCompleted {
        task_id: TaskId,
        unit_id: UnitId,
        processing_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        retries: u32,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    WorkerFailed {
        unit_id: UnitId,
        reason: String,
    },
    WorkerRestarted {
        unit_id: UnitId,
    },
    CircuitBreakerOpen {
        failure_count: f64,
    },
    MemoryPressure {
        ratio: f64,
    },
    HealthCheck {
        live_units: usize,
        busy_units: usize,
        queued_tasks: usize,
    },
    ShutdownStarted,
    ShutdownCompleted,
    ShutdownError {
        message: String,
    },
    BatchCompleted {
        success_count: usize,
        error_count: usize,
        total_count: usize,
    },
    BatchFailed {
        success_count: usize,
        error_count: usize,
        total_count: usize,
    },
}

/// Publish/subscribe channel for pool events
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, UnboundedSender<PoolEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber; the returned handle unsubscribes on drop
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(id, tx);
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Fan an event out to every live subscriber
    pub fn publish(&self, event: PoolEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a subscriber's event stream
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    rx: UnboundedReceiver<PoolEvent>,
}

impl Subscription {
    /// Next event; None once the bus is gone and the backlog is drained
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll of the backlog
    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        self.rx.try_recv().ok()
    }

    /// Explicit unsubscribe (drop does the same)
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}

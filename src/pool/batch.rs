// src/pool/batch.rs
//! Batch orchestration
//!
//! Runs a list of encode requests through the pool under a bounded
//! in-flight window: the next request is dispatched the moment one
//! resolves, so the window stays full without ever exceeding the
//! requested concurrency.

use crate::pool::events::PoolEvent;
use crate::pool::manager::WorkerPool;
use crate::pool::task::{ProgressFn, SubmitOptions, TaskPriority};
use crate::unit::encoder::{EncodeRequest, EncodedImage};
use crate::utils::errors::{PoolError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Batch-level progress: completed fraction of the whole batch in [0, 1]
pub type BatchProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Per-item completion callback (batch index, output)
pub type TaskCompleteFn = Arc<dyn Fn(usize, &EncodedImage) + Send + Sync>;

/// Per-item failure callback (batch index, error)
pub type TaskErrorFn = Arc<dyn Fn(usize, &PoolError) + Send + Sync>;

/// Options for [`WorkerPool::process_batch`]
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// In-flight window; defaults to the pool size
    pub max_concurrency: Option<usize>,

    /// Priority applied to every task in the batch
    pub priority: TaskPriority,

    pub on_progress: Option<BatchProgressFn>,
    pub on_task_complete: Option<TaskCompleteFn>,
    pub on_task_error: Option<TaskErrorFn>,

    /// Stop dispatching after the first failure, drain what is already
    /// in flight, then reject the batch
    pub abort_on_first_error: bool,
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("priority", &self.priority)
            .field("abort_on_first_error", &self.abort_on_first_error)
            .finish()
    }
}

/// Aggregated batch outcome, indexed by position in the input list
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<(usize, EncodedImage)>,
    pub errors: Vec<(usize, PoolError)>,
    pub success_count: usize,
    pub error_count: usize,
    pub total_count: usize,
}

/// Fractional progress accounting shared with per-task callbacks
struct BatchProgress {
    total: usize,
    completed: AtomicUsize,
    in_flight: Mutex<HashMap<usize, f32>>,
    on_progress: Option<BatchProgressFn>,
}

impl BatchProgress {
    fn new(total: usize, on_progress: Option<BatchProgressFn>) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
            on_progress,
        }
    }

    fn update(&self, index: usize, pct: f32) {
        if self.on_progress.is_none() {
            return;
        }
        self.in_flight.lock().insert(index, pct.clamp(0.0, 1.0));
        self.report();
    }

    fn finish(&self, index: usize) {
        self.in_flight.lock().remove(&index);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.report();
    }

    fn report(&self) {
        let Some(on_progress) = &self.on_progress else {
            return;
        };
        let completed = self.completed.load(Ordering::Relaxed) as f64;
        let fractional: f64 = self.in_flight.lock().values().map(|pct| *pct as f64).sum();
        let fraction = ((completed + fractional) / self.total as f64).min(1.0);
        on_progress(fraction);
    }
}

impl WorkerPool {
    /// Encode a whole list under bounded concurrency
    ///
    /// Without `abort_on_first_error` the batch always runs to completion
    /// and reports per-item outcomes. With it, the first failure stops
    /// new dispatches and the call rejects once in-flight tasks drain.
    pub async fn process_batch(
        &self,
        requests: Vec<EncodeRequest>,
        opts: BatchOptions,
    ) -> Result<BatchReport> {
        let total_count = requests.len();
        if total_count == 0 {
            return Ok(BatchReport::default());
        }
        let width = opts
            .max_concurrency
            .unwrap_or(self.config().max_workers)
            .clamp(1, total_count);

        let progress = Arc::new(BatchProgress::new(total_count, opts.on_progress.clone()));
        let mut pending = requests.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut results = Vec::new();
        let mut errors: Vec<(usize, PoolError)> = Vec::new();
        let mut aborted = false;

        loop {
            // Keep the window full until the input (or the abort) stops us.
            while !aborted && in_flight.len() < width {
                let Some((index, request)) = pending.next() else {
                    break;
                };
                let per_task = Arc::clone(&progress);
                let on_progress: ProgressFn =
                    Arc::new(move |pct: f32, _msg: &str| per_task.update(index, pct));
                let submit_opts = SubmitOptions {
                    priority: opts.priority,
                    timeout: None,
                    on_progress: Some(on_progress),
                };
                match self.submit(request, submit_opts) {
                    Ok(ticket) => {
                        in_flight.push(async move { (index, ticket.wait().await) });
                    }
                    Err(error) => {
                        if let Some(on_task_error) = &opts.on_task_error {
                            on_task_error(index, &error);
                        }
                        errors.push((index, error));
                        progress.finish(index);
                        if opts.abort_on_first_error {
                            aborted = true;
                        }
                    }
                }
            }

            let Some((index, outcome)) = in_flight.next().await else {
                break;
            };
            progress.finish(index);
            match outcome {
                Ok(output) => {
                    if let Some(on_task_complete) = &opts.on_task_complete {
                        on_task_complete(index, &output);
                    }
                    results.push((index, output));
                }
                Err(error) => {
                    if let Some(on_task_error) = &opts.on_task_error {
                        on_task_error(index, &error);
                    }
                    errors.push((index, error));
                    if opts.abort_on_first_error {
                        aborted = true;
                    }
                }
            }
        }

        let success_count = results.len();
        let error_count = errors.len();
        if aborted {
            self.events().publish(PoolEvent::BatchFailed {
                success_count,
                error_count,
                total_count,
            });
            return Err(PoolError::BatchAborted {
                success_count,
                error_count,
                total_count,
            });
        }
        self.events().publish(PoolEvent::BatchCompleted {
            success_count,
            error_count,
            total_count,
        });
        Ok(BatchReport {
            results,
            errors,
            success_count,
            error_count,
            total_count,
        })
    }
}

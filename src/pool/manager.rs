// src/pool/manager.rs
//! Pool manager: unit lifecycle and the control loop
//!
//! A single tokio task owns every mutable map (units, queue, tracker,
//! stats, breaker) and runs an event-driven loop over caller commands,
//! unit events, timer firings, and monitor ticks. Nothing else touches
//! pool state, so there are no locks around it.
//!
//! ```text
//! WorkerPool (handle) ──commands──▶ ┌────────────────────┐
//!                                   │    control loop    │──▶ EventBus
//! unit threads ───────events──────▶ │  (sole state owner)│
//! timers ────────────deadlines────▶ └────────┬───────────┘
//!                                            │ Convert
//!                                            ▼
//!                                      unit threads
//! ```

use crate::pool::breaker::{BreakerState, CircuitBreaker};
use crate::pool::events::{EventBus, PoolEvent, Subscription};
use crate::pool::health;
use crate::pool::memory::{self, PressureAction};
use crate::pool::queue::TaskQueue;
use crate::pool::retry::{is_non_retryable_message, RetryPolicy};
use crate::pool::scheduler::{self, SchedulerWeights, UnitScoreInputs};
use crate::pool::stats::{
    CompletedTaskRecord, GlobalStats, PerformanceStats, PoolStats, WorkerSnapshot, WorkerStats,
};
use crate::pool::task::{SubmitOptions, Task, TaskId, TaskPriority, TaskResult, TaskTicket};
use crate::pool::tracker::{TaskPhase, TaskTracker, TrackedTask};
use crate::unit::encoder::{EncodeRequest, EncodedImage, Encoder, EncoderCapabilities};
use crate::unit::protocol::{FailureDetails, UnitEvent, UnitId, UnitRequest};
use crate::unit::worker::spawn_unit;
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Units created per batch during pool initialization
const UNIT_SPAWN_BATCH: usize = 2;

/// Pool-side view of one execution unit's life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Initializing,
    Idle,
    Busy,
    Failed,
    Terminated,
}

impl UnitState {
    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Initializing => "initializing",
            UnitState::Idle => "idle",
            UnitState::Busy => "busy",
            UnitState::Failed => "failed",
            UnitState::Terminated => "terminated",
        }
    }
}

/// Everything the pool owns about one unit
struct UnitRecord {
    id: UnitId,
    tx: crossbeam_channel::Sender<UnitRequest>,
    state: UnitState,
    capabilities: Option<EncoderCapabilities>,
    created_at: Instant,
    last_used_at: Instant,
    restart_count: u32,
    memory_usage_bytes: u64,
    init_timer: Option<AbortHandle>,
    is_replacement: bool,
}

/// 1:1 unit→task mapping while a unit is Busy
struct Assignment {
    task_id: TaskId,
    started_at: Instant,
    timeout: Duration,
    cancel: Arc<AtomicBool>,
    /// The task side already resolved (timeout/cancel); the unit is still
    /// draining and its terminal message will be discarded
    orphaned: bool,
}

/// Where a task failure was observed, for final-error mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorSource {
    Unit,
    Timeout,
}

/// Caller-facing commands
enum PoolCommand {
    Submit {
        id: TaskId,
        request: EncodeRequest,
        opts: SubmitOptions,
        result_tx: oneshot::Sender<TaskResult>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        force: bool,
        timeout: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// Internal deadline/retry/restart firings
enum TimerEvent {
    TaskDeadline { id: TaskId },
    RetryNow { id: TaskId },
    SpawnReplacement { attempt: u32 },
    UnitReadyDeadline { unit_id: UnitId },
}

/// Graceful-shutdown knobs
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// How long the drain waits for in-flight tasks
    pub timeout: Duration,

    /// Skip the drain and cancel everything immediately
    pub force: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            force: false,
        }
    }
}

/// Handle to a running worker pool
///
/// Cheap to clone; all clones talk to the same control loop. The pool is
/// caller-owned: construct with [`WorkerPool::initialize`], tear down
/// with [`WorkerPool::shutdown`].
#[derive(Clone)]
pub struct WorkerPool {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
    events: Arc<EventBus>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Build the pool and bring its execution units up
    ///
    /// Units are created in small batches; each must report Ready within
    /// the configured deadline. Fails only when no unit at all becomes
    /// ready.
    pub async fn initialize(config: PoolConfig, encoder: Arc<dyn Encoder>) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();

        let controller = Controller::new(config.clone(), encoder, Arc::clone(&events), cmd_rx);
        tokio::spawn(controller.run(init_tx));

        match init_rx.await {
            Ok(Ok(_ready)) => Ok(Self {
                cmd_tx,
                events,
                config,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::PoolClosed),
        }
    }

    /// Submit one encode. Never blocks; the result arrives on the ticket.
    pub fn submit(&self, request: EncodeRequest, opts: SubmitOptions) -> Result<TaskTicket> {
        let id = TaskId::new();
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Submit {
                id,
                request,
                opts,
                result_tx,
            })
            .map_err(|_| PoolError::PoolClosed)?;
        Ok(TaskTicket::new(id, result_rx))
    }

    /// Cancel a task wherever it sits. False when the id is unknown or
    /// already resolved.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCommand::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Cancel every live task, returning the ids that were cancelled
    pub async fn cancel_all_tasks(&self) -> Vec<TaskId> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCommand::CancelAll { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Point-in-time snapshot of global, per-unit, queue, breaker, and
    /// performance statistics
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| PoolError::PoolClosed)?;
        rx.await.map_err(|_| PoolError::PoolClosed)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Stop the pool. Without `force`, in-flight and queued tasks get up
    /// to `timeout` to drain; whatever remains is then force-cancelled.
    /// Calling again while (or after) shutting down is a no-op.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Shutdown {
                force: opts.force,
                timeout: opts.timeout,
                reply,
            })
            .is_err()
        {
            // Control loop already gone: nothing to stop.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

/// The control loop: sole owner of all mutable pool state
struct Controller {
    config: PoolConfig,
    encoder: Arc<dyn Encoder>,
    events: Arc<EventBus>,

    cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    unit_tx: mpsc::UnboundedSender<(UnitId, UnitEvent)>,
    unit_rx: mpsc::UnboundedReceiver<(UnitId, UnitEvent)>,

    units: HashMap<UnitId, UnitRecord>,
    available: Vec<UnitId>,
    assignments: HashMap<UnitId, Assignment>,
    queue: TaskQueue,
    tracker: TaskTracker,
    worker_stats: HashMap<UnitId, WorkerStats>,
    global: GlobalStats,
    breaker: CircuitBreaker,
    weights: SchedulerWeights,
    retry: RetryPolicy,

    timer_token: CancellationToken,
    next_unit_id: UnitId,
    started_at: Instant,
    shutting_down: bool,
    /// The submission admitted as the breaker's half-open probe, so a
    /// cancelled probe can release its slot
    probe_task_id: Option<TaskId>,
    queue_wait_total_ms: f64,
    queue_wait_samples: u64,
}

impl Controller {
    fn new(
        config: PoolConfig,
        encoder: Arc<dyn Encoder>,
        events: Arc<EventBus>,
        cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            Duration::from_millis(config.half_open_window_ms),
        );
        let retry = RetryPolicy::from_config(&config);
        Self {
            config,
            encoder,
            events,
            cmd_rx,
            timer_tx,
            timer_rx,
            unit_tx,
            unit_rx,
            units: HashMap::new(),
            available: Vec::new(),
            assignments: HashMap::new(),
            queue: TaskQueue::new(),
            tracker: TaskTracker::new(),
            worker_stats: HashMap::new(),
            global: GlobalStats::default(),
            breaker,
            weights: SchedulerWeights::default(),
            retry,
            timer_token: CancellationToken::new(),
            next_unit_id: 0,
            started_at: Instant::now(),
            shutting_down: false,
            probe_task_id: None,
            queue_wait_total_ms: 0.0,
            queue_wait_samples: 0,
        }
    }

    async fn run(mut self, init_tx: oneshot::Sender<Result<usize>>) {
        match self.initialize_units().await {
            Ok(ready) => {
                info!("Pool initialized with {} execution unit(s)", ready);
                self.events.publish(PoolEvent::Initialized { units: ready });
                if init_tx.send(Ok(ready)).is_err() {
                    self.teardown();
                    return;
                }
            }
            Err(e) => {
                self.teardown();
                let _ = init_tx.send(Err(e));
                return;
            }
        }

        let health_period = Duration::from_millis(self.config.health_check_interval_ms);
        let memory_period = Duration::from_millis(self.config.memory_check_interval_ms);
        let mut health_ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + health_period, health_period);
        let mut memory_ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + memory_period, memory_period);
        health_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        memory_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All pool handles dropped, tearing down");
                        self.shutting_down = true;
                        self.timer_token.cancel();
                        self.cancel_all_inner(true);
                        self.teardown();
                        break;
                    }
                },
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer),
                Some((unit_id, event)) = self.unit_rx.recv() => self.handle_unit_event(unit_id, event),
                _ = health_ticks.tick() => self.health_tick(),
                _ = memory_ticks.tick() => self.memory_tick(),
            }
        }
    }

    /// Create the initial units in bounded batches, waiting out each
    /// batch's Init→Ready round trip before starting the next
    async fn initialize_units(&mut self) -> Result<usize> {
        let target = self.config.max_workers;
        info!("Initializing pool with {} execution unit(s)", target);

        let mut created = 0;
        while created < target {
            let batch = UNIT_SPAWN_BATCH.min(target - created);
            for _ in 0..batch {
                if let Err(e) = self.create_unit(0, false) {
                    warn!("Failed to spawn execution unit: {}", e);
                }
                created += 1;
            }
            self.await_initializing().await;
        }

        let ready = self.available.len();
        if ready == 0 {
            return Err(PoolError::UnitInitialization(
                "no execution units became ready".into(),
            ));
        }
        Ok(ready)
    }

    async fn await_initializing(&mut self) {
        while self
            .units
            .values()
            .any(|unit| unit.state == UnitState::Initializing)
        {
            tokio::select! {
                Some((unit_id, event)) = self.unit_rx.recv() => self.handle_unit_event(unit_id, event),
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer),
            }
        }
    }

    async fn handle_command(&mut self, cmd: PoolCommand) -> bool {
        match cmd {
            PoolCommand::Submit {
                id,
                request,
                opts,
                result_tx,
            } => {
                self.on_submit(id, request, opts, result_tx);
                false
            }
            PoolCommand::Cancel { id, reply } => {
                let cancelled = self.cancel_task_inner(id, PoolError::Cancelled(id));
                let _ = reply.send(cancelled);
                false
            }
            PoolCommand::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all_inner(false));
                false
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot());
                false
            }
            PoolCommand::Shutdown {
                force,
                timeout,
                reply,
            } => self.on_shutdown(force, timeout, reply).await,
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::TaskDeadline { id } => self.on_task_deadline(id),
            TimerEvent::RetryNow { id } => self.on_retry_now(id),
            TimerEvent::SpawnReplacement { attempt } => self.on_spawn_replacement(attempt),
            TimerEvent::UnitReadyDeadline { unit_id } => self.on_unit_ready_deadline(unit_id),
        }
    }

    /// Exhaustive dispatch boundary for unit messages; no unit fault can
    /// escalate past this point
    fn handle_unit_event(&mut self, unit_id: UnitId, event: UnitEvent) {
        match event {
            UnitEvent::Ready { capabilities } => self.on_unit_ready(unit_id, capabilities),
            UnitEvent::Progress {
                task_id,
                pct,
                message,
            } => self.on_task_progress(task_id, pct, message),
            UnitEvent::Success {
                task_id,
                output,
                processing,
            } => self.on_task_success(unit_id, task_id, output, processing),
            UnitEvent::Error {
                task_id,
                message,
                details,
            } => self.on_unit_error(unit_id, task_id, message, details),
            UnitEvent::MemoryUsage { bytes } => self.on_memory_usage(unit_id, bytes),
        }
    }

    // ---- unit lifecycle ----------------------------------------------

    fn create_unit(&mut self, restart_attempt: u32, is_replacement: bool) -> Result<UnitId> {
        let id = self.next_unit_id;
        self.next_unit_id += 1;

        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        // The thread is detached; it exits on Terminate or disconnect.
        let _ = spawn_unit(id, Arc::clone(&self.encoder), req_rx, self.unit_tx.clone())
            .map_err(|e| PoolError::UnitInitialization(format!("thread spawn failed: {e}")))?;

        if req_tx.send(UnitRequest::Init).is_err() {
            return Err(PoolError::UnitInitialization(
                "unit request channel closed at startup".into(),
            ));
        }

        let init_timer = spawn_timer(
            &self.timer_tx,
            &self.timer_token,
            self.config.unit_ready_timeout(),
            TimerEvent::UnitReadyDeadline { unit_id: id },
        );

        let now = Instant::now();
        self.units.insert(
            id,
            UnitRecord {
                id,
                tx: req_tx,
                state: UnitState::Initializing,
                capabilities: None,
                created_at: now,
                last_used_at: now,
                restart_count: restart_attempt,
                memory_usage_bytes: 0,
                init_timer: Some(init_timer),
                is_replacement,
            },
        );
        debug!("Spawning execution unit {}", id);
        Ok(id)
    }

    fn on_unit_ready(&mut self, unit_id: UnitId, capabilities: EncoderCapabilities) {
        let Some(unit) = self.units.get_mut(&unit_id) else {
            return;
        };
        if unit.state != UnitState::Initializing {
            return;
        }
        if let Some(timer) = unit.init_timer.take() {
            timer.abort();
        }
        if capabilities.fallback_mode {
            warn!("Unit {} is running a fallback encoder", unit_id);
        }
        unit.capabilities = Some(capabilities);
        unit.state = UnitState::Idle;
        unit.last_used_at = Instant::now();
        let replacement = unit.is_replacement;

        self.worker_stats.insert(unit_id, WorkerStats::new());
        self.available.push(unit_id);
        debug!("Unit {} ready", unit_id);

        if replacement {
            self.global.restart_count += 1;
            counter!("pixelpress_pool_units_restarted").increment(1);
            self.events.publish(PoolEvent::WorkerRestarted { unit_id });
        }
        self.pull_next();
    }

    fn on_unit_ready_deadline(&mut self, unit_id: UnitId) {
        let Some(unit) = self.units.remove(&unit_id) else {
            return;
        };
        if unit.state != UnitState::Initializing {
            self.units.insert(unit_id, unit);
            return;
        }
        warn!(
            "Unit {} failed to become ready within {:?}",
            unit_id,
            self.config.unit_ready_timeout()
        );
        let _ = unit.tx.send(UnitRequest::Terminate);
        self.events.publish(PoolEvent::WorkerFailed {
            unit_id,
            reason: "initialization timeout".to_string(),
        });
        if !self.shutting_down && self.units.len() < self.config.min_workers {
            self.maybe_reschedule(unit.restart_count + 1);
        }
    }

    /// Remove a unit after an unrecoverable failure, routing its task
    /// through the retry decision first
    fn fail_unit(&mut self, unit_id: UnitId, reason: &str) {
        let Some(mut unit) = self.units.remove(&unit_id) else {
            return;
        };
        if let Some(timer) = unit.init_timer.take() {
            timer.abort();
        }
        unit.state = UnitState::Failed;
        self.available.retain(|id| *id != unit_id);
        self.worker_stats.remove(&unit_id);

        // The in-flight task is resolved or routed to retry before the
        // unit record disappears.
        if let Some(assignment) = self.assignments.remove(&unit_id) {
            assignment.cancel.store(true, Ordering::Relaxed);
            let live = self
                .tracker
                .get(&assignment.task_id)
                .map(|tracked| tracked.phase == (TaskPhase::Assigned { unit_id }))
                .unwrap_or(false);
            if !assignment.orphaned && live {
                self.note_failure();
                self.route_task_failure(
                    assignment.task_id,
                    format!("execution unit failed: {reason}"),
                    false,
                    ErrorSource::Unit,
                    Some(unit_id),
                );
            }
        }

        let _ = unit.tx.send(UnitRequest::Terminate);
        warn!("Unit {} failed: {}", unit_id, reason);
        counter!("pixelpress_pool_units_failed").increment(1);
        self.events.publish(PoolEvent::WorkerFailed {
            unit_id,
            reason: reason.to_string(),
        });
        self.maybe_reschedule(unit.restart_count + 1);
    }

    /// Gracefully retire an idle unit and schedule its replacement
    fn recycle_unit(&mut self, unit_id: UnitId) {
        let Some(unit) = self.units.remove(&unit_id) else {
            return;
        };
        self.available.retain(|id| *id != unit_id);
        self.worker_stats.remove(&unit_id);
        let _ = unit.tx.send(UnitRequest::Terminate);
        self.maybe_reschedule(unit.restart_count + 1);
    }

    fn maybe_reschedule(&mut self, attempt: u32) {
        if self.shutting_down {
            return;
        }
        if attempt > self.config.max_restart_attempts {
            error!(
                "Giving up on unit restart after {} attempts; pool may be degraded",
                attempt - 1
            );
            return;
        }
        let delay = self.retry.backoff_delay(attempt.saturating_sub(1));
        debug!("Scheduling unit restart (attempt {}) in {:?}", attempt, delay);
        spawn_timer(
            &self.timer_tx,
            &self.timer_token,
            delay,
            TimerEvent::SpawnReplacement { attempt },
        );
    }

    fn on_spawn_replacement(&mut self, attempt: u32) {
        if self.shutting_down || self.units.len() >= self.config.max_workers {
            return;
        }
        if let Err(e) = self.create_unit(attempt, true) {
            warn!("Unit restart failed: {}", e);
            if self.units.len() < self.config.min_workers {
                self.maybe_reschedule(attempt + 1);
            }
        }
    }

    // ---- submission and dispatch -------------------------------------

    fn on_submit(
        &mut self,
        id: TaskId,
        request: EncodeRequest,
        opts: SubmitOptions,
        result_tx: oneshot::Sender<TaskResult>,
    ) {
        if self.shutting_down {
            let _ = result_tx.send(Err(PoolError::ShuttingDown));
            return;
        }
        if !self.breaker.try_acquire() {
            counter!("pixelpress_pool_submissions_rejected").increment(1);
            let _ = result_tx.send(Err(PoolError::CircuitOpen));
            return;
        }
        if self.breaker.state() == BreakerState::HalfOpen {
            self.probe_task_id = Some(id);
        }

        let priority = opts.priority;
        let timeout = opts.timeout.unwrap_or_else(|| self.config.task_timeout());
        let task = Task {
            id,
            request,
            priority,
            submitted_at: Instant::now(),
            timeout,
            retry_count: 0,
            cancelled: false,
            on_progress: opts.on_progress,
        };
        let mut tracked = TrackedTask::new(task, result_tx);
        tracked.timeout_timer = Some(spawn_timer(
            &self.timer_tx,
            &self.timer_token,
            timeout,
            TimerEvent::TaskDeadline { id },
        ));
        self.tracker.register(tracked);
        self.global.total_tasks += 1;
        trace!("Accepted task {} ({:?})", id, priority);
        self.events.publish(PoolEvent::TaskQueued {
            task_id: id,
            priority,
            queue_depth: self.queue.len(),
        });
        self.dispatch_or_enqueue(id, priority);
    }

    fn dispatch_or_enqueue(&mut self, id: TaskId, priority: TaskPriority) {
        match self.pick_idle() {
            Some(unit_id) => self.start_assignment(unit_id, id),
            None => {
                self.queue.push(priority, id);
                gauge!("pixelpress_pool_queue_depth").set(self.queue.len() as f64);
            }
        }
    }

    fn pick_idle(&self) -> Option<UnitId> {
        let now = Instant::now();
        scheduler::pick_best(self.available.iter().filter_map(|id| {
            let unit = self.units.get(id)?;
            if unit.state != UnitState::Idle {
                return None;
            }
            let stats = self.worker_stats.get(id)?;
            let inputs = UnitScoreInputs {
                health_score: stats.health_score,
                idle_time: now.saturating_duration_since(unit.last_used_at),
                error_rate: stats.error_rate(),
                memory_usage_bytes: unit.memory_usage_bytes,
                max_memory_bytes: self.config.max_memory_per_worker_bytes,
            };
            Some((*id, scheduler::score(&self.weights, &inputs)))
        }))
    }

    fn start_assignment(&mut self, unit_id: UnitId, task_id: TaskId) {
        let now = Instant::now();
        let Some(tracked) = self.tracker.get_mut(&task_id) else {
            return;
        };
        let request = tracked.task.request.clone();
        let priority = tracked.task.priority;
        let timeout = tracked.task.timeout;
        let first_attempt = tracked.task.retry_count == 0;
        let wait_ms =
            now.saturating_duration_since(tracked.task.submitted_at).as_secs_f64() * 1000.0;
        let cancel = Arc::new(AtomicBool::new(false));

        let Some(unit) = self.units.get_mut(&unit_id) else {
            self.queue.push(priority, task_id);
            return;
        };
        match unit.tx.send(UnitRequest::Convert {
            task_id,
            request,
            cancel: Arc::clone(&cancel),
        }) {
            Ok(()) => {
                unit.state = UnitState::Busy;
                unit.last_used_at = now;
                self.available.retain(|id| *id != unit_id);
                self.assignments.insert(
                    unit_id,
                    Assignment {
                        task_id,
                        started_at: now,
                        timeout,
                        cancel,
                        orphaned: false,
                    },
                );
                tracked.phase = TaskPhase::Assigned { unit_id };
                if first_attempt {
                    self.queue_wait_total_ms += wait_ms;
                    self.queue_wait_samples += 1;
                }
                let busy = self.assignments.len();
                if busy > self.global.peak_concurrent_units {
                    self.global.peak_concurrent_units = busy;
                }
                gauge!("pixelpress_pool_busy_units").set(busy as f64);
                trace!("Dispatched task {} to unit {}", task_id, unit_id);
            }
            Err(_) => {
                warn!("Unit {} rejected dispatch, failing it", unit_id);
                self.fail_unit(unit_id, "request channel disconnected");
                self.note_failure();
                self.route_task_failure(
                    task_id,
                    "execution unit unavailable".to_string(),
                    false,
                    ErrorSource::Unit,
                    None,
                );
            }
        }
    }

    /// Return a unit to the idle set and feed it the next queued task
    fn release_unit(&mut self, unit_id: UnitId) {
        self.assignments.remove(&unit_id);
        let Some(unit) = self.units.get_mut(&unit_id) else {
            return;
        };
        if unit.state != UnitState::Busy {
            return;
        }
        unit.state = UnitState::Idle;
        unit.last_used_at = Instant::now();
        if !self.available.contains(&unit_id) {
            self.available.push(unit_id);
        }
        gauge!("pixelpress_pool_busy_units").set(self.assignments.len() as f64);
        self.pull_next();
    }

    fn pull_next(&mut self) {
        while !self.queue.is_empty() {
            let Some(unit_id) = self.pick_idle() else {
                break;
            };
            let Some(task_id) = self.queue.pop() else {
                break;
            };
            self.start_assignment(unit_id, task_id);
        }
        gauge!("pixelpress_pool_queue_depth").set(self.queue.len() as f64);
    }

    // ---- task resolution ---------------------------------------------

    fn on_task_progress(&mut self, task_id: TaskId, pct: f32, message: String) {
        if let Some(tracked) = self.tracker.get(&task_id) {
            if let Some(on_progress) = &tracked.task.on_progress {
                on_progress(pct, &message);
            }
            self.events.publish(PoolEvent::TaskProgress {
                task_id,
                pct,
                message,
            });
        }
    }

    fn on_task_success(
        &mut self,
        unit_id: UnitId,
        task_id: TaskId,
        output: EncodedImage,
        processing: Duration,
    ) {
        if let Some(stats) = self.worker_stats.get_mut(&unit_id) {
            stats.record_success(processing);
        }
        if let Some(tracked) = self.tracker.take(&task_id) {
            self.breaker.on_success();
            self.global.record_completion(processing);
            let processing_ms = (processing.as_secs_f64() * 1000.0) as u64;
            self.tracker.record_completion(CompletedTaskRecord {
                task_id,
                unit_id,
                output: output.clone(),
                processing_time_ms: processing_ms,
                completed_at: Utc::now(),
            });
            counter!("pixelpress_pool_tasks_completed").increment(1);
            self.events.publish(PoolEvent::TaskCompleted {
                task_id,
                unit_id,
                processing_ms,
            });
            tracked.resolve(Ok(output));
        } else {
            trace!("Dropping result for task {} (no longer tracked)", task_id);
        }
        self.release_unit(unit_id);
    }

    fn on_unit_error(
        &mut self,
        unit_id: UnitId,
        task_id: TaskId,
        message: String,
        details: FailureDetails,
    ) {
        debug!("Unit {} error on task {}: {}", unit_id, task_id, message);
        // Terminal reports from cancelled or timed-out attempts arrive
        // after the task already resolved; they must not count as
        // failures.
        let live = self
            .tracker
            .get(&task_id)
            .map(|tracked| tracked.phase == (TaskPhase::Assigned { unit_id }))
            .unwrap_or(false);
        if live {
            if let Some(stats) = self.worker_stats.get_mut(&unit_id) {
                stats.record_error();
            }
            self.note_failure();
            self.route_task_failure(
                task_id,
                message,
                details.fatal,
                ErrorSource::Unit,
                Some(unit_id),
            );
        } else {
            trace!("Dropping error for task {} (no longer tracked)", task_id);
        }
        if details.unit_fault {
            self.fail_unit(unit_id, "unit fault");
        } else {
            self.release_unit(unit_id);
        }
    }

    fn note_failure(&mut self) {
        if self.breaker.on_failure() {
            warn!(
                "Circuit breaker opened (failure count {:.1})",
                self.breaker.failure_count()
            );
            counter!("pixelpress_pool_breaker_opened").increment(1);
            self.events.publish(PoolEvent::CircuitBreakerOpen {
                failure_count: self.breaker.failure_count(),
            });
        }
    }

    /// Apply the retry decision to a failed attempt. `from_unit` guards
    /// against stale reports from attempts the task already left behind.
    fn route_task_failure(
        &mut self,
        task_id: TaskId,
        message: String,
        fatal: bool,
        source: ErrorSource,
        from_unit: Option<UnitId>,
    ) {
        let (queued, cancelled, retry_count, timeout) = {
            let Some(tracked) = self.tracker.get_mut(&task_id) else {
                return;
            };
            if let Some(unit_id) = from_unit {
                if tracked.phase != (TaskPhase::Assigned { unit_id }) {
                    return;
                }
            }
            if let Some(timer) = tracked.timeout_timer.take() {
                timer.abort();
            }
            (
                tracked.phase == TaskPhase::Queued,
                tracked.task.cancelled,
                tracked.task.retry_count,
                tracked.task.timeout,
            )
        };
        if queued {
            self.queue.remove(task_id);
        }

        let retryable = !self.shutting_down
            && self.retry.should_retry(retry_count, cancelled, fatal, &message);

        if retryable {
            let delay = self.retry.backoff_delay(retry_count);
            let timer = spawn_timer(
                &self.timer_tx,
                &self.timer_token,
                delay,
                TimerEvent::RetryNow { id: task_id },
            );
            if let Some(tracked) = self.tracker.get_mut(&task_id) {
                tracked.task.retry_count += 1;
                tracked.phase = TaskPhase::RetryWait;
                tracked.retry_timer = Some(timer);
            }
            counter!("pixelpress_pool_tasks_retried").increment(1);
            debug!(
                "Retrying task {} (attempt {}) in {:?}: {}",
                task_id,
                retry_count + 2,
                delay,
                message
            );
        } else if let Some(tracked) = self.tracker.take(&task_id) {
            self.global.failed_tasks += 1;
            let error = final_error(
                task_id,
                message,
                fatal,
                source,
                timeout,
                retry_count,
                cancelled,
            );
            counter!("pixelpress_pool_tasks_failed").increment(1);
            self.events.publish(PoolEvent::TaskFailed {
                task_id,
                error: error.to_string(),
                retries: retry_count,
            });
            tracked.resolve(Err(error));
        }
    }

    fn on_task_deadline(&mut self, id: TaskId) {
        let Some(tracked) = self.tracker.get(&id) else {
            return;
        };
        if tracked.phase == TaskPhase::RetryWait {
            return;
        }
        let timeout_ms = tracked.task.timeout.as_millis() as u64;
        if let TaskPhase::Assigned { unit_id } = tracked.phase {
            if let Some(assignment) = self.assignments.get_mut(&unit_id) {
                if assignment.task_id == id {
                    assignment.cancel.store(true, Ordering::Relaxed);
                    assignment.orphaned = true;
                }
            }
        }
        debug!("Task {} exceeded its {}ms deadline", id, timeout_ms);
        // A timed-out attempt is a task failure like any other.
        self.note_failure();
        self.route_task_failure(
            id,
            format!("task timed out after {timeout_ms}ms"),
            false,
            ErrorSource::Timeout,
            None,
        );
    }

    fn on_retry_now(&mut self, id: TaskId) {
        let (priority, timeout) = {
            let Some(tracked) = self.tracker.get_mut(&id) else {
                return;
            };
            if tracked.phase != TaskPhase::RetryWait {
                return;
            }
            tracked.retry_timer = None;
            tracked.phase = TaskPhase::Queued;
            (tracked.task.priority, tracked.task.timeout)
        };
        // Each attempt runs against a fresh deadline.
        let timer = spawn_timer(
            &self.timer_tx,
            &self.timer_token,
            timeout,
            TimerEvent::TaskDeadline { id },
        );
        if let Some(tracked) = self.tracker.get_mut(&id) {
            tracked.timeout_timer = Some(timer);
        }
        self.dispatch_or_enqueue(id, priority);
    }

    // ---- cancellation ------------------------------------------------

    fn cancel_task_inner(&mut self, id: TaskId, error: PoolError) -> bool {
        let Some(mut tracked) = self.tracker.take(&id) else {
            return false;
        };
        match tracked.phase {
            TaskPhase::Queued => {
                self.queue.remove(id);
            }
            TaskPhase::RetryWait => {}
            TaskPhase::Assigned { unit_id } => {
                if let Some(assignment) = self.assignments.get_mut(&unit_id) {
                    if assignment.task_id == id {
                        assignment.cancel.store(true, Ordering::Relaxed);
                        assignment.orphaned = true;
                    }
                }
            }
        }
        tracked.task.cancelled = true;
        // A cancelled probe resolves through neither success nor failure;
        // free its slot so the breaker cannot wedge half-open.
        if self.probe_task_id == Some(id) {
            self.probe_task_id = None;
            self.breaker.abandon_probe();
        }
        counter!("pixelpress_pool_tasks_cancelled").increment(1);
        self.events.publish(PoolEvent::TaskCancelled { task_id: id });
        tracked.resolve(Err(error));
        true
    }

    fn cancel_all_inner(&mut self, shutdown: bool) -> Vec<TaskId> {
        let ids = self.tracker.ids();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            let error = if shutdown {
                PoolError::ShuttingDown
            } else {
                PoolError::Cancelled(id)
            };
            if self.cancel_task_inner(id, error) {
                cancelled.push(id);
            }
        }
        cancelled
    }

    // ---- monitors ----------------------------------------------------

    fn health_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = Instant::now();

        // A hung unit is a different failure mode than a slow task: the
        // task deadline already fired at 1.0×, this trips at 1.2×.
        let stuck: Vec<UnitId> = self
            .assignments
            .iter()
            .filter(|(_, a)| health::is_stuck(a.started_at, a.timeout, now))
            .map(|(unit_id, _)| *unit_id)
            .collect();
        for unit_id in stuck {
            warn!("Unit {} stuck past its task deadline, restarting it", unit_id);
            self.fail_unit(unit_id, "health-check timeout");
        }

        let idle_timeout = self.config.worker_idle_timeout();
        let candidates: Vec<UnitId> = self
            .available
            .iter()
            .copied()
            .filter(|id| {
                self.units
                    .get(id)
                    .map(|unit| health::over_idle(unit.last_used_at, idle_timeout, now))
                    .unwrap_or(false)
            })
            .collect();
        if !candidates.is_empty() && health::roll(self.config.idle_recycle_probability) {
            if let Some(victim) = health::pick_recycle_candidate(&candidates) {
                info!("Recycling over-idle unit {}", victim);
                self.recycle_unit(victim);
            }
        }

        self.events.publish(PoolEvent::HealthCheck {
            live_units: self.units.len(),
            busy_units: self.assignments.len(),
            queued_tasks: self.queue.len(),
        });
    }

    fn memory_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let pressure = memory::measure(
            self.units.values().map(|unit| unit.memory_usage_bytes),
            self.config.max_memory_per_worker_bytes,
            self.config.max_workers,
        );
        self.global.memory_usage_bytes = pressure.used_bytes;
        gauge!("pixelpress_pool_memory_used_bytes").set(pressure.used_bytes as f64);

        match memory::classify(
            pressure.ratio,
            self.config.memory_cleanup_threshold,
            self.units.len(),
            self.config.min_workers,
        ) {
            PressureAction::None => {}
            PressureAction::ClearHistory => {
                let dropped = self.tracker.clear_history();
                debug!(
                    "Memory pressure {:.2}: dropped {} completed-task record(s)",
                    pressure.ratio, dropped
                );
            }
            PressureAction::ClearHistoryAndRecycle => {
                let dropped = self.tracker.clear_history();
                let oldest = self
                    .available
                    .iter()
                    .filter_map(|id| self.units.get(id).map(|unit| (*id, unit.created_at)))
                    .min_by_key(|(_, created_at)| *created_at)
                    .map(|(id, _)| id);
                warn!(
                    "Memory pressure {:.2}: dropped {} record(s), recycling oldest idle unit",
                    pressure.ratio, dropped
                );
                if let Some(unit_id) = oldest {
                    self.recycle_unit(unit_id);
                }
            }
        }
        self.events.publish(PoolEvent::MemoryPressure {
            ratio: pressure.ratio,
        });
    }

    fn on_memory_usage(&mut self, unit_id: UnitId, bytes: u64) {
        if let Some(unit) = self.units.get_mut(&unit_id) {
            unit.memory_usage_bytes = bytes;
        }
        let total: u64 = self.units.values().map(|unit| unit.memory_usage_bytes).sum();
        self.global.memory_usage_bytes = total;
    }

    // ---- shutdown ----------------------------------------------------

    async fn on_shutdown(
        &mut self,
        force: bool,
        timeout: Duration,
        reply: oneshot::Sender<()>,
    ) -> bool {
        if self.shutting_down {
            let _ = reply.send(());
            return false;
        }
        info!("Pool shutdown started (force: {})", force);
        self.shutting_down = true;
        self.events.publish(PoolEvent::ShutdownStarted);

        if !force && !self.tracker.is_empty() {
            // Event-driven drain: each unit event re-checks the live-task
            // count; no polling interval.
            let deadline = tokio::time::Instant::now() + timeout;
            while !self.tracker.is_empty() {
                tokio::select! {
                    Some((unit_id, event)) = self.unit_rx.recv() => self.handle_unit_event(unit_id, event),
                    Some(timer) = self.timer_rx.recv() => self.handle_timer(timer),
                    maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                        Some(cmd) => self.handle_drain_command(cmd),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            "Shutdown drain timed out with {} task(s) pending",
                            self.tracker.len()
                        );
                        break;
                    }
                }
            }
        }

        // Timers stay live through the drain so deadlines and pending
        // retries can still resolve their tasks; past this point nothing
        // may fire.
        self.timer_token.cancel();
        let leftovers = self.cancel_all_inner(true);
        if !leftovers.is_empty() {
            self.events.publish(PoolEvent::ShutdownError {
                message: format!("{} pending task(s) force-cancelled", leftovers.len()),
            });
        }
        self.teardown();
        self.events.publish(PoolEvent::ShutdownCompleted);
        info!("Pool shutdown complete");
        let _ = reply.send(());
        true
    }

    fn handle_drain_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Submit { result_tx, .. } => {
                let _ = result_tx.send(Err(PoolError::ShuttingDown));
            }
            PoolCommand::Cancel { id, reply } => {
                let cancelled = self.cancel_task_inner(id, PoolError::Cancelled(id));
                let _ = reply.send(cancelled);
            }
            PoolCommand::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all_inner(false));
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    fn teardown(&mut self) {
        for (_, unit) in self.units.drain() {
            let _ = unit.tx.send(UnitRequest::Terminate);
        }
        self.available.clear();
        self.assignments.clear();
        self.worker_stats.clear();
        self.queue.drain();
    }

    // ---- stats -------------------------------------------------------

    fn snapshot(&self) -> PoolStats {
        let now = Instant::now();
        let mut global = self.global.clone();
        global.uptime_ms = self.started_at.elapsed().as_millis() as u64;
        global.memory_usage_bytes = self
            .units
            .values()
            .map(|unit| unit.memory_usage_bytes)
            .sum();

        let workers = self
            .units
            .values()
            .map(|unit| {
                let stats = self.worker_stats.get(&unit.id).cloned().unwrap_or_default();
                WorkerSnapshot {
                    id: unit.id,
                    state: unit.state.label(),
                    tasks_completed: stats.tasks_completed,
                    tasks_errored: stats.tasks_errored,
                    avg_processing_time_ms: stats.avg_processing_ms,
                    health_score: stats.health_score,
                    memory_usage_bytes: unit.memory_usage_bytes,
                    restart_count: unit.restart_count,
                    fallback_mode: unit
                        .capabilities
                        .as_ref()
                        .map(|capabilities| capabilities.fallback_mode)
                        .unwrap_or(false),
                    last_activity_ms: now
                        .saturating_duration_since(stats.last_activity)
                        .as_millis() as u64,
                }
            })
            .collect();

        let uptime_secs = self.started_at.elapsed().as_secs_f64();
        let performance = PerformanceStats {
            avg_processing_time_ms: global.avg_processing_time_ms,
            avg_queue_wait_ms: if self.queue_wait_samples == 0 {
                0.0
            } else {
                self.queue_wait_total_ms / self.queue_wait_samples as f64
            },
            tasks_per_second: if uptime_secs > 0.0 {
                global.completed_tasks as f64 / uptime_secs
            } else {
                0.0
            },
        };

        PoolStats {
            global,
            workers,
            queue: self.queue.depths().into(),
            circuit_breaker: self.breaker.snapshot(),
            performance,
        }
    }
}

/// Map a final (non-retried) failure to the caller-facing error
fn final_error(
    id: TaskId,
    message: String,
    fatal: bool,
    source: ErrorSource,
    timeout: Duration,
    retry_count: u32,
    cancelled: bool,
) -> PoolError {
    if cancelled {
        PoolError::Cancelled(id)
    } else if source == ErrorSource::Timeout {
        PoolError::TaskTimeout {
            id,
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if fatal || is_non_retryable_message(&message) {
        PoolError::NonRetryable { id, message }
    } else {
        PoolError::EncodingFailed {
            id,
            message,
            attempts: retry_count + 1,
        }
    }
}

/// One-shot timer that reports back on the internal timer channel.
/// Cancelling the shared token silences every outstanding timer at once.
fn spawn_timer(
    timer_tx: &mpsc::UnboundedSender<TimerEvent>,
    token: &CancellationToken,
    delay: Duration,
    event: TimerEvent,
) -> AbortHandle {
    let tx = timer_tx.clone();
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = tx.send(event);
            }
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::encoder::{
        EncodeContext, EncodeError, EncodeOptions, OutputFormat, PassthroughEncoder,
    };
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_workers: 2,
            min_workers: 1,
            task_timeout_ms: 5_000,
            max_retries: 1,
            health_check_interval_ms: 60_000,
            memory_check_interval_ms: 60_000,
            circuit_breaker_threshold: 5,
            half_open_window_ms: 200,
            worker_idle_timeout_ms: 300_000,
            idle_recycle_probability: 0.0,
            retry_base_delay_ms: 20,
            retry_max_delay_ms: 100,
            unit_ready_timeout_ms: 5_000,
            max_restart_attempts: 3,
            ..Default::default()
        }
    }

    fn request() -> EncodeRequest {
        EncodeRequest::new(Bytes::from_static(b"image-bytes"), OutputFormat::Jpeg)
    }

    /// Succeeds after a fixed busy delay
    struct DelayEncoder(Duration);

    impl Encoder for DelayEncoder {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            std::thread::sleep(self.0);
            Ok(EncodedImage {
                data: request.payload,
                format: request.target_format,
            })
        }
    }

    /// Always fails with a fixed message
    struct AlwaysFail(&'static str);

    impl Encoder for AlwaysFail {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            _request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            std::thread::sleep(Duration::from_millis(5));
            Err(EncodeError::new(self.0))
        }
    }

    /// Fails until the switch flips, then succeeds after a short delay
    struct SwitchEncoder {
        failing: AtomicBool,
    }

    impl Encoder for SwitchEncoder {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            std::thread::sleep(Duration::from_millis(20));
            if self.failing.load(Ordering::Relaxed) {
                Err(EncodeError::new("encode crashed"))
            } else {
                Ok(EncodedImage {
                    data: request.payload,
                    format: request.target_format,
                })
            }
        }
    }

    /// Fails the first N attempts, then succeeds
    struct FlakyEncoder {
        remaining_failures: AtomicU32,
    }

    impl Encoder for FlakyEncoder {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            let remaining = self.remaining_failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::Relaxed);
                return Err(EncodeError::new("transient decode stall"));
            }
            Ok(EncodedImage {
                data: request.payload,
                format: request.target_format,
            })
        }
    }

    /// Emits the request's quality option as the output payload
    struct OptionsProbeEncoder;

    impl Encoder for OptionsProbeEncoder {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            let Some(quality) = request.options.quality else {
                return Err(EncodeError::fatal("invalid input: missing quality"));
            };
            Ok(EncodedImage {
                data: Bytes::from(vec![quality]),
                format: request.target_format,
            })
        }
    }

    /// Panics on the first encode, works afterwards
    struct PanicOnce {
        fired: AtomicBool,
    }

    impl Encoder for PanicOnce {
        fn capabilities(&self) -> EncoderCapabilities {
            PassthroughEncoder.capabilities()
        }

        fn encode(
            &self,
            request: EncodeRequest,
            _ctx: &EncodeContext<'_>,
        ) -> std::result::Result<EncodedImage, EncodeError> {
            if !self.fired.swap(true, Ordering::Relaxed) {
                panic!("simulated codec crash");
            }
            Ok(EncodedImage {
                data: request.payload,
                format: request.target_format,
            })
        }
    }

    #[tokio::test]
    async fn test_initialize_and_stats() {
        let pool = WorkerPool::initialize(test_config(), Arc::new(PassthroughEncoder))
            .await
            .unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 2);
        assert!(stats.workers.iter().all(|w| w.state == "idle"));
        assert_eq!(stats.circuit_breaker.state, "closed");
        assert_eq!(stats.queue.total, 0);

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // Scenario: 4 units, 10 short tasks; all resolve, concurrency stays
    // bounded by the pool size.
    #[tokio::test]
    async fn test_bounded_concurrency_under_load() {
        let config = PoolConfig {
            max_workers: 4,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(DelayEncoder(Duration::from_millis(50))),
        )
        .await
        .unwrap();

        let tickets: Vec<_> = (0..10)
            .map(|_| pool.submit(request(), SubmitOptions::default()).unwrap())
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.global.completed_tasks, 10);
        assert_eq!(stats.global.total_tasks, 10);
        assert_eq!(stats.global.failed_tasks, 0);
        assert!(stats.global.peak_concurrent_units >= 1);
        assert!(stats.global.peak_concurrent_units <= 4);
        assert!(stats.workers.iter().all(|w| w.state == "idle"));

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // Scenario: a non-retryable error is rejected without any retry.
    #[tokio::test]
    async fn test_non_retryable_error_skips_retries() {
        let pool = WorkerPool::initialize(test_config(), Arc::new(AlwaysFail("out of memory")))
            .await
            .unwrap();
        let mut events = pool.subscribe();

        let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
        match ticket.wait().await {
            Err(PoolError::NonRetryable { message, .. }) => {
                assert!(message.contains("out of memory"));
            }
            other => panic!("expected NonRetryable, got {other:?}"),
        }

        let mut failed_retries = None;
        while let Some(event) = events.try_recv() {
            if let PoolEvent::TaskFailed { retries, .. } = event {
                failed_retries = Some(retries);
            }
        }
        assert_eq!(failed_retries, Some(0));

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // Scenario: the breaker opens at the threshold, rejects while open,
    // admits exactly one probe after the window, and closes on success.
    #[tokio::test]
    async fn test_circuit_breaker_cycle() {
        let config = PoolConfig {
            max_workers: 1,
            max_retries: 0,
            ..test_config()
        };
        let encoder = Arc::new(SwitchEncoder {
            failing: AtomicBool::new(true),
        });
        let pool = WorkerPool::initialize(config, Arc::clone(&encoder) as Arc<dyn Encoder>)
            .await
            .unwrap();

        for _ in 0..5 {
            let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
            assert!(ticket.wait().await.is_err());
        }

        let stats = pool.stats().await.unwrap();
        assert!(stats.circuit_breaker.is_open);

        let rejected = pool.submit(request(), SubmitOptions::default()).unwrap();
        assert!(matches!(rejected.wait().await, Err(PoolError::CircuitOpen)));

        // Cool down, then let the probe succeed.
        tokio::time::sleep(Duration::from_millis(250)).await;
        encoder.failing.store(false, Ordering::Relaxed);

        let probe = pool.submit(request(), SubmitOptions::default()).unwrap();
        let crowded_out = pool.submit(request(), SubmitOptions::default()).unwrap();
        assert!(matches!(
            crowded_out.wait().await,
            Err(PoolError::CircuitOpen)
        ));
        probe.wait().await.unwrap();

        let after = pool.submit(request(), SubmitOptions::default()).unwrap();
        after.wait().await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.circuit_breaker.state, "closed");

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // A probe that times out must count as the probe's failure and send
    // the breaker back to Open; it must never wedge in HalfOpen.
    #[tokio::test]
    async fn test_timed_out_probe_reopens_breaker() {
        let config = PoolConfig {
            max_workers: 1,
            max_retries: 0,
            ..test_config()
        };
        let encoder = Arc::new(SwitchEncoder {
            failing: AtomicBool::new(true),
        });
        let pool = WorkerPool::initialize(config, Arc::clone(&encoder) as Arc<dyn Encoder>)
            .await
            .unwrap();

        for _ in 0..5 {
            let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
            assert!(ticket.wait().await.is_err());
        }
        let stats = pool.stats().await.unwrap();
        assert!(stats.circuit_breaker.is_open);

        // Cool down, then probe with a deadline the encode cannot meet.
        tokio::time::sleep(Duration::from_millis(250)).await;
        encoder.failing.store(false, Ordering::Relaxed);
        let probe = pool
            .submit(
                request(),
                SubmitOptions {
                    timeout: Some(Duration::from_millis(5)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(probe.wait().await, Err(PoolError::TaskTimeout { .. })));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.circuit_breaker.state, "open");

        // After another cool-down a healthy probe closes the breaker.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let retry_probe = pool.submit(request(), SubmitOptions::default()).unwrap();
        retry_probe.wait().await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.circuit_breaker.state, "closed");

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // A probe cancelled mid-flight resolves through neither success nor
    // failure; its slot must still be released.
    #[tokio::test]
    async fn test_cancelled_probe_releases_breaker() {
        let config = PoolConfig {
            max_workers: 1,
            max_retries: 0,
            ..test_config()
        };
        let encoder = Arc::new(SwitchEncoder {
            failing: AtomicBool::new(true),
        });
        let pool = WorkerPool::initialize(config, Arc::clone(&encoder) as Arc<dyn Encoder>)
            .await
            .unwrap();

        for _ in 0..5 {
            let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
            assert!(ticket.wait().await.is_err());
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        encoder.failing.store(false, Ordering::Relaxed);

        let probe = pool.submit(request(), SubmitOptions::default()).unwrap();
        let probe_id = probe.id();
        assert!(pool.cancel_task(probe_id).await);
        assert!(matches!(
            probe.wait().await,
            Err(PoolError::Cancelled(id)) if id == probe_id
        ));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.circuit_breaker.state, "open");

        // The freed slot admits a fresh probe, which closes the breaker.
        let retry_probe = pool.submit(request(), SubmitOptions::default()).unwrap();
        retry_probe.wait().await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.circuit_breaker.state, "closed");

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_encode_options_reach_encoder() {
        let pool = WorkerPool::initialize(test_config(), Arc::new(OptionsProbeEncoder))
            .await
            .unwrap();

        let request = EncodeRequest::new(Bytes::from_static(b"image-bytes"), OutputFormat::Jpeg)
            .with_options(EncodeOptions {
                quality: Some(82),
                max_width: Some(1280),
                strip_metadata: true,
                ..Default::default()
            });
        let ticket = pool.submit(request, SubmitOptions::default()).unwrap();
        let output = ticket.wait().await.unwrap();
        assert_eq!(output.data.as_ref(), &[82]);

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    // Scenario: graceful shutdown drains short in-flight tasks without
    // force-cancelling them.
    #[tokio::test]
    async fn test_graceful_shutdown_drains_active_tasks() {
        let pool = WorkerPool::initialize(
            test_config(),
            Arc::new(DelayEncoder(Duration::from_millis(200))),
        )
        .await
        .unwrap();
        let mut events = pool.subscribe();

        let first = pool.submit(request(), SubmitOptions::default()).unwrap();
        let second = pool.submit(request(), SubmitOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        pool.shutdown(ShutdownOptions {
            timeout: Duration::from_secs(5),
            force: false,
        })
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        first.wait().await.unwrap();
        second.wait().await.unwrap();

        let mut saw_completed = false;
        while let Some(event) = events.try_recv() {
            match event {
                PoolEvent::ShutdownError { .. } => panic!("drain should not force-cancel"),
                PoolEvent::ShutdownCompleted => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_completed);

        // Repeat call after completion is a quiet no-op.
        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_shutdown_rejects_pending_tasks() {
        let config = PoolConfig {
            max_workers: 1,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(DelayEncoder(Duration::from_millis(300))),
        )
        .await
        .unwrap();

        let active = pool.submit(request(), SubmitOptions::default()).unwrap();
        let queued = pool.submit(request(), SubmitOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown(ShutdownOptions {
            timeout: Duration::from_secs(5),
            force: true,
        })
        .await
        .unwrap();

        assert!(matches!(active.wait().await, Err(PoolError::ShuttingDown)));
        assert!(matches!(queued.wait().await, Err(PoolError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_high_priority_dispatched_before_normal() {
        let config = PoolConfig {
            max_workers: 1,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(DelayEncoder(Duration::from_millis(50))),
        )
        .await
        .unwrap();
        let mut events = pool.subscribe();

        let blocker = pool.submit(request(), SubmitOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let low = pool
            .submit(
                request(),
                SubmitOptions {
                    priority: TaskPriority::Low,
                    ..Default::default()
                },
            )
            .unwrap();
        let high = pool
            .submit(
                request(),
                SubmitOptions {
                    priority: TaskPriority::High,
                    ..Default::default()
                },
            )
            .unwrap();

        let low_id = low.id();
        let high_id = high.id();
        blocker.wait().await.unwrap();
        low.wait().await.unwrap();
        high.wait().await.unwrap();

        let mut completion_order = vec![];
        while let Some(event) = events.try_recv() {
            if let PoolEvent::TaskCompleted { task_id, .. } = event {
                completion_order.push(task_id);
            }
        }
        let high_pos = completion_order.iter().position(|id| *id == high_id);
        let low_pos = completion_order.iter().position(|id| *id == low_id);
        assert!(high_pos.unwrap() < low_pos.unwrap());

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let config = PoolConfig {
            max_workers: 1,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(DelayEncoder(Duration::from_millis(100))),
        )
        .await
        .unwrap();

        let blocker = pool.submit(request(), SubmitOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let victim = pool.submit(request(), SubmitOptions::default()).unwrap();
        let victim_id = victim.id();

        assert!(pool.cancel_task(victim_id).await);
        assert!(matches!(
            victim.wait().await,
            Err(PoolError::Cancelled(id)) if id == victim_id
        ));
        // Second cancel finds nothing.
        assert!(!pool.cancel_task(victim_id).await);

        blocker.wait().await.unwrap();
        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_resolved_task_returns_false() {
        let pool = WorkerPool::initialize(test_config(), Arc::new(PassthroughEncoder))
            .await
            .unwrap();

        let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
        let id = ticket.id();
        ticket.wait().await.unwrap();

        assert!(!pool.cancel_task(id).await);
        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let config = PoolConfig {
            max_retries: 2,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(FlakyEncoder {
                remaining_failures: AtomicU32::new(1),
            }),
        )
        .await
        .unwrap();

        let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
        let output = ticket.wait().await.unwrap();
        assert_eq!(output.data.as_ref(), b"image-bytes");

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.global.completed_tasks, 1);
        assert_eq!(stats.global.failed_tasks, 0);

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let config = PoolConfig {
            max_retries: 1,
            ..test_config()
        };
        let pool = WorkerPool::initialize(config, Arc::new(AlwaysFail("encode crashed")))
            .await
            .unwrap();

        let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
        match ticket.wait().await {
            Err(PoolError::EncodingFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected EncodingFailed, got {other:?}"),
        }

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_panic_restarts_worker_and_retries_task() {
        let config = PoolConfig {
            max_workers: 1,
            max_retries: 2,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(PanicOnce {
                fired: AtomicBool::new(false),
            }),
        )
        .await
        .unwrap();
        let mut events = pool.subscribe();

        let ticket = pool.submit(request(), SubmitOptions::default()).unwrap();
        ticket.wait().await.unwrap();

        let (mut saw_failed, mut saw_restarted) = (false, false);
        while let Some(event) = events.try_recv() {
            match event {
                PoolEvent::WorkerFailed { .. } => saw_failed = true,
                PoolEvent::WorkerRestarted { .. } => saw_restarted = true,
                _ => {}
            }
        }
        assert!(saw_failed);
        assert!(saw_restarted);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.global.restart_count, 1);

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_task_timeout_surfaces_and_pool_recovers() {
        let config = PoolConfig {
            max_workers: 1,
            max_retries: 0,
            ..test_config()
        };
        let pool = WorkerPool::initialize(
            config,
            Arc::new(DelayEncoder(Duration::from_millis(300))),
        )
        .await
        .unwrap();

        let slow = pool
            .submit(
                request(),
                SubmitOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .unwrap();
        match slow.wait().await {
            Err(PoolError::TaskTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected TaskTimeout, got {other:?}"),
        }

        // The unit drains its stale attempt and keeps serving.
        let next = pool.submit(request(), SubmitOptions::default()).unwrap();
        next.wait().await.unwrap();

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_reaches_caller() {
        let pool = WorkerPool::initialize(test_config(), Arc::new(PassthroughEncoder))
            .await
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ticket = pool
            .submit(
                request(),
                SubmitOptions {
                    on_progress: Some(Arc::new(move |pct: f32, _msg: &str| sink.lock().push(pct))),
                    ..Default::default()
                },
            )
            .unwrap();
        ticket.wait().await.unwrap();

        // Give the control loop a beat to flush trailing progress events.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reported = seen.lock().clone();
        assert!(reported.contains(&1.0));

        pool.shutdown(ShutdownOptions::default()).await.unwrap();
    }
}

// src/pool/breaker.rs
//! Circuit breaker
//!
//! Global failure-rate guard in front of submission. Closed admits
//! everything; Open rejects without touching a unit or queue; HalfOpen
//! admits exactly one probe after the cool-down and decides on its
//! outcome.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Serializable breaker snapshot for stats
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: &'static str,
    pub is_open: bool,
    pub failure_count: f64,
}

/// Failure-rate guard for new submissions
///
/// Failures add 1 to the count; successes decay it by 0.5, so sporadic
/// errors under healthy traffic never trip the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    half_open_window: Duration,
    state: BreakerState,
    failure_count: f64,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, half_open_window: Duration) -> Self {
        Self {
            threshold,
            half_open_window,
            state: BreakerState::Closed,
            failure_count: 0.0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }

    /// Gate a submission. Returns false when the submission must be
    /// rejected without dispatch.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = self
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.half_open_window)
                    .unwrap_or(true);
                if cooled_down {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a task success
    pub fn on_success(&mut self) {
        self.failure_count = (self.failure_count - 0.5).max(0.0);
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.probe_in_flight = false;
        }
    }

    /// Release a half-open probe that will never resolve (cancelled
    /// before its terminal outcome). Reopens without counting a failure;
    /// the slot is freed so a later acquire can admit a fresh probe.
    pub fn abandon_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.probe_in_flight = false;
        }
    }

    /// Record a unit or task failure. Returns true when this failure
    /// transitioned the breaker to Open.
    pub fn on_failure(&mut self) -> bool {
        self.failure_count += 1.0;
        self.last_failure_at = Some(Instant::now());
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.probe_in_flight = false;
                true
            }
            BreakerState::Closed if self.failure_count >= self.threshold as f64 => {
                self.state = BreakerState::Open;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    pub fn failure_count(&self) -> f64 {
        self.failure_count
    }

    pub fn snapshot(&self) -> BreakerStats {
        BreakerStats {
            state: self.state.label(),
            is_open: self.is_open(),
            failure_count: self.failure_count,
        }
    }
}

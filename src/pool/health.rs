// src/pool/health.rs
//! Health-monitor decisions
//!
//! Two distinct failure modes, deliberately kept apart: a slow task hits
//! its own deadline (task-level retry/reject), while a hung unit is
//! detected here at 1.2× that deadline and restarted. The idle recycle is
//! probabilistic leak mitigation, not a guarantee.

use crate::unit::protocol::UnitId;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};

/// Stuck threshold as a multiple of the task's own timeout
pub const STUCK_MULTIPLIER: f64 = 1.2;

/// True when an assignment has overrun its deadline by the stuck margin
pub fn is_stuck(started_at: Instant, task_timeout: Duration, now: Instant) -> bool {
    let elapsed = now.saturating_duration_since(started_at);
    elapsed.as_secs_f64() > task_timeout.as_secs_f64() * STUCK_MULTIPLIER
}

/// True when an idle unit has been unused past the idle timeout
pub fn over_idle(last_used_at: Instant, idle_timeout: Duration, now: Instant) -> bool {
    now.saturating_duration_since(last_used_at) > idle_timeout
}

/// Roll the per-cycle recycle dice
pub fn roll(probability: f64) -> bool {
    rand::random::<f64>() < probability
}

/// Choose the single unit to recycle this cycle
pub fn pick_recycle_candidate(candidates: &[UnitId]) -> Option<UnitId> {
    candidates.choose(&mut rand::thread_rng()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_needs_margin_past_timeout() {
        let now = Instant::now();
        let timeout = Duration::from_millis(1000);

        let just_over = now - Duration::from_millis(1100);
        assert!(!is_stuck(just_over, timeout, now));

        let well_over = now - Duration::from_millis(1300);
        assert!(is_stuck(well_over, timeout, now));
    }

    #[test]
    fn test_over_idle_boundary() {
        let now = Instant::now();
        let idle_timeout = Duration::from_millis(500);

        assert!(!over_idle(now - Duration::from_millis(400), idle_timeout, now));
        assert!(over_idle(now - Duration::from_millis(600), idle_timeout, now));
    }

    #[test]
    fn test_roll_extremes() {
        assert!(!roll(0.0));
        assert!(roll(1.0));
    }

    #[test]
    fn test_pick_candidate() {
        assert_eq!(pick_recycle_candidate(&[]), None);
        assert_eq!(pick_recycle_candidate(&[7]), Some(7));
        let picked = pick_recycle_candidate(&[1, 2, 3]).unwrap();
        assert!([1, 2, 3].contains(&picked));
    }
}

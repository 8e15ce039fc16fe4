// src/pool/memory.rs
//! Memory-monitor decisions
//!
//! Pressure is the ratio of unit-reported working sets to the pool's
//! total memory budget. Above the cleanup threshold the completed-task
//! history is dropped; above the recycle threshold the oldest idle unit
//! goes too, as long as the pool stays at or above its floor.

/// Ratio past which the oldest idle unit is recycled
pub const RECYCLE_THRESHOLD: f64 = 0.9;

/// Measured pressure
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressure {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub ratio: f64,
}

/// Response chosen for one monitor cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureAction {
    None,
    ClearHistory,
    ClearHistoryAndRecycle,
}

/// Sum unit working sets against the pool budget
pub fn measure<I>(unit_memory: I, per_worker_limit: u64, max_workers: usize) -> MemoryPressure
where
    I: IntoIterator<Item = u64>,
{
    let used_bytes: u64 = unit_memory.into_iter().sum();
    let limit_bytes = per_worker_limit.saturating_mul(max_workers as u64);
    let ratio = if limit_bytes == 0 {
        0.0
    } else {
        used_bytes as f64 / limit_bytes as f64
    };
    MemoryPressure {
        used_bytes,
        limit_bytes,
        ratio,
    }
}

/// Decide the cycle's response
pub fn classify(
    ratio: f64,
    cleanup_threshold: f64,
    live_units: usize,
    min_workers: usize,
) -> PressureAction {
    if ratio > RECYCLE_THRESHOLD && live_units > min_workers {
        PressureAction::ClearHistoryAndRecycle
    } else if ratio > cleanup_threshold {
        PressureAction::ClearHistory
    } else {
        PressureAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_ratio() {
        let pressure = measure([100, 200, 100], 100, 8);
        assert_eq!(pressure.used_bytes, 400);
        assert_eq!(pressure.limit_bytes, 800);
        assert!((pressure.ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_measure_empty() {
        let pressure = measure([], 256, 4);
        assert_eq!(pressure.used_bytes, 0);
        assert_eq!(pressure.ratio, 0.0);
    }

    #[test]
    fn test_classify_tiers() {
        assert_eq!(classify(0.5, 0.8, 4, 2), PressureAction::None);
        assert_eq!(classify(0.85, 0.8, 4, 2), PressureAction::ClearHistory);
        assert_eq!(
            classify(0.95, 0.8, 4, 2),
            PressureAction::ClearHistoryAndRecycle
        );
    }

    #[test]
    fn test_recycle_respects_worker_floor() {
        // At the floor, pressure still clears history but keeps the unit.
        assert_eq!(classify(0.95, 0.8, 2, 2), PressureAction::ClearHistory);
    }
}

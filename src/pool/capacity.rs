// src/pool/capacity.rs
//! Capacity planning
//!
//! Pool size is bounded by both CPU and memory: one core is reserved for
//! the control thread, and each unit is budgeted 256MB. The planner never
//! fails; it always returns at least 2 units and at most 6.

use tracing::debug;

/// Memory budgeted per execution unit when sizing the pool, in MB
const MEMORY_PER_UNIT_MB: u64 = 256;

/// Hard ceiling on planned units
const MAX_PLANNED_UNITS: usize = 6;

/// Compute the pool size for this host
pub fn optimal_unit_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let memory_mb = estimated_available_memory_mb(cores);
    let planned = plan(cores, memory_mb);
    debug!(
        "Capacity plan: {} units ({} cores, ~{}MB available)",
        planned, cores, memory_mb
    );
    planned
}

/// Pure sizing rule: `max(2, min(cores-1 clamped to [1,6], mem/256MB, 6))`
pub fn plan(cores: usize, available_memory_mb: u64) -> usize {
    let cpu_limit = cores.saturating_sub(1).clamp(1, MAX_PLANNED_UNITS);
    let memory_limit = (available_memory_mb / MEMORY_PER_UNIT_MB) as usize;
    cpu_limit.min(memory_limit).min(MAX_PLANNED_UNITS).max(2)
}

/// Estimate available memory in MB
///
/// Reads `/proc/meminfo` where present; otherwise falls back to a
/// device-class guess keyed on core count.
fn estimated_available_memory_mb(cores: usize) -> u64 {
    proc_available_memory_mb().unwrap_or_else(|| fallback_memory_mb(cores))
}

fn proc_available_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Small hosts are assumed memory-constrained, larger ones desktop-class
fn fallback_memory_mb(cores: usize) -> u64 {
    if cores <= 4 {
        4096
    } else {
        8192
    }
}

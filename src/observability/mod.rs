// src/observability/mod.rs
//! Metrics, tracing, and logging
//!
//! Called once from the binary entrypoint. Repeated initialization is a
//! no-op so tests can call these freely.

use crate::utils::errors::{PoolError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();
static METRICS: OnceCell<()> = OnceCell::new();

/// Initialize the tracing subscriber with env-filter support
///
/// Honors `RUST_LOG`; defaults to `info` when unset.
pub fn init_tracing() -> Result<()> {
    TRACING.get_or_try_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| PoolError::Observability(e.to_string()))
    })?;
    Ok(())
}

/// Install the Prometheus metrics exporter
///
/// Must run inside a Tokio runtime; the exporter serves scrapes on its
/// default listener.
pub fn init_metrics() -> Result<()> {
    METRICS.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install()
            .map_err(|e| PoolError::Observability(e.to_string()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing().unwrap();
        init_tracing().unwrap();
    }
}

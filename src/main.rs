// src/main.rs
//! Pixelpress pool demo binary
//!
//! Brings a pool up against the passthrough encoder, pushes a synthetic
//! batch through it, prints the stats snapshot, and shuts down cleanly.

use anyhow::Result;
use bytes::Bytes;
use pixelpress_pool::observability::{init_metrics, init_tracing};
use pixelpress_pool::pool::{BatchOptions, ShutdownOptions, WorkerPool};
use pixelpress_pool::unit::{EncodeOptions, EncodeRequest, OutputFormat, PassthroughEncoder};
use pixelpress_pool::utils::config::PoolSettings;
use std::sync::Arc;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, metrics, logging)
    init_tracing()?;
    init_metrics()?;

    info!("Starting Pixelpress pool demo v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = PoolSettings::load()?;
    info!("Configuration loaded: {:?}", settings.pool);

    // Bring the pool up
    let pool = WorkerPool::initialize(settings.pool.clone(), Arc::new(PassthroughEncoder)).await?;

    // Synthetic workload
    let payload = Bytes::from(vec![0u8; settings.demo.payload_bytes]);
    let options = EncodeOptions {
        quality: Some(82),
        strip_metadata: true,
        ..Default::default()
    };
    let requests: Vec<EncodeRequest> = (0..settings.demo.task_count)
        .map(|_| {
            EncodeRequest::new(payload.clone(), OutputFormat::WebP)
                .with_options(options.clone())
        })
        .collect();
    info!("Encoding {} synthetic payload(s)", requests.len());

    let batch_opts = BatchOptions {
        on_progress: Some(Arc::new(|fraction: f64| {
            debug!("Batch progress: {:.0}%", fraction * 100.0);
        })),
        ..Default::default()
    };

    tokio::select! {
        report = pool.process_batch(requests, batch_opts) => {
            let report = report?;
            info!(
                "Batch finished: {}/{} succeeded",
                report.success_count, report.total_count
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cleaning up...");
            pool.shutdown(ShutdownOptions {
                force: true,
                ..Default::default()
            })
            .await?;
            return Ok(());
        }
    }

    let stats = pool.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    pool.shutdown(ShutdownOptions::default()).await?;
    info!("Pool stopped gracefully");
    Ok(())
}

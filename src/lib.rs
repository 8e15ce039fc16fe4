// src/lib.rs
//! Pixelpress worker pool
//!
//! This library keeps CPU-bound image encoding off the application's
//! control thread: a bounded pool of isolated execution units, a
//! priority queue, load-balanced dispatch, failure recovery with
//! backoff, a circuit breaker, memory-pressure recycling, batch
//! orchestration, and graceful shutdown.
//!
//! # Architecture
//!
//! The crate is structured into three modules:
//!
//! - **pool**: the worker pool manager and its control loop
//! - **unit**: isolated execution units and the encoder seam
//! - **observability**: metrics, tracing, and logging setup
//!
//! # Example
//!
//! ```no_run
//! use pixelpress_pool::pool::{ShutdownOptions, SubmitOptions, WorkerPool};
//! use pixelpress_pool::unit::{EncodeRequest, OutputFormat, PassthroughEncoder};
//! use pixelpress_pool::utils::config::PoolConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> pixelpress_pool::utils::errors::Result<()> {
//! let pool = WorkerPool::initialize(PoolConfig::default(), Arc::new(PassthroughEncoder)).await?;
//!
//! let payload = bytes::Bytes::from_static(b"...image bytes...");
//! let ticket = pool.submit(
//!     EncodeRequest::new(payload, OutputFormat::WebP),
//!     SubmitOptions::default(),
//! )?;
//! let encoded = ticket.wait().await?;
//! println!("{} bytes as {}", encoded.data.len(), encoded.format.mime());
//!
//! pool.shutdown(ShutdownOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod observability;
pub mod pool;
pub mod unit;
pub mod utils;

// Re-export commonly used types
pub use pool::{
    BatchOptions, BatchReport, PoolEvent, PoolStats, ShutdownOptions, SubmitOptions, TaskId,
    TaskPriority, TaskTicket, WorkerPool,
};
pub use unit::{EncodeOptions, EncodeRequest, EncodedImage, Encoder, OutputFormat};
pub use utils::config::{PoolConfig, PoolSettings};
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

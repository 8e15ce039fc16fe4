// src/unit/mod.rs
//! Isolated execution units
//!
//! A unit is one dedicated OS thread running one encode at a time. Units
//! share no memory with the pool or each other; every interaction is a
//! message:
//!
//! ```text
//! Control loop                      Unit thread
//!     │  ──── Init ────────────────────▶ │
//!     │  ◀─── Ready{capabilities} ────── │
//!     │  ──── Convert{id, payload} ────▶ │
//!     │  ◀─── Progress{id, pct} ──────── │  (zero or more)
//!     │  ◀─── Success{id} | Error{id} ── │  (exactly one)
//!     │  ◀─── MemoryUsage{bytes} ─────── │
//! ```

pub mod encoder;
pub mod protocol;
pub mod worker;

pub use encoder::{
    EncodeError, EncodeOptions, EncodeRequest, EncodedImage, Encoder, EncoderCapabilities,
    OutputFormat, PassthroughEncoder,
};
pub use protocol::{FailureDetails, UnitEvent, UnitId, UnitRequest};
pub use worker::spawn_unit;

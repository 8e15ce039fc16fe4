// src/unit/encoder.rs
//! Encoding seam for execution units
//!
//! The pool never looks inside an encode operation; it only moves payloads
//! in and results out. [`Encoder`] is the boundary the actual codec plugs
//! into. [`PassthroughEncoder`] is the built-in fallback used by the demo
//! binary and tests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Target image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
}

impl OutputFormat {
    /// MIME type for this format
    pub fn mime(&self) -> &str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }

    /// File extension for this format
    pub fn extension(&self) -> &str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
            OutputFormat::Avif => "avif",
        }
    }
}

/// Per-task encoding options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodeOptions {
    /// Quality in [1, 100] for lossy formats
    pub quality: Option<u8>,

    /// Downscale bound on width
    pub max_width: Option<u32>,

    /// Downscale bound on height
    pub max_height: Option<u32>,

    /// Drop EXIF and other metadata blocks
    pub strip_metadata: bool,
}

/// One unit of encoding work
///
/// The payload is `Bytes`, so handing it to a unit moves a refcount, not
/// the image.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub payload: Bytes,
    pub target_format: OutputFormat,
    pub options: EncodeOptions,
}

impl EncodeRequest {
    pub fn new(payload: Bytes, target_format: OutputFormat) -> Self {
        Self {
            payload,
            target_format,
            options: EncodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EncodeOptions) -> Self {
        self.options = options;
        self
    }
}

/// A finished encode
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub format: OutputFormat,
}

/// Unit-side encode failure
///
/// `fatal` marks faults no retry can fix (corrupt input, unsupported
/// codec path); the pool's retry policy honors it.
#[derive(Debug, Clone)]
pub struct EncodeError {
    pub message: String,
    pub fatal: bool,
}

impl EncodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EncodeError {}

/// What an encoder advertises when its unit reports Ready
#[derive(Debug, Clone)]
pub struct EncoderCapabilities {
    /// Formats this encoder can produce
    pub formats: Vec<OutputFormat>,

    /// True when running a degraded/fallback codec path
    pub fallback_mode: bool,
}

/// Execution context handed to the encoder for one task
pub struct EncodeContext<'a> {
    progress: &'a (dyn Fn(f32, &str) + 'a),
    cancelled: &'a AtomicBool,
}

impl<'a> EncodeContext<'a> {
    pub fn new(progress: &'a (dyn Fn(f32, &str) + 'a), cancelled: &'a AtomicBool) -> Self {
        Self { progress, cancelled }
    }

    /// Report fractional progress in [0, 1] with a short stage label
    pub fn report(&self, pct: f32, message: &str) {
        (self.progress)(pct.clamp(0.0, 1.0), message);
    }

    /// Cooperative cancellation: encoders should poll this between stages
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// The codec boundary
///
/// Implementations run on a dedicated unit thread, one task at a time.
/// They must be cheap to share (`Arc<dyn Encoder>` is cloned per unit).
pub trait Encoder: Send + Sync + 'static {
    /// Advertised capabilities, carried in the unit's Ready message
    fn capabilities(&self) -> EncoderCapabilities;

    /// Encode one request, reporting progress and honoring cancellation
    fn encode(
        &self,
        request: EncodeRequest,
        ctx: &EncodeContext<'_>,
    ) -> std::result::Result<EncodedImage, EncodeError>;
}

/// Fallback encoder: returns the payload untouched
///
/// Stands in where no real codec is linked; the demo binary and most
/// tests run on it.
#[derive(Debug, Default)]
pub struct PassthroughEncoder;

impl Encoder for PassthroughEncoder {
    fn capabilities(&self) -> EncoderCapabilities {
        EncoderCapabilities {
            formats: vec![
                OutputFormat::Jpeg,
                OutputFormat::Png,
                OutputFormat::WebP,
                OutputFormat::Avif,
            ],
            fallback_mode: true,
        }
    }

    fn encode(
        &self,
        request: EncodeRequest,
        ctx: &EncodeContext<'_>,
    ) -> std::result::Result<EncodedImage, EncodeError> {
        if request.payload.is_empty() {
            return Err(EncodeError::fatal("invalid input: empty payload"));
        }
        ctx.report(0.5, "copying");
        if ctx.is_cancelled() {
            return Err(EncodeError::new("task cancelled"));
        }
        ctx.report(1.0, "done");
        Ok(EncodedImage {
            data: request.payload,
            format: request.target_format,
        })
    }
}

// src/unit/protocol.rs
//! Control ↔ unit message protocol
//!
//! Two tagged unions cover every exchange. The control loop matches
//! exhaustively on [`UnitEvent`], so a protocol change cannot slip past
//! the dispatch boundary.
//!
//! ```text
//! control → unit   Init                     unit → control   Ready
//! control → unit   Convert{id, payload}     unit → control   Progress* then Success | Error
//! control → unit   Terminate                unit → control   MemoryUsage (freestanding)
//! ```

use crate::pool::task::TaskId;
use crate::unit::encoder::{EncodeRequest, EncodedImage, EncoderCapabilities};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Unit identifier, unique per incarnation (a restarted unit gets a new id)
pub type UnitId = u32;

/// Requests sent from the control loop to a unit
pub enum UnitRequest {
    /// Start up; the unit answers with Ready once its encoder is usable
    Init,

    /// Encode one task. The cancellation flag belongs to this attempt and
    /// is polled cooperatively by the encoder.
    Convert {
        task_id: TaskId,
        request: EncodeRequest,
        cancel: Arc<AtomicBool>,
    },

    /// Exit the unit thread after the current message
    Terminate,
}

/// Events sent from a unit back to the control loop
pub enum UnitEvent {
    /// Initialization finished; capabilities carry the fallback flag
    Ready { capabilities: EncoderCapabilities },

    /// Fractional progress for the in-flight task
    Progress {
        task_id: TaskId,
        pct: f32,
        message: String,
    },

    /// Terminal: the task encoded successfully
    Success {
        task_id: TaskId,
        output: EncodedImage,
        processing: Duration,
    },

    /// Terminal: the task failed on this unit
    Error {
        task_id: TaskId,
        message: String,
        details: FailureDetails,
    },

    /// Freestanding working-set report, sent after each task
    MemoryUsage { bytes: u64 },
}

/// Failure classification attached to a unit-side error
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureDetails {
    /// Never retry, regardless of the retry budget
    pub fatal: bool,

    /// The unit itself is compromised (panic, poisoned state) and must be
    /// failed and restarted, not just the task
    pub unit_fault: bool,
}

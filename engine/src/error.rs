//! Error types for the Courtside engine.
//!
//! The taxonomy follows how failures propagate:
//! - transport failures are retried by the caller and only ever surface as
//!   a liveness indicator,
//! - write rejections and timeouts are surfaced per mutation and roll the
//!   optimistic effect back,
//! - validation failures are raised before any optimistic effect is shown.
//!
//! Reconciliation conflicts are not errors; they are resolved
//! deterministically and reported in [`crate::ReconcileResult`].

use crate::{CollectionName, OperationId, RecordId};
use thiserror::Error;

/// All possible errors from the Courtside engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Write lifecycle errors
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("write {op_id} timed out after {after_ms}ms")]
    WriteTimedOut { op_id: OperationId, after_ms: u64 },

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("sync queue closed")]
    QueueClosed,
}

impl Error {
    /// Whether the failure came from the network rather than the backing
    /// store's judgement of the write.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::WriteTimedOut { .. } | Error::QueueClosed
        )
    }

    /// Whether the error was raised by local validation, before anything
    /// became visible.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error taxonomy for the sync engine
//!
//! Every failure a session can hit maps onto one variant here. The variant
//! decides whether the error is retried, routed to conflict resolution, or
//! surfaced to the operator.

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Block or file content does not match its recorded digest, or two
    /// different byte sequences produced the same digest. Never retried.
    #[error("integrity check failed for {subject}: {detail}")]
    Integrity { subject: String, detail: String },

    /// Network or storage hiccup while moving data. Retried with backoff.
    #[error("transient transfer failure during {operation}: {detail}")]
    TransientTransfer { operation: String, detail: String },

    /// A transient failure that survived every retry attempt.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    TransferExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    /// Remote head moved since this client last observed it.
    #[error("remote manifest for {path} diverged from the last observed version")]
    ManifestConflict { path: String },

    /// File is too large (or splits into too many blocks) to sync.
    #[error("{path} exceeds capacity: {detail}")]
    CapacityExceeded { path: String, detail: String },

    /// Local edits that have not been synced would be overwritten.
    #[error("{path} has local changes that are not synced yet")]
    UnsyncedChanges { path: String },

    /// Path that would resolve outside the scope root.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("session cancelled")]
    Cancelled,

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("directory walk failed: {0}")]
    Walk(#[from] ignore::Error),

    #[error("storage error: {0}")]
    Storage(#[from] heed::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn integrity(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TransientTransfer {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Whether a retry may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransfer { .. })
    }

    /// Errors that end the session for this file and must reach the operator
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. }
                | Self::CapacityExceeded { .. }
                | Self::InvalidPath { .. }
                | Self::TransferExhausted { .. }
        )
    }
}

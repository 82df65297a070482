//! Sync sessions and their state machine
//!
//! ```text
//! Idle -> Scanning -> Diffing -> Clean -> Idle
//!                             -> HasChanges -> Transferring -> Committing -> Idle
//!                                           -> Resolving -> Transferring
//!                                           -> Committing
//! ```
//!
//! `Cancelled` and `Failed` are reachable from every non-terminal state and
//! end the session.

use std::fmt;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::manifest::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Diffing,
    Clean,
    HasChanges,
    Resolving,
    Transferring,
    Committing,
    Cancelled,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed)
    }

    /// Whether the machine allows moving from `self` to `next`
    #[must_use]
    pub fn can_advance(self, next: Self) -> bool {
        use SessionState::{
            Cancelled, Clean, Committing, Diffing, Failed, HasChanges, Idle, Resolving, Scanning,
            Transferring,
        };

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Cancelled | Failed)
                | (Idle, Scanning)
                | (Scanning, Diffing)
                | (Diffing, Clean | HasChanges)
                | (Clean, Idle)
                | (HasChanges, Transferring | Resolving | Committing)
                | (Resolving, Transferring | Committing)
                | (Transferring, Committing)
                // A remote commit lost to a concurrent writer goes back to resolution
                | (Committing, Idle | Resolving)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One pass of the change detector over one path
#[derive(Debug)]
pub struct SyncSession {
    pub id: Uuid,
    pub scope_root: PathBuf,
    pub path: String,
    pub started_at_ms: i64,
    state: SessionState,
    cancel: CancellationToken,
}

impl SyncSession {
    #[must_use]
    pub fn new(scope_root: PathBuf, path: &str, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope_root,
            path: path.to_string(),
            started_at_ms: now_ms(),
            state: SessionState::Idle,
            cancel,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `next`, rejecting transitions the machine doesn't have
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance(next) {
            return Err(SyncError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        trace!(session = %self.id, path = %self.path, from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Fail fast with [`SyncError::Cancelled`] once the token fires
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Move to the terminal state matching `err`
    pub fn fail(&mut self, err: &SyncError) {
        let next = if matches!(err, SyncError::Cancelled) {
            SessionState::Cancelled
        } else {
            SessionState::Failed
        };
        if self.state.can_advance(next) {
            self.state = next;
        }
    }
}

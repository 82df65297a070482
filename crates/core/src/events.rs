//! Structured events for audit and observability
//!
//! Delivery is fire-and-forget: a sink must not block the engine, and a
//! sink that cannot keep up loses events rather than slowing sessions.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictPolicy, Resolution};
use crate::manifest::ManifestId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ScopeChanged {
        newly_excluded: Vec<String>,
        newly_included: Vec<String>,
    },
    ConflictDetected {
        path: String,
        local: ManifestId,
        remote: ManifestId,
        policy: ConflictPolicy,
    },
    ConflictResolved {
        path: String,
        resolution: Resolution,
        copy_path: Option<String>,
    },
    SessionFailed {
        path: String,
        session: Uuid,
        error: String,
    },
    SessionCompleted {
        path: String,
        session: Uuid,
        action: String,
        uploaded: usize,
        downloaded: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::SessionFailed { path, error, .. } => {
                warn!(path = %path, error = %error, "sync session failed");
            }
            SyncEvent::ConflictDetected { path, policy, .. } => {
                warn!(path = %path, policy = %policy, "conflict detected");
            }
            SyncEvent::ConflictResolved {
                path, resolution, ..
            } => info!(path = %path, resolution = %resolution, "conflict resolved"),
            SyncEvent::ScopeChanged {
                newly_excluded,
                newly_included,
            } => info!(
                excluded = newly_excluded.len(),
                included = newly_included.len(),
                "scope changed"
            ),
            SyncEvent::SessionCompleted { path, action, .. } => {
                info!(path = %path, action = %action, "sync session completed");
            }
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SyncEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("dropping sync event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(path: &str) -> SyncEvent {
        SyncEvent::SessionFailed {
            path: path.into(),
            session: Uuid::new_v4(),
            error: "boom".into(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.emit(failed("a.txt"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::SessionFailed { ref path, .. } if path == "a.txt"));
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.emit(failed("first"));
        // Must not block or panic
        sink.emit(failed("second"));

        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::SessionFailed { ref path, .. } if path == "first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let event = SyncEvent::ScopeChanged {
            newly_excluded: vec!["Music".into()],
            newly_included: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "scope_changed");
        assert_eq!(json["newly_excluded"][0], "Music");
    }
}

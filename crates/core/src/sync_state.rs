//! Per-file sync state
//!
//! One [`FileEntity`] exists for every path the engine is managing. It is
//! created on first scan, rewritten after every session, and removed when
//! the path is deleted or leaves the scope.

use std::fmt;
use std::time::SystemTime;

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::manifest::{ManifestId, system_time_ms};

/// Where a file stands relative to the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncStatus {
    /// Seen locally, never committed
    Unsynced,
    /// Came into scope, waiting for a full scan
    InScopePending,
    Synced,
    /// Skipped; the entity carries the reason
    Excluded,
    /// A conflict is open for this path
    Conflicted,
}

impl SyncStatus {
    fn to_tag(self) -> u8 {
        match self {
            Self::Unsynced => 0,
            Self::InScopePending => 1,
            Self::Synced => 2,
            Self::Excluded => 3,
            Self::Conflicted => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Unsynced,
            1 => Self::InScopePending,
            2 => Self::Synced,
            3 => Self::Excluded,
            4 => Self::Conflicted,
            other => return Err(SyncError::Codec(format!("unknown sync status tag {other}"))),
        })
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsynced => "unsynced",
            Self::InScopePending => "pending",
            Self::Synced => "synced",
            Self::Excluded => "excluded",
            Self::Conflicted => "conflicted",
        };
        f.write_str(name)
    }
}

/// The engine's record of one synced path
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileEntity {
    pub path: String,
    pub size: u64,
    /// Modification time (milliseconds since UNIX epoch)
    pub mtime_ms: i64,
    /// Manifest that describes the file's content, once committed
    pub content_manifest_id: Option<ManifestId>,
    pub status: SyncStatus,
    pub excluded_reason: Option<String>,
}

impl FileEntity {
    #[must_use]
    pub fn new(path: &str, size: u64, modified: SystemTime) -> Self {
        Self {
            path: path.to_string(),
            size,
            mtime_ms: system_time_ms(modified),
            content_manifest_id: None,
            status: SyncStatus::Unsynced,
            excluded_reason: None,
        }
    }

    /// Whether on-disk metadata still matches what was last synced.
    ///
    /// A match lets a session reuse the committed manifest instead of
    /// re-reading and re-chunking the file.
    #[must_use]
    pub fn unchanged_since_sync(&self, size: u64, modified: SystemTime) -> bool {
        self.status == SyncStatus::Synced
            && self.content_manifest_id.is_some()
            && self.size == size
            && self.mtime_ms == system_time_ms(modified)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredEntity {
            path: self.path.clone(),
            size: self.size,
            mtime_ms: self.mtime_ms,
            manifest_id: self.content_manifest_id.map(|id| *id.as_bytes()),
            status: self.status.to_tag(),
            excluded_reason: self.excluded_reason.clone(),
        };
        let bytes = rkyv::to_bytes::<RkyvError>(&stored)
            .map_err(|e| SyncError::Codec(format!("failed to serialize file entity: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let stored = rkyv::from_bytes::<StoredEntity, RkyvError>(&aligned)
            .map_err(|e| SyncError::Codec(format!("failed to deserialize file entity: {e}")))?;

        Ok(Self {
            path: stored.path,
            size: stored.size,
            mtime_ms: stored.mtime_ms,
            content_manifest_id: stored.manifest_id.map(ManifestId::from_raw),
            status: SyncStatus::from_tag(stored.status)?,
            excluded_reason: stored.excluded_reason,
        })
    }
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[rkyv(derive(Debug))]
struct StoredEntity {
    path: String,
    size: u64,
    mtime_ms: i64,
    manifest_id: Option<[u8; 16]>,
    status: u8,
    excluded_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_entity_roundtrip() {
        let mut entity = FileEntity::new(
            "Documents/plan.md",
            100,
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        );
        entity.content_manifest_id = Some(ManifestId::new());
        entity.status = SyncStatus::Excluded;
        entity.excluded_reason = Some("too large".into());

        let decoded = FileEntity::from_bytes(&entity.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_unchanged_since_sync() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut entity = FileEntity::new("a.txt", 10, modified);
        // Never synced: always re-read
        assert!(!entity.unchanged_since_sync(10, modified));

        entity.status = SyncStatus::Synced;
        entity.content_manifest_id = Some(ManifestId::new());
        assert!(entity.unchanged_since_sync(10, modified));
        assert!(!entity.unchanged_since_sync(11, modified));
        assert!(!entity.unchanged_since_sync(10, modified + Duration::from_secs(1)));
    }
}

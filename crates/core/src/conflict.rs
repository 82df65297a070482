//! Conflict resolution policies and the conflict audit record
//!
//! A conflict exists when local edits were made on top of a version the
//! remote has since moved past. Whatever the policy, the losing side is
//! kept: either as a renamed copy or as an entry in local history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::{Manifest, ManifestId, WriteStamp, now_ms};
use crate::merge;

/// Deployment-wide choice of how conflicts are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer write stamp wins; the other version becomes a conflict copy
    LastWriteWins,
    /// Both versions survive under distinct paths
    KeepBoth,
    /// Three-way merge for text content, else KeepBoth
    Merge,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LastWriteWins => "last_write_wins",
            Self::KeepBoth => "keep_both",
            Self::Merge => "merge",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "last_write_wins" | "lww" => Ok(Self::LastWriteWins),
            "keep_both" => Ok(Self::KeepBoth),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Outcome recorded on a [`ConflictRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Pending,
    KeepLocal,
    KeepRemote,
    Merged,
    KeptBoth,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::KeepLocal => "kept local",
            Self::KeepRemote => "kept remote",
            Self::Merged => "merged",
            Self::KeptBoth => "kept both",
        })
    }
}

/// Audit entry for one conflict, from detection to resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub file_path: String,
    pub local_manifest_id: ManifestId,
    pub remote_manifest_id: ManifestId,
    /// Last version both sides agreed on, if any
    pub ancestor_manifest_id: Option<ManifestId>,
    pub detected_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    pub policy: ConflictPolicy,
    pub resolution: Resolution,
    /// Where the non-winning version was kept, when it got its own path
    pub copy_path: Option<String>,
}

impl ConflictRecord {
    #[must_use]
    pub fn open(
        path: &str,
        local: ManifestId,
        remote: ManifestId,
        ancestor: Option<ManifestId>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: path.to_string(),
            local_manifest_id: local,
            remote_manifest_id: remote,
            ancestor_manifest_id: ancestor,
            detected_at_ms: now_ms(),
            resolved_at_ms: None,
            policy,
            resolution: Resolution::Pending,
            copy_path: None,
        }
    }

    pub fn resolve(&mut self, resolution: Resolution, copy_path: Option<String>) {
        self.resolution = resolution;
        self.copy_path = copy_path;
        self.resolved_at_ms = Some(now_ms());
    }
}

/// What the engine does to settle a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Local stays at the path; remote is kept as a conflict copy
    LocalWins,
    /// Remote stays at the path; local is kept as a conflict copy
    RemoteWins,
    /// Local moves to a conflict copy; remote keeps the path
    KeepBoth,
    /// Try a three-way merge, KeepBoth if it fails
    Merge,
}

impl Strategy {
    /// Resolution recorded when the strategy completes
    #[must_use]
    pub fn resolution(self) -> Resolution {
        match self {
            Self::LocalWins => Resolution::KeepLocal,
            Self::RemoteWins => Resolution::KeepRemote,
            Self::KeepBoth => Resolution::KeptBoth,
            Self::Merge => Resolution::Merged,
        }
    }
}

/// Pick a strategy for a conflict on `local.path`
#[must_use]
pub fn choose_strategy(policy: ConflictPolicy, local: &Manifest, remote: &Manifest) -> Strategy {
    match policy {
        ConflictPolicy::KeepBoth => Strategy::KeepBoth,
        ConflictPolicy::LastWriteWins => {
            if local_write_wins(&local.stamp, &remote.stamp) {
                Strategy::LocalWins
            } else {
                Strategy::RemoteWins
            }
        }
        ConflictPolicy::Merge if merge::is_mergeable(&local.path) => Strategy::Merge,
        ConflictPolicy::Merge => Strategy::KeepBoth,
    }
}

/// Ordering used by LastWriteWins.
///
/// Logical clock first, so a writer that had seen more history wins
/// regardless of clock skew; mtime and origin name only break ties.
/// Remote wins an exact tie since it is already committed.
#[must_use]
pub fn local_write_wins(local: &WriteStamp, remote: &WriteStamp) -> bool {
    local > remote
}

/// Name for the `n`th conflict copy of `path` written by `client`.
///
/// `report.docx` becomes `report (laptop's conflicting copy).docx`, then
/// `report (laptop's conflicting copy 2).docx`, and so on. Separators in
/// `client` are replaced so the copy always lands next to `path`.
#[must_use]
pub fn conflict_copy_name(path: &str, client: &str, n: u32) -> String {
    let client = client.replace(['/', '\\', '\0'], "_");
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match file.rfind('.') {
        Some(i) if i > 0 => (&file[..i], &file[i..]),
        _ => (file, ""),
    };
    let suffix = if n <= 1 {
        String::new()
    } else {
        format!(" {n}")
    };
    format!("{dir}{stem} ({client}'s conflicting copy{suffix}){ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(logical: u64, mtime_ms: i64, origin: &str) -> WriteStamp {
        WriteStamp {
            logical,
            mtime_ms,
            origin: origin.into(),
        }
    }

    fn manifest(path: &str, stamp: WriteStamp) -> Manifest {
        Manifest::build(path, path.as_bytes(), Vec::new(), None, stamp)
    }

    #[test]
    fn test_copy_names() {
        assert_eq!(
            conflict_copy_name("report.docx", "Client2", 1),
            "report (Client2's conflicting copy).docx"
        );
        assert_eq!(
            conflict_copy_name("Documents/report.docx", "Client2", 3),
            "Documents/report (Client2's conflicting copy 3).docx"
        );
        assert_eq!(
            conflict_copy_name("Makefile", "laptop", 1),
            "Makefile (laptop's conflicting copy)"
        );
        assert_eq!(
            conflict_copy_name("dir/.env", "laptop", 1),
            "dir/.env (laptop's conflicting copy)"
        );
        assert_eq!(
            conflict_copy_name("archive.tar.gz", "laptop", 1),
            "archive.tar (laptop's conflicting copy).gz"
        );
    }

    #[test]
    fn test_copy_name_stays_in_directory() {
        let name = conflict_copy_name("docs/a.txt", "../../evil", 1);
        assert_eq!(name, "docs/a (.._.._evil's conflicting copy).txt");
        assert!(crate::scope::checked_path(&name).is_ok());
    }

    #[test]
    fn test_last_write_wins_prefers_logical_clock() {
        // Later wall clock but fewer observed versions loses
        let local = stamp(3, 1_000, "a");
        let remote = stamp(2, 9_000, "b");
        assert!(local_write_wins(&local, &remote));

        // Same logical time: mtime decides
        let local = stamp(3, 1_000, "a");
        let remote = stamp(3, 2_000, "b");
        assert!(!local_write_wins(&local, &remote));

        // Exact tie goes to the remote
        assert!(!local_write_wins(&local, &local.clone()));
    }

    #[test]
    fn test_choose_strategy() {
        let local = manifest("notes.md", stamp(2, 0, "a"));
        let remote = manifest("notes.md", stamp(2, 5, "b"));
        assert_eq!(
            choose_strategy(ConflictPolicy::LastWriteWins, &local, &remote),
            Strategy::RemoteWins
        );
        assert_eq!(
            choose_strategy(ConflictPolicy::KeepBoth, &local, &remote),
            Strategy::KeepBoth
        );
        assert_eq!(
            choose_strategy(ConflictPolicy::Merge, &local, &remote),
            Strategy::Merge
        );

        let binary = manifest("photo.jpg", stamp(2, 0, "a"));
        assert_eq!(
            choose_strategy(ConflictPolicy::Merge, &binary, &remote),
            Strategy::KeepBoth
        );
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "last-write-wins".parse::<ConflictPolicy>(),
            Ok(ConflictPolicy::LastWriteWins)
        );
        assert_eq!("keep_both".parse(), Ok(ConflictPolicy::KeepBoth));
        assert!("coin_flip".parse::<ConflictPolicy>().is_err());
    }
}

//! Snapshot: a point-in-time view of the scope root, compared against the
//! engine's file records

use std::collections::BTreeMap;

use crate::scan::ScanEntry;
use crate::sync_state::FileEntity;

/// A snapshot of a directory tree at a point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// All files in the snapshot, keyed by scope-relative path
    pub files: BTreeMap<String, ScanEntry>,
}

impl Snapshot {
    /// Create a snapshot from scanned entries
    #[must_use]
    pub fn from_entries(entries: Vec<ScanEntry>) -> Self {
        let files = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Self { files }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ScanEntry> {
        self.files.get(path)
    }

    /// Compare the files on disk with what was last recorded for them.
    ///
    /// Uses size and mtime only; content is compared later, per session.
    #[must_use]
    pub fn diff(&self, known: &[FileEntity]) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let known: BTreeMap<&str, &FileEntity> =
            known.iter().map(|e| (e.path.as_str(), e)).collect();

        for (path, entry) in &self.files {
            match known.get(path.as_str()) {
                None => diff.added.push(path.clone()),
                Some(entity) if entity.unchanged_since_sync(entry.size, entry.modified) => {
                    diff.unchanged += 1;
                }
                Some(_) => diff.modified.push(path.clone()),
            }
        }

        for path in known.keys() {
            if !self.files.contains_key(*path) {
                diff.removed.push((*path).to_string());
            }
        }

        diff
    }
}

/// Differences between the disk and the engine's records
#[derive(Debug, Clone, Default)]
pub struct SnapshotDiff {
    /// On disk, never recorded
    pub added: Vec<String>,
    /// Recorded, no longer on disk
    pub removed: Vec<String>,
    /// Recorded, but size or mtime moved (or never synced)
    pub modified: Vec<String>,
    pub unchanged: usize,
}

impl SnapshotDiff {
    /// Check if there are any changes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Get total number of changes
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    /// Every path that needs a session
    pub fn changed_paths(&self) -> impl Iterator<Item = &str> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .map(String::as_str)
    }
}

//! Change detection: block diffs and per-path reconciliation plans
//!
//! Three inputs decide what a session does for a path: the local file's
//! manifest (if the file exists), the base (the last version this client
//! committed, which is also the last remote version it observed), and the
//! remote's current manifest.

use std::collections::HashSet;

use crate::hash::ContentHash;
use crate::manifest::{Manifest, ManifestId};

/// Block-level difference between two versions of a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDiff {
    /// Blocks in the new version only; these need transferring
    pub added: Vec<ContentHash>,
    /// Blocks in the old version only; these only lose a reference
    pub removed: Vec<ContentHash>,
    /// Blocks in both
    pub retained: usize,
}

impl BlockDiff {
    /// Set difference over block hashes
    #[must_use]
    pub fn between(old: Option<&Manifest>, new: &Manifest) -> Self {
        let old_set: HashSet<ContentHash> = old.map(Manifest::block_set).unwrap_or_default();
        let new_set = new.block_set();

        // Keep file order so transfers start at the front of the file
        let added = new
            .unique_hashes()
            .into_iter()
            .filter(|h| !old_set.contains(h))
            .collect();
        let removed = old
            .map(|m| {
                m.unique_hashes()
                    .into_iter()
                    .filter(|h| !new_set.contains(h))
                    .collect()
            })
            .unwrap_or_default();
        let retained = new_set.intersection(&old_set).count();

        Self {
            added,
            removed,
            retained,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What a session should do for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Nothing changed anywhere
    Clean,
    /// Push the local version; `expected` is the remote head it replaces
    Upload { expected: Option<ManifestId> },
    /// Pull the remote version over an unmodified local file
    Download,
    /// Local and remote already hold identical content; record the remote
    Adopt,
    /// Local file was deleted; delete the remote head
    DeleteRemote,
    /// Remote was deleted and the local file is unmodified; delete it
    DeleteLocal,
    /// Gone on both sides; drop local bookkeeping
    Forget,
    /// Both sides changed since `ancestor`
    Conflict { ancestor: Option<ManifestId> },
}

impl Plan {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !matches!(self, Self::Clean)
    }
}

/// Decide the plan for a path.
///
/// `local` is `None` when the file does not exist locally. A modification
/// always beats a deletion: an edited file whose remote was deleted is
/// uploaded again, and a remote edit to a locally deleted file is restored.
#[must_use]
pub fn plan(local: Option<&Manifest>, base: Option<&Manifest>, remote: Option<&Manifest>) -> Plan {
    match (local, base, remote) {
        (Some(_), None, None) => Plan::Upload { expected: None },
        (Some(l), None, Some(r)) => {
            if l.same_content(r) {
                Plan::Adopt
            } else {
                Plan::Conflict { ancestor: None }
            }
        }
        (Some(l), Some(b), None) => {
            if l.same_content(b) {
                Plan::DeleteLocal
            } else {
                Plan::Upload { expected: None }
            }
        }
        (Some(l), Some(b), Some(r)) if r.id == b.id => {
            if l.same_content(b) {
                Plan::Clean
            } else {
                Plan::Upload {
                    expected: Some(b.id),
                }
            }
        }
        (Some(l), Some(b), Some(r)) => {
            if l.same_content(b) {
                Plan::Download
            } else if l.same_content(r) {
                Plan::Adopt
            } else {
                Plan::Conflict {
                    ancestor: Some(b.id),
                }
            }
        }
        (None, None, None) => Plan::Clean,
        (None, None, Some(_)) => Plan::Download,
        (None, Some(_), None) => Plan::Forget,
        (None, Some(b), Some(r)) if r.id == b.id => Plan::DeleteRemote,
        (None, Some(_), Some(_)) => Plan::Download,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkConfig, chunk_data};
    use crate::manifest::WriteStamp;
    use crate::test_support::noise;

    fn manifest(data: &[u8]) -> Manifest {
        let blocks = chunk_data(data, &ChunkConfig::default()).collect();
        Manifest::build("f.bin", data, blocks, None, WriteStamp::after(None, 0, "t"))
    }

    #[test]
    fn test_block_diff_single_edit() {
        let original = noise(b"diff", 200_000);
        let mut edited = original.clone();
        edited[100_000] ^= 0x55;

        let old = manifest(&original);
        let new = manifest(&edited);
        let diff = BlockDiff::between(Some(&old), &new);

        assert!(!diff.added.is_empty());
        assert!(diff.added.len() <= 3, "added: {}", diff.added.len());
        assert!(!diff.removed.is_empty());
        assert!(diff.retained > 0);
    }

    #[test]
    fn test_block_diff_new_file() {
        let new = manifest(&noise(b"new", 50_000));
        let diff = BlockDiff::between(None, &new);
        assert_eq!(diff.added, new.unique_hashes());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.retained, 0);
    }

    #[test]
    fn test_block_diff_identical() {
        let m = manifest(b"same bytes");
        let diff = BlockDiff::between(Some(&m), &m.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.retained, 1);
    }

    #[test]
    fn test_plan_table() {
        let base = manifest(b"base");
        let edited = manifest(b"local edit");
        let remote_edit = manifest(b"remote edit");
        let unchanged = manifest(b"base");

        // First sync
        assert_eq!(plan(Some(&edited), None, None), Plan::Upload { expected: None });
        assert_eq!(plan(None, None, Some(&remote_edit)), Plan::Download);
        assert_eq!(plan(Some(&unchanged), None, Some(&base)), Plan::Adopt);
        assert_eq!(
            plan(Some(&edited), None, Some(&remote_edit)),
            Plan::Conflict { ancestor: None }
        );

        // Remote still at base
        assert_eq!(plan(Some(&unchanged), Some(&base), Some(&base)), Plan::Clean);
        assert_eq!(
            plan(Some(&edited), Some(&base), Some(&base)),
            Plan::Upload {
                expected: Some(base.id)
            }
        );
        assert_eq!(plan(None, Some(&base), Some(&base)), Plan::DeleteRemote);

        // Remote moved on
        assert_eq!(
            plan(Some(&unchanged), Some(&base), Some(&remote_edit)),
            Plan::Download
        );
        assert_eq!(
            plan(Some(&edited), Some(&base), Some(&remote_edit)),
            Plan::Conflict {
                ancestor: Some(base.id)
            }
        );
        assert_eq!(plan(None, Some(&base), Some(&remote_edit)), Plan::Download);

        // Remote deleted
        assert_eq!(plan(Some(&unchanged), Some(&base), None), Plan::DeleteLocal);
        assert_eq!(
            plan(Some(&edited), Some(&base), None),
            Plan::Upload { expected: None }
        );
        assert_eq!(plan(None, Some(&base), None), Plan::Forget);
        assert_eq!(plan(None, None, None), Plan::Clean);
    }
}

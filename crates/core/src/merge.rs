//! Line-based three-way merge for text files
//!
//! Classic diff3: both sides are aligned against the common ancestor with
//! a Myers line diff, and regions where only one side changed take
//! that side's lines. A region both sides changed differently is an overlap
//! and fails the merge.

use similar::{Algorithm, DiffOp, capture_diff_slices};
use thiserror::Error;

/// Extensions whose content is merged line by line
pub const MERGEABLE_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "json", "toml", "yaml", "yml", "xml", "ini", "rs", "py", "js", "ts",
];

/// Per-side line cap
const MAX_LINES: usize = 20_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MergeError {
    #[error("content is not valid UTF-8")]
    NotText,
    #[error("both sides changed lines {start}..{end} of the ancestor")]
    Overlap { start: usize, end: usize },
    #[error("too many lines to merge")]
    TooLarge,
}

/// Whether `path` names content the merge strategy applies to
#[must_use]
pub fn is_mergeable(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) if i > 0 => {
            let ext = name[i + 1..].to_ascii_lowercase();
            MERGEABLE_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

/// Merge `local` and `remote`, both derived from `base`
pub fn merge3(base: &[u8], local: &[u8], remote: &[u8]) -> Result<Vec<u8>, MergeError> {
    let base = lines(base)?;
    let local = lines(local)?;
    let remote = lines(remote)?;
    if base.len().max(local.len()).max(remote.len()) > MAX_LINES {
        return Err(MergeError::TooLarge);
    }

    let to_local = align(&base, &local);
    let to_remote = align(&base, &remote);

    let mut out: Vec<&str> = Vec::new();
    let (mut i, mut a, mut b) = (0, 0, 0);

    loop {
        // Stable line: unchanged on both sides
        if i < base.len() && to_local[i] == Some(a) && to_remote[i] == Some(b) {
            out.push(base[i]);
            i += 1;
            a += 1;
            b += 1;
            continue;
        }

        let next = (i..base.len()).find_map(|o| Some((o, to_local[o]?, to_remote[o]?)));
        let (o, ea, eb) = next.unwrap_or((base.len(), local.len(), remote.len()));

        let base_chunk = &base[i..o];
        let local_chunk = &local[a..ea];
        let remote_chunk = &remote[b..eb];

        if local_chunk == base_chunk {
            out.extend_from_slice(remote_chunk);
        } else if remote_chunk == base_chunk || local_chunk == remote_chunk {
            out.extend_from_slice(local_chunk);
        } else {
            return Err(MergeError::Overlap { start: i, end: o });
        }

        if next.is_none() {
            break;
        }
        i = o;
        a = ea;
        b = eb;
    }

    Ok(out.concat().into_bytes())
}

fn lines(data: &[u8]) -> Result<Vec<&str>, MergeError> {
    let text = std::str::from_utf8(data).map_err(|_| MergeError::NotText)?;
    Ok(text.split_inclusive('\n').collect())
}

/// For each line of `base`, the index of the line in `other` it is matched
/// to by a Myers line diff
fn align(base: &[&str], other: &[&str]) -> Vec<Option<usize>> {
    let mut map = vec![None; base.len()];
    for op in capture_diff_slices(Algorithm::Myers, base, other) {
        if let DiffOp::Equal {
            old_index,
            new_index,
            len,
        } = op
        {
            for k in 0..len {
                map[old_index + k] = Some(new_index + k);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "title\n\nalpha\nbeta\ngamma\ndelta\n";

    #[test]
    fn test_disjoint_edits_merge() {
        let local = "title\n\nALPHA\nbeta\ngamma\ndelta\n";
        let remote = "title\n\nalpha\nbeta\ngamma\nDELTA\nepsilon\n";
        let merged = merge3(BASE.as_bytes(), local.as_bytes(), remote.as_bytes()).unwrap();
        assert_eq!(
            String::from_utf8(merged).unwrap(),
            "title\n\nALPHA\nbeta\ngamma\nDELTA\nepsilon\n"
        );
    }

    #[test]
    fn test_insert_and_delete() {
        let local = "intro\ntitle\n\nalpha\nbeta\ngamma\ndelta\n";
        let remote = "title\n\nalpha\ngamma\ndelta\n";
        let merged = merge3(BASE.as_bytes(), local.as_bytes(), remote.as_bytes()).unwrap();
        assert_eq!(
            String::from_utf8(merged).unwrap(),
            "intro\ntitle\n\nalpha\ngamma\ndelta\n"
        );
    }

    #[test]
    fn test_same_edit_on_both_sides() {
        let edited = "title\n\nalpha\nBETA\ngamma\ndelta\n";
        let merged = merge3(BASE.as_bytes(), edited.as_bytes(), edited.as_bytes()).unwrap();
        assert_eq!(merged, edited.as_bytes());
    }

    #[test]
    fn test_overlapping_edits_fail() {
        let local = "title\n\nalpha\nbeta (local)\ngamma\ndelta\n";
        let remote = "title\n\nalpha\nbeta (remote)\ngamma\ndelta\n";
        let err = merge3(BASE.as_bytes(), local.as_bytes(), remote.as_bytes()).unwrap_err();
        assert!(matches!(err, MergeError::Overlap { .. }));
    }

    #[test]
    fn test_repeated_lines_align_to_nearest_match() {
        let base = "}\n}\n}\n";
        let local = "}\nx\n}\n}\n";
        let remote = "}\n}\n}\ny\n";
        let merged = merge3(base.as_bytes(), local.as_bytes(), remote.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(merged).unwrap(), "}\nx\n}\n}\ny\n");
    }

    #[test]
    fn test_binary_is_not_merged() {
        let err = merge3(b"a\n", &[0xff, 0xfe], b"a\n").unwrap_err();
        assert_eq!(err, MergeError::NotText);
    }

    #[test]
    fn test_mergeable_extensions() {
        assert!(is_mergeable("notes/todo.md"));
        assert!(is_mergeable("Config.TOML"));
        assert!(!is_mergeable("report.docx"));
        assert!(!is_mergeable("Makefile"));
        assert!(!is_mergeable(".md"));
    }
}

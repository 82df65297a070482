//! File scanning with ignore-file support via the `ignore` crate

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scope::{ScopeFilter, normalize_path};

/// Directory holding the engine's local state, relative to the scope root
pub const STATE_DIR: &str = ".blocksync";

/// Per-root ignore file, gitignore syntax
pub const IGNORE_FILE: &str = ".blocksyncignore";

/// Prefix of scratch files written during atomic replaces
pub const TEMP_PREFIX: &str = ".blocksync-tmp";

/// Metadata for a single file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    /// Scope-relative, `/`-separated path
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time
    pub modified: SystemTime,
}

/// Result of one walk over the scope root
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<ScanEntry>,
    /// Files found but outside the scope
    pub out_of_scope: usize,
}

/// Scanner for a scope root
pub struct Scanner {
    root: PathBuf,
}

/// Names the engine owns and never syncs
fn is_engine_file(name: &str) -> bool {
    name == STATE_DIR || name == crate::config::CONFIG_FILE || name.starts_with(TEMP_PREFIX)
}

impl Scanner {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a configured walk builder
    fn walk_builder(&self) -> WalkBuilder {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false) // Include hidden files (e.g., .env.example)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                name != ".git" && !is_engine_file(&name)
            });
        builder
    }

    /// Walk the root and return every in-scope file, sorted by path
    ///
    /// # Errors
    /// Returns an error if directory traversal or metadata reads fail
    pub fn scan(&self, scope: &ScopeFilter) -> Result<ScanResult> {
        let mut result = ScanResult::default();

        for entry in self.walk_builder().build() {
            let entry = entry?;
            let path = entry.path();

            // Skip directories, only process files
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative = normalize_path(&relative.to_string_lossy());
            if !scope.is_in_scope(&relative) {
                result.out_of_scope += 1;
                continue;
            }

            let metadata = entry.metadata()?;
            result.entries.push(ScanEntry {
                path: relative,
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }

        // Sort for deterministic ordering
        result.entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::scope::ScopeRule;

    fn paths(result: &ScanResult) -> Vec<&str> {
        result.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let result = Scanner::new(dir.path()).scan(&ScopeFilter::default()).unwrap();
        assert_eq!(
            paths(&result),
            vec!["root.txt", "sub/dir/deep.txt", "sub/nested.txt"]
        );
        assert_eq!(result.entries[0].size, 4);
    }

    #[test]
    fn test_scan_skips_engine_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".blocksync/manifests")).unwrap();
        fs::write(dir.path().join(".blocksync/manifests/data.mdb"), "db").unwrap();
        fs::write(dir.path().join(".blocksync.toml"), "workers = 2").unwrap();
        fs::write(dir.path().join(".blocksync-tmpA1b2"), "partial").unwrap();
        fs::write(dir.path().join(".env"), "KEY=1").unwrap();

        let result = Scanner::new(dir.path()).scan(&ScopeFilter::default()).unwrap();
        assert_eq!(paths(&result), vec![".env"]);
    }

    #[test]
    fn test_scan_respects_ignore_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(IGNORE_FILE), "*.log\nbuild/\n").unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/out.bin"), "bin").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("noise.log"), "log").unwrap();

        let result = Scanner::new(dir.path()).scan(&ScopeFilter::default()).unwrap();
        assert_eq!(paths(&result), vec![IGNORE_FILE, "keep.txt"]);
    }

    #[test]
    fn test_scan_applies_scope() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Music")).unwrap();
        fs::create_dir_all(dir.path().join("Documents")).unwrap();
        fs::write(dir.path().join("Music/song.mp3"), "la").unwrap();
        fs::write(dir.path().join("Documents/plan.md"), "plan").unwrap();

        let scope = ScopeFilter::new(vec![ScopeRule::exclude("Music")]);
        let result = Scanner::new(dir.path()).scan(&scope).unwrap();
        assert_eq!(paths(&result), vec!["Documents/plan.md"]);
        assert_eq!(result.out_of_scope, 1);
    }
}

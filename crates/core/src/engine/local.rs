//! Local file access for sessions: stat, read, atomic replace, removal

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::manifest::Manifest;
use crate::scan::TEMP_PREFIX;

/// Size and mtime of a file as observed by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
}

/// The local side of a session
#[derive(Debug, Clone)]
pub(crate) struct LocalFile {
    pub stat: FileStat,
    pub manifest: Manifest,
    /// File bytes; `None` when the manifest was reused from the last sync
    pub data: Option<Vec<u8>>,
}

pub(crate) fn full_path(root: &Path, path: &str) -> PathBuf {
    path.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Stat a regular file; `None` if it doesn't exist or isn't a file
pub(crate) async fn stat(root: &Path, path: &str) -> Result<Option<FileStat>> {
    match tokio::fs::metadata(full_path(root, path)).await {
        Ok(meta) if meta.is_file() => Ok(Some(FileStat {
            size: meta.len(),
            modified: meta.modified()?,
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn read(root: &Path, path: &str) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(full_path(root, path)).await?)
}

/// Fail if the file changed since the session observed it as `seen`
pub(crate) async fn ensure_unchanged(root: &Path, path: &str, seen: Option<FileStat>) -> Result<()> {
    let now = stat(root, path).await?;
    if now != seen {
        debug!(path, "file changed during session");
        return Err(SyncError::UnsyncedChanges {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Replace `path` with `data` in one rename; readers never see a partial file
pub(crate) fn write_atomic(root: &Path, path: &str, data: &[u8]) -> Result<FileStat> {
    let target = full_path(root, path);
    let parent = target.parent().unwrap_or(root);
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| SyncError::Io(e.error))?;

    let meta = std::fs::metadata(&target)?;
    Ok(FileStat {
        size: meta.len(),
        modified: meta.modified()?,
    })
}

pub(crate) fn remove(root: &Path, path: &str) -> Result<()> {
    match std::fs::remove_file(full_path(root, path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

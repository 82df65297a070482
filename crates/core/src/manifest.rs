//! Manifests: the ordered block list that reconstructs one file version
//!
//! Concatenating the blocks of a manifest, in order, yields the file
//! byte-for-byte. [`Manifest::reconstruct`] checks that on every rebuild.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Identity of one file version
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestId(Uuid);

impl ManifestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_raw(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ManifestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestId({})", self.0)
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ManifestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One block of a file: where it sits and what it hashes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// BLAKE3 hash of the block content
    pub hash: ContentHash,
    /// Byte offset in the source file
    pub offset: u64,
    /// Length of this block in bytes
    pub length: u32,
}

/// Who wrote a version and when.
///
/// `logical` counts the versions the writer had observed when it produced
/// this one, so it does not depend on the writer's clock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteStamp {
    pub logical: u64,
    pub mtime_ms: i64,
    pub origin: String,
}

impl WriteStamp {
    /// Stamp for a version written on top of `parent`
    #[must_use]
    pub fn after(parent: Option<&Manifest>, mtime_ms: i64, origin: &str) -> Self {
        Self {
            logical: parent.map_or(1, |p| p.stamp.logical + 1),
            mtime_ms,
            origin: origin.to_string(),
        }
    }
}

/// A file version as an ordered list of content-addressed blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: ManifestId,
    /// Scope-relative, `/`-separated, case preserved
    pub path: String,
    pub blocks: Vec<BlockRef>,
    /// Total size in bytes
    pub size: u64,
    /// Hash of the complete file
    pub file_hash: ContentHash,
    pub created_at_ms: i64,
    /// Version this one was written on top of
    pub parent: Option<ManifestId>,
    pub stamp: WriteStamp,
}

impl Manifest {
    /// Build a manifest for `data` split into `blocks`
    #[must_use]
    pub fn build(
        path: &str,
        data: &[u8],
        blocks: Vec<BlockRef>,
        parent: Option<ManifestId>,
        stamp: WriteStamp,
    ) -> Self {
        Self {
            id: ManifestId::new(),
            path: path.to_string(),
            blocks,
            size: data.len() as u64,
            file_hash: ContentHash::from_bytes(data),
            created_at_ms: now_ms(),
            parent,
            stamp,
        }
    }

    /// Same content under a new identity (conflict copies, restores)
    #[must_use]
    pub fn derive(&self, path: &str, parent: Option<ManifestId>, stamp: WriteStamp) -> Self {
        Self {
            id: ManifestId::new(),
            path: path.to_string(),
            blocks: self.blocks.clone(),
            size: self.size,
            file_hash: self.file_hash,
            created_at_ms: now_ms(),
            parent,
            stamp,
        }
    }

    /// Block hashes in file order, duplicates included
    pub fn hashes(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.blocks.iter().map(|b| b.hash)
    }

    /// Distinct block hashes, in order of first appearance
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<ContentHash> {
        let mut seen = HashSet::new();
        self.hashes().filter(|h| seen.insert(*h)).collect()
    }

    #[must_use]
    pub fn block_set(&self) -> HashSet<ContentHash> {
        self.hashes().collect()
    }

    /// Whether both manifests describe the same bytes
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.file_hash == other.file_hash && self.size == other.size
    }

    /// Rebuild the file from its blocks.
    ///
    /// Every block and the final file are verified against their digests;
    /// any mismatch is an integrity error.
    pub fn reconstruct<F>(&self, mut fetch: F) -> Result<Vec<u8>>
    where
        F: FnMut(&ContentHash) -> Option<Bytes>,
    {
        let mut result = Vec::with_capacity(self.size as usize);

        for (i, block) in self.blocks.iter().enumerate() {
            let data = fetch(&block.hash)
                .ok_or_else(|| SyncError::NotFound(format!("block {i} of {}: {}", self.path, block.hash)))?;
            if data.len() != block.length as usize || ContentHash::from_bytes(&data) != block.hash {
                return Err(SyncError::integrity(
                    format!("block {} of {}", block.hash, self.path),
                    "stored bytes do not match the block digest",
                ));
            }
            result.extend_from_slice(&data);
        }

        let actual = ContentHash::from_bytes(&result);
        if actual != self.file_hash {
            return Err(SyncError::integrity(
                self.path.clone(),
                format!("reassembled file hashes to {actual}, expected {}", self.file_hash),
            ));
        }
        Ok(result)
    }

    /// Encode for LMDB storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredManifest::from(self);
        let bytes = rkyv::to_bytes::<RkyvError>(&stored)
            .map_err(|e| SyncError::Codec(format!("failed to serialize manifest: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Decode bytes produced by [`Manifest::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // LMDB values carry no alignment guarantee
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let stored = rkyv::from_bytes::<StoredManifest, RkyvError>(&aligned)
            .map_err(|e| SyncError::Codec(format!("failed to deserialize manifest: {e}")))?;
        Ok(stored.into())
    }
}

/// Archived form of a manifest
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
#[rkyv(derive(Debug))]
struct StoredManifest {
    id: [u8; 16],
    path: String,
    blocks: Vec<StoredBlock>,
    size: u64,
    file_hash: [u8; 32],
    created_at_ms: i64,
    parent: Option<[u8; 16]>,
    logical: u64,
    mtime_ms: i64,
    origin: String,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
#[rkyv(derive(Debug))]
struct StoredBlock {
    hash: [u8; 32],
    offset: u64,
    length: u32,
}

impl From<&Manifest> for StoredManifest {
    fn from(m: &Manifest) -> Self {
        Self {
            id: *m.id.as_bytes(),
            path: m.path.clone(),
            blocks: m
                .blocks
                .iter()
                .map(|b| StoredBlock {
                    hash: *b.hash.as_bytes(),
                    offset: b.offset,
                    length: b.length,
                })
                .collect(),
            size: m.size,
            file_hash: *m.file_hash.as_bytes(),
            created_at_ms: m.created_at_ms,
            parent: m.parent.map(|p| *p.as_bytes()),
            logical: m.stamp.logical,
            mtime_ms: m.stamp.mtime_ms,
            origin: m.stamp.origin.clone(),
        }
    }
}

impl From<StoredManifest> for Manifest {
    fn from(s: StoredManifest) -> Self {
        Self {
            id: ManifestId::from_raw(s.id),
            path: s.path,
            blocks: s
                .blocks
                .into_iter()
                .map(|b| BlockRef {
                    hash: ContentHash::from_raw(b.hash),
                    offset: b.offset,
                    length: b.length,
                })
                .collect(),
            size: s.size,
            file_hash: ContentHash::from_raw(s.file_hash),
            created_at_ms: s.created_at_ms,
            parent: s.parent.map(ManifestId::from_raw),
            stamp: WriteStamp {
                logical: s.logical,
                mtime_ms: s.mtime_ms,
                origin: s.origin,
            },
        }
    }
}

/// Milliseconds since the UNIX epoch
#[must_use]
pub fn now_ms() -> i64 {
    system_time_ms(SystemTime::now())
}

#[must_use]
pub fn system_time_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::chunker::{ChunkConfig, block_bytes, chunk_data};
    use crate::test_support::noise;

    fn manifest_for(path: &str, data: &[u8]) -> Manifest {
        let blocks = chunk_data(data, &ChunkConfig::default()).collect();
        Manifest::build(path, data, blocks, None, WriteStamp::after(None, 0, "test"))
    }

    fn block_map(data: &[u8], manifest: &Manifest) -> HashMap<ContentHash, Bytes> {
        manifest
            .blocks
            .iter()
            .map(|b| (b.hash, Bytes::copy_from_slice(block_bytes(data, b))))
            .collect()
    }

    #[test]
    fn test_reconstruct_round_trip() {
        let data = noise(b"round trip", 150_000);
        let manifest = manifest_for("a.bin", &data);
        let blocks = block_map(&data, &manifest);

        let rebuilt = manifest.reconstruct(|h| blocks.get(h).cloned()).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_reconstruct_detects_corruption() {
        let data = noise(b"corrupt", 150_000);
        let manifest = manifest_for("a.bin", &data);
        let mut blocks = block_map(&data, &manifest);

        let victim = manifest.blocks[1].hash;
        let mut bad = blocks[&victim].to_vec();
        bad[0] ^= 0xff;
        blocks.insert(victim, Bytes::from(bad));

        let err = manifest.reconstruct(|h| blocks.get(h).cloned()).unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
    }

    #[test]
    fn test_reconstruct_missing_block() {
        let manifest = manifest_for("a.txt", b"tiny");
        let err = manifest.reconstruct(|_| None).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_storage_encoding() {
        let data = noise(b"encode", 60_000);
        let parent = manifest_for("docs/a.bin", b"older");
        let mut manifest = manifest_for("docs/a.bin", &data);
        manifest.parent = Some(parent.id);
        manifest.stamp = WriteStamp::after(Some(&parent), 1_700_000_000_000, "laptop");

        let decoded = Manifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.stamp.logical, 2);
    }

    #[test]
    fn test_derive_keeps_content() {
        let original = manifest_for("report.docx", b"quarterly numbers");
        let copy = original.derive("report (x).docx", None, original.stamp.clone());
        assert_ne!(copy.id, original.id);
        assert!(copy.same_content(&original));
        assert_eq!(copy.path, "report (x).docx");
    }

    #[test]
    fn test_write_stamp_ordering() {
        let a = WriteStamp {
            logical: 2,
            mtime_ms: 10,
            origin: "a".into(),
        };
        let b = WriteStamp {
            logical: 1,
            mtime_ms: 99,
            origin: "b".into(),
        };
        // Observed history outranks wall-clock time
        assert!(a > b);
    }
}

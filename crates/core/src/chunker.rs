//! Content-defined chunking using FastCDC
//!
//! Block boundaries follow the content, so an insertion near the start of a
//! file only disturbs the blocks around the edit. Files at or below
//! [`ChunkConfig::single_block_threshold`] are kept as one block.

use std::collections::HashMap;

use fastcdc::v2020::{self, FastCDC, Normalization};

use crate::config::Limits;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::manifest::BlockRef;

/// Configuration for content-defined chunking
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ChunkConfig {
    /// Minimum chunk size in bytes
    pub min_size: u32,
    /// Average (expected) chunk size in bytes
    pub avg_size: u32,
    /// Maximum chunk size in bytes
    pub max_size: u32,
    /// Files up to this size are stored as a single block
    pub single_block_threshold: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_size: 512,
            avg_size: 4096,
            max_size: 32768,
            single_block_threshold: 4 * 4096,
        }
    }
}

impl ChunkConfig {
    /// Explicit sizes; the single-block threshold is four average blocks
    #[must_use]
    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> Self {
        Self {
            min_size,
            avg_size,
            max_size,
            single_block_threshold: 4 * u64::from(avg_size),
        }
    }

    /// Create config optimized for large binary files
    #[must_use]
    pub fn for_large_files() -> Self {
        Self::new(4096, 16384, 65536)
    }

    /// Override the single-block threshold
    #[must_use]
    pub fn with_single_block_threshold(mut self, threshold: u64) -> Self {
        self.single_block_threshold = threshold;
        self
    }

    /// Check the sizes against the bounds FastCDC accepts.
    ///
    /// FastCDC asserts on out-of-range sizes, so this must pass before any
    /// data is chunked.
    pub fn validate(&self) -> Result<()> {
        let in_range = |value: u32, min: u32, max: u32| (min..=max).contains(&value);

        if !in_range(self.min_size, v2020::MINIMUM_MIN, v2020::MINIMUM_MAX)
            || !in_range(self.avg_size, v2020::AVERAGE_MIN, v2020::AVERAGE_MAX)
            || !in_range(self.max_size, v2020::MAXIMUM_MIN, v2020::MAXIMUM_MAX)
        {
            return Err(SyncError::Config(format!(
                "chunk sizes {}/{}/{} outside FastCDC bounds",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            return Err(SyncError::Config(format!(
                "chunk sizes must satisfy min <= avg <= max, got {}/{}/{}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Chunk data into content-defined pieces.
///
/// Empty input yields no blocks; input up to the single-block threshold
/// yields exactly one.
pub fn chunk_data<'a>(
    data: &'a [u8],
    config: &ChunkConfig,
) -> Box<dyn Iterator<Item = BlockRef> + 'a> {
    if data.is_empty() {
        return Box::new(std::iter::empty());
    }

    if data.len() as u64 <= config.single_block_threshold {
        return Box::new(std::iter::once(BlockRef {
            hash: ContentHash::from_bytes(data),
            offset: 0,
            length: data.len() as u32,
        }));
    }

    let chunks = FastCDC::with_level(
        data,
        config.min_size,
        config.avg_size,
        config.max_size,
        Normalization::Level1,
    )
    .map(|entry| {
        let chunk = &data[entry.offset..entry.offset + entry.length];
        BlockRef {
            hash: ContentHash::from_bytes(chunk),
            offset: entry.offset as u64,
            length: entry.length as u32,
        }
    });
    Box::new(chunks)
}

/// Splits file bytes into blocks, enforcing capacity limits and refusing
/// digest collisions.
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: ChunkConfig,
    limits: Limits,
}

impl Segmenter {
    /// # Errors
    /// Returns [`SyncError::Config`] if the chunk sizes are unusable.
    pub fn new(config: ChunkConfig, limits: Limits) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, limits })
    }

    #[must_use]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Fail early on files that are too large to read into a session
    pub fn check_size(&self, path: &str, size: u64) -> Result<()> {
        if size > self.limits.max_file_size {
            return Err(SyncError::CapacityExceeded {
                path: path.to_string(),
                detail: format!(
                    "size {size} bytes exceeds limit of {} bytes",
                    self.limits.max_file_size
                ),
            });
        }
        Ok(())
    }

    /// Segment `data` into an ordered block list.
    ///
    /// Pure function of the bytes: the same input always yields the same
    /// blocks, and nothing is written anywhere.
    pub fn segment(&self, path: &str, data: &[u8]) -> Result<Vec<BlockRef>> {
        self.check_size(path, data.len() as u64)?;

        let blocks: Vec<BlockRef> = chunk_data(data, &self.config).collect();
        if blocks.len() > self.limits.max_blocks {
            return Err(SyncError::CapacityExceeded {
                path: path.to_string(),
                detail: format!(
                    "{} blocks exceeds limit of {}",
                    blocks.len(),
                    self.limits.max_blocks
                ),
            });
        }

        // Identical digests must mean identical bytes
        let mut seen: HashMap<ContentHash, &BlockRef> = HashMap::new();
        for block in &blocks {
            match seen.get(&block.hash) {
                None => {
                    seen.insert(block.hash, block);
                }
                Some(first) if block_bytes(data, first) != block_bytes(data, block) => {
                    return Err(SyncError::integrity(
                        format!("{path} block {}", block.hash),
                        "digest collision between different block contents",
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(blocks)
    }
}

/// Slice the bytes a block covers out of its file
#[must_use]
pub fn block_bytes<'a>(data: &'a [u8], block: &BlockRef) -> &'a [u8] {
    let start = block.offset as usize;
    let end = start + block.length as usize;
    data.get(start..end).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::noise;

    fn segmenter(config: ChunkConfig) -> Segmenter {
        Segmenter::new(config, Limits::default()).unwrap()
    }

    #[test]
    fn test_chunk_deterministic() {
        let data = noise(b"deterministic", 200_000);
        let config = ChunkConfig::default();

        let chunks1: Vec<_> = chunk_data(&data, &config).collect();
        let chunks2: Vec<_> = chunk_data(&data, &config).collect();

        assert_eq!(chunks1, chunks2);
        assert!(chunks1.len() > 1);
    }

    #[test]
    fn test_chunk_covers_entire_file() {
        let data = noise(b"coverage", 100_000);
        let config = ChunkConfig::default();

        let mut expected_offset = 0u64;
        for chunk in chunk_data(&data, &config) {
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += u64::from(chunk.length);
        }
        assert_eq!(expected_offset, data.len() as u64);
    }

    #[test]
    fn test_insertion_only_disturbs_local_blocks() {
        let original = noise(b"insertion", 1_000_000);
        let mut modified = original.clone();
        modified.splice(300_000..300_000, b"ten bytes!".iter().copied());

        let config = ChunkConfig::new(2048, 8192, 32768);
        let old: std::collections::HashSet<_> =
            chunk_data(&original, &config).map(|c| c.hash).collect();
        let new: Vec<_> = chunk_data(&modified, &config).collect();

        let fresh = new.iter().filter(|c| !old.contains(&c.hash)).count();
        assert!(fresh <= 2, "expected at most 2 new blocks, got {fresh}");
    }

    #[test]
    fn test_empty_data() {
        let config = ChunkConfig::default();
        assert!(chunk_data(b"", &config).next().is_none());
    }

    #[test]
    fn test_small_data_is_single_block() {
        let data = noise(b"small", 10_000);
        let config = ChunkConfig::default();
        let chunks: Vec<_> = chunk_data(&data, &config).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].length, 10_000);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(ChunkConfig::new(16, 4096, 32768).validate().is_err());
        assert!(ChunkConfig::new(4096, 2048, 32768).validate().is_err());
        assert!(ChunkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_segment_capacity_limits() {
        let limits = Limits {
            max_file_size: 1000,
            ..Limits::default()
        };
        let seg = Segmenter::new(ChunkConfig::default(), limits).unwrap();
        let err = seg.segment("big.bin", &[0u8; 1001]).unwrap_err();
        assert!(matches!(err, SyncError::CapacityExceeded { .. }));

        let limits = Limits {
            max_file_size: u64::MAX,
            max_blocks: 2,
            ..Limits::default()
        };
        let seg = Segmenter::new(ChunkConfig::default(), limits).unwrap();
        let err = seg.segment("many.bin", &noise(b"many", 200_000)).unwrap_err();
        assert!(matches!(err, SyncError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_segment_repeated_blocks_are_not_collisions() {
        // The same block appearing twice is deduplication, not a collision
        let block = noise(b"repeat", 40_000);
        let mut data = block.clone();
        data.extend_from_slice(&block);
        data.extend_from_slice(&block);

        let seg = segmenter(ChunkConfig::new(1024, 4096, 16384));
        let blocks = seg.segment("repeat.bin", &data).unwrap();
        let unique: std::collections::HashSet<_> = blocks.iter().map(|b| b.hash).collect();
        assert!(unique.len() < blocks.len());
    }
}

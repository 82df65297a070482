//! Local block store with reference counting
//!
//! Stores blocks by their BLAKE3 hash, never the same content twice, so
//! identical content shared by several files or versions is kept once.
//! A block's refcount is the number of locally retained manifests that
//! reference it; blocks at zero are garbage-collected.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::manifest::Manifest;

/// Content-addressable block store using LMDB.
///
/// `blocks`: hash -> raw block bytes
/// `refcounts`: hash -> big-endian u64
///
/// Refcounts only change through [`retain`](Self::retain) and
/// [`release`](Self::release). Each runs inside one LMDB write transaction
/// and LMDB admits a single writer at a time, so concurrent sessions never
/// lose an update.
pub struct BlockStore {
    env: Env,
    blocks: Database<HeedBytes, HeedBytes>,
    refcounts: Database<HeedBytes, HeedBytes>,
}

impl BlockStore {
    /// Open or create a block store at the given path.
    ///
    /// `map_size` bounds the total size of stored blocks; see
    /// [`Limits::block_store_map_size`](crate::config::Limits::block_store_map_size).
    pub fn open(path: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: Standard LMDB memory-mapped I/O; the environment is not
        // modified by anything outside this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("blocks")
            .create(&mut wtxn)?;
        let refcounts = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("refcounts")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self {
            env,
            blocks,
            refcounts,
        })
    }

    /// Check if a block exists in the store.
    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        let Ok(rtxn) = self.env.read_txn() else {
            return false;
        };
        self.blocks
            .get(&rtxn, hash.as_bytes())
            .ok()
            .flatten()
            .is_some()
    }

    /// Get a block by its hash.
    #[must_use]
    pub fn get(&self, hash: &ContentHash) -> Option<Bytes> {
        let rtxn = self.env.read_txn().ok()?;
        let data = self.blocks.get(&rtxn, hash.as_bytes()).ok()??;
        Some(Bytes::copy_from_slice(data))
    }

    /// Store a block. Returns true if newly stored, false if already existed.
    ///
    /// # Errors
    /// Returns an integrity error if `data` does not hash to `hash`, or if
    /// different bytes are already stored under the same hash.
    pub fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let stored = self.put_in(&mut wtxn, hash, data)?;
        wtxn.commit()?;
        Ok(stored)
    }

    /// Store multiple blocks atomically.
    pub fn put_many<'a, I>(&self, blocks: I) -> Result<usize>
    where
        I: IntoIterator<Item = (ContentHash, &'a [u8])>,
    {
        let mut wtxn = self.env.write_txn()?;
        let mut new_count = 0;
        for (hash, data) in blocks {
            if self.put_in(&mut wtxn, &hash, data)? {
                new_count += 1;
            }
        }
        wtxn.commit()?;
        Ok(new_count)
    }

    fn put_in(&self, wtxn: &mut RwTxn<'_>, hash: &ContentHash, data: &[u8]) -> Result<bool> {
        let computed = ContentHash::from_bytes(data);
        if computed != *hash {
            return Err(SyncError::integrity(
                format!("block {hash}"),
                format!("content hashes to {computed}"),
            ));
        }

        if let Some(existing) = self.blocks.get(wtxn, hash.as_bytes())? {
            if existing != data {
                return Err(SyncError::integrity(
                    format!("block {hash}"),
                    "digest collision with a different stored block",
                ));
            }
            return Ok(false);
        }

        self.blocks.put(wtxn, hash.as_bytes(), data)?;
        Ok(true)
    }

    /// Check which hashes are missing from the store.
    #[must_use]
    pub fn find_missing(&self, hashes: &[ContentHash]) -> Vec<ContentHash> {
        let Ok(rtxn) = self.env.read_txn() else {
            return hashes.to_vec();
        };

        hashes
            .iter()
            .filter(|h| {
                self.blocks
                    .get(&rtxn, h.as_bytes())
                    .ok()
                    .flatten()
                    .is_none()
            })
            .copied()
            .collect()
    }

    /// Reassemble the file a manifest describes, verifying every block.
    pub fn assemble(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let rtxn = self.env.read_txn()?;
        manifest.reconstruct(|hash| {
            self.blocks
                .get(&rtxn, hash.as_bytes())
                .ok()
                .flatten()
                .map(Bytes::copy_from_slice)
        })
    }

    /// Current refcount of a block (zero if never retained)
    #[must_use]
    pub fn refcount(&self, hash: &ContentHash) -> u64 {
        let Ok(rtxn) = self.env.read_txn() else {
            return 0;
        };
        self.read_count(&rtxn, hash).unwrap_or(0)
    }

    fn read_count(&self, txn: &heed::RoTxn<'_>, hash: &ContentHash) -> Result<u64> {
        let Some(raw) = self.refcounts.get(txn, hash.as_bytes())? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| SyncError::Codec(format!("bad refcount record for {hash}")))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Increment the refcount of each distinct hash by one
    pub fn retain<I>(&self, hashes: I) -> Result<()>
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let unique: HashSet<ContentHash> = hashes.into_iter().collect();
        let mut wtxn = self.env.write_txn()?;
        for hash in &unique {
            let count = self.read_count(&wtxn, hash)?;
            self.refcounts
                .put(&mut wtxn, hash.as_bytes(), &(count + 1).to_be_bytes())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Decrement the refcount of each distinct hash by one.
    ///
    /// Returns the hashes whose count reached zero.
    pub fn release<I>(&self, hashes: I) -> Result<Vec<ContentHash>>
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let unique: HashSet<ContentHash> = hashes.into_iter().collect();
        let mut unreferenced = Vec::new();
        let mut wtxn = self.env.write_txn()?;
        for hash in unique {
            match self.read_count(&wtxn, &hash)? {
                0 => {}
                1 => {
                    self.refcounts.delete(&mut wtxn, hash.as_bytes())?;
                    unreferenced.push(hash);
                }
                n => {
                    self.refcounts
                        .put(&mut wtxn, hash.as_bytes(), &(n - 1).to_be_bytes())?;
                }
            }
        }
        wtxn.commit()?;
        Ok(unreferenced)
    }

    /// Delete every block with no references that is not in `protected`.
    ///
    /// Blocks fetched by a session that never committed have no refcount
    /// record and are collected here too.
    pub fn collect_garbage(&self, protected: &HashSet<ContentHash>) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;

        let mut doomed = Vec::new();
        for entry in self.blocks.iter(&wtxn)? {
            let (key, _) = entry?;
            let Ok(raw) = <[u8; 32]>::try_from(key) else {
                continue;
            };
            let hash = ContentHash::from_raw(raw);
            if !protected.contains(&hash) && self.refcounts.get(&wtxn, key)?.is_none() {
                doomed.push(hash);
            }
        }

        for hash in &doomed {
            self.blocks.delete(&mut wtxn, hash.as_bytes())?;
        }
        wtxn.commit()?;

        if !doomed.is_empty() {
            debug!(collected = doomed.len(), "garbage-collected unreferenced blocks");
        }
        Ok(doomed.len())
    }

    /// Delete those `candidates` that still have no references and are not
    /// `protected`.
    pub fn delete_unreferenced(
        &self,
        candidates: &[ContentHash],
        protected: &HashSet<ContentHash>,
    ) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut wtxn = self.env.write_txn()?;
        let mut deleted = 0;
        for hash in candidates {
            if protected.contains(hash) || self.refcounts.get(&wtxn, hash.as_bytes())?.is_some() {
                continue;
            }
            if self.blocks.delete(&mut wtxn, hash.as_bytes())? {
                deleted += 1;
            }
        }
        wtxn.commit()?;
        Ok(deleted)
    }

    /// Get statistics about the store.
    #[must_use]
    pub fn stats(&self) -> Option<StoreStats> {
        let rtxn = self.env.read_txn().ok()?;
        let mut count = 0u64;
        let mut total_bytes = 0u64;

        for entry in self.blocks.iter(&rtxn).ok()? {
            let (_, data) = entry.ok()?;
            count += 1;
            total_bytes += data.len() as u64;
        }

        Some(StoreStats { count, total_bytes })
    }
}

/// Statistics about the block store
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Number of unique blocks stored
    pub count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

/// Blocks held by running sessions.
///
/// A session pins what it stores before committing a manifest that
/// references it; garbage collection runs under the pin lock and skips
/// pinned hashes.
#[derive(Debug, Default, Clone)]
pub struct BlockPins {
    inner: Arc<Mutex<HashMap<ContentHash, usize>>>,
}

impl BlockPins {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `hashes` until the returned guard is dropped
    #[must_use]
    pub fn pin<I>(&self, hashes: I) -> PinGuard
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let hashes: Vec<ContentHash> = hashes.into_iter().collect();
        let mut pins = self.inner.lock();
        for hash in &hashes {
            *pins.entry(*hash).or_insert(0) += 1;
        }
        PinGuard {
            pins: self.clone(),
            hashes,
        }
    }

    #[must_use]
    pub fn is_pinned(&self, hash: &ContentHash) -> bool {
        self.inner.lock().contains_key(hash)
    }

    /// Run `f` with the pinned set held stable
    pub fn with_pinned<R>(&self, f: impl FnOnce(&HashSet<ContentHash>) -> R) -> R {
        let pins = self.inner.lock();
        let pinned: HashSet<ContentHash> = pins.keys().copied().collect();
        f(&pinned)
    }
}

/// Releases its pins on drop
#[derive(Debug)]
pub struct PinGuard {
    pins: BlockPins,
    hashes: Vec<ContentHash>,
}

impl PinGuard {
    /// Pin more hashes under the same guard
    pub fn extend<I>(&mut self, hashes: I)
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let mut pins = self.pins.inner.lock();
        for hash in hashes {
            *pins.entry(hash).or_insert(0) += 1;
            self.hashes.push(hash);
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.inner.lock();
        for hash in &self.hashes {
            if let Some(count) = pins.get_mut(hash) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(hash);
                }
            }
        }
    }
}

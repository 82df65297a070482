//! The remote side of a sync, as seen by the engine
//!
//! Blocks are content-addressed and immutable, so putting one twice is
//! harmless. Manifest heads move only by compare-and-swap: a put names the
//! head it expects to replace and is refused with the actual head if the
//! remote moved on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::manifest::{Manifest, ManifestId};

/// Result of a compare-and-swap on a remote head
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Committed,
    /// The head was not the expected one; `current` is what it is now
    Conflict { current: Option<Manifest> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Store a block. Implementations verify the digest.
    async fn put_block(&self, hash: ContentHash, data: Bytes) -> Result<()>;

    async fn get_block(&self, hash: ContentHash) -> Result<Bytes>;

    /// The subset of `hashes` the remote does not hold
    async fn missing_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>>;

    /// Current head for `path`; `None` if never written or deleted
    async fn get_remote_manifest(&self, path: &str) -> Result<Option<Manifest>>;

    /// Move the head of `path` to `manifest` if it is still
    /// `expected_previous`. Every block the manifest references must already
    /// be stored.
    async fn put_manifest(
        &self,
        path: &str,
        manifest: &Manifest,
        expected_previous: Option<ManifestId>,
    ) -> Result<PutOutcome>;

    /// Delete the head of `path` if it is still `expected_previous`.
    /// Remote history is kept.
    async fn delete_manifest(&self, path: &str, expected_previous: ManifestId)
    -> Result<PutOutcome>;

    /// Paths with a live head
    async fn list_remote(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
struct RemoteState {
    blocks: HashMap<ContentHash, Bytes>,
    heads: HashMap<String, Manifest>,
    history: HashMap<String, Vec<Manifest>>,
}

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming block puts with a transient error
    failing_puts: u32,
    /// Fail every block put
    puts_down: bool,
    /// Serve these blocks with a flipped byte
    corrupt: HashSet<ContentHash>,
    put_delay: Option<Duration>,
    /// Head another writer commits just before our next put to that path
    racing_put: Option<(String, Manifest)>,
}

/// In-memory remote with fault injection
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<RemoteState>,
    faults: Mutex<Faults>,
    uploaded: Mutex<Vec<ContentHash>>,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` block puts with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.faults.lock().failing_puts = n;
    }

    /// Fail every block put until switched back
    pub fn set_puts_down(&self, down: bool) {
        self.faults.lock().puts_down = down;
    }

    /// Serve `hash` with corrupted bytes
    pub fn corrupt_block(&self, hash: ContentHash) {
        self.faults.lock().corrupt.insert(hash);
    }

    /// Delay every block put
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        self.faults.lock().put_delay = delay;
    }

    /// Let `manifest` win the race for `path`: it becomes the head right
    /// before the next `put_manifest` to that path is checked
    pub fn race_next_manifest_put(&self, path: &str, manifest: Manifest) {
        self.faults.lock().racing_put = Some((path.to_string(), manifest));
    }

    /// Blocks stored by successful puts, in order
    #[must_use]
    pub fn uploaded(&self) -> Vec<ContentHash> {
        self.uploaded.lock().clone()
    }

    pub fn clear_uploaded(&self) {
        self.uploaded.lock().clear();
    }

    #[must_use]
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn has_block(&self, hash: &ContentHash) -> bool {
        self.state.lock().blocks.contains_key(hash)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Every manifest ever committed for `path`, oldest first
    #[must_use]
    pub fn remote_history(&self, path: &str) -> Vec<Manifest> {
        self.state
            .lock()
            .history
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Reassemble the current remote content of `path`
    pub fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        let Some(head) = state.heads.get(path) else {
            return Ok(None);
        };
        head.reconstruct(|h| state.blocks.get(h).cloned()).map(Some)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn put_block(&self, hash: ContentHash, data: Bytes) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let delay = {
            let mut faults = self.faults.lock();
            if faults.puts_down {
                return Err(SyncError::transient("put_block", "remote unavailable"));
            }
            if faults.failing_puts > 0 {
                faults.failing_puts -= 1;
                return Err(SyncError::transient("put_block", "connection reset"));
            }
            faults.put_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if ContentHash::from_bytes(&data) != hash {
            return Err(SyncError::integrity(
                format!("block {hash}"),
                "uploaded bytes do not match the digest",
            ));
        }
        self.state.lock().blocks.entry(hash).or_insert(data);
        self.uploaded.lock().push(hash);
        Ok(())
    }

    async fn get_block(&self, hash: ContentHash) -> Result<Bytes> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let data = self
            .state
            .lock()
            .blocks
            .get(&hash)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("remote block {hash}")))?;

        if self.faults.lock().corrupt.contains(&hash) {
            let mut bad = data.to_vec();
            if let Some(first) = bad.first_mut() {
                *first ^= 0xff;
            }
            return Ok(Bytes::from(bad));
        }
        Ok(data)
    }

    async fn missing_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        let state = self.state.lock();
        Ok(hashes
            .iter()
            .filter(|h| !state.blocks.contains_key(h))
            .copied()
            .collect())
    }

    async fn get_remote_manifest(&self, path: &str) -> Result<Option<Manifest>> {
        Ok(self.state.lock().heads.get(path).cloned())
    }

    async fn put_manifest(
        &self,
        path: &str,
        manifest: &Manifest,
        expected_previous: Option<ManifestId>,
    ) -> Result<PutOutcome> {
        let racer = {
            let mut faults = self.faults.lock();
            if faults
                .racing_put
                .as_ref()
                .is_some_and(|(racing, _)| racing == path)
            {
                faults.racing_put.take()
            } else {
                None
            }
        };
        let mut state = self.state.lock();
        if let Some((racing, racer)) = racer {
            state.heads.insert(racing.clone(), racer.clone());
            state.history.entry(racing).or_default().push(racer);
        }

        let current = state.heads.get(path);
        if current.map(|m| m.id) != expected_previous {
            return Ok(PutOutcome::Conflict {
                current: current.cloned(),
            });
        }
        if let Some(missing) = manifest.hashes().find(|h| !state.blocks.contains_key(h)) {
            return Err(SyncError::integrity(
                path,
                format!("manifest references block {missing} the remote does not hold"),
            ));
        }

        state.heads.insert(path.to_string(), manifest.clone());
        state
            .history
            .entry(path.to_string())
            .or_default()
            .push(manifest.clone());
        Ok(PutOutcome::Committed)
    }

    async fn delete_manifest(
        &self,
        path: &str,
        expected_previous: ManifestId,
    ) -> Result<PutOutcome> {
        let mut state = self.state.lock();
        let current = state.heads.get(path);
        if current.map(|m| m.id) != Some(expected_previous) {
            return Ok(PutOutcome::Conflict {
                current: current.cloned(),
            });
        }
        state.heads.remove(path);
        Ok(PutOutcome::Committed)
    }

    async fn list_remote(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self.state.lock().heads.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BlockRef, WriteStamp};

    fn single_block(path: &str, data: &'static [u8]) -> (Manifest, Bytes) {
        let hash = ContentHash::from_bytes(data);
        let blocks = vec![BlockRef {
            hash,
            offset: 0,
            length: data.len() as u32,
        }];
        let manifest = Manifest::build(path, data, blocks, None, WriteStamp::after(None, 0, "t"));
        (manifest, Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let remote = MemoryTransport::new();
        let (v1, b1) = single_block("a.txt", b"one");
        let (v2, b2) = single_block("a.txt", b"two");
        remote.put_block(v1.blocks[0].hash, b1).await.unwrap();
        remote.put_block(v2.blocks[0].hash, b2).await.unwrap();

        assert_eq!(
            remote.put_manifest("a.txt", &v1, None).await.unwrap(),
            PutOutcome::Committed
        );

        // Stale expectation is refused with the actual head
        let outcome = remote.put_manifest("a.txt", &v2, None).await.unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Conflict {
                current: Some(v1.clone())
            }
        );

        assert_eq!(
            remote.put_manifest("a.txt", &v2, Some(v1.id)).await.unwrap(),
            PutOutcome::Committed
        );
        assert_eq!(remote.remote_history("a.txt").len(), 2);
        assert_eq!(remote.read_file("a.txt").unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_manifest_requires_blocks() {
        let remote = MemoryTransport::new();
        let (v1, _) = single_block("a.txt", b"one");
        let err = remote.put_manifest("a.txt", &v1, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(remote.get_remote_manifest("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_block_verifies_digest() {
        let remote = MemoryTransport::new();
        let err = remote
            .put_block(ContentHash::from_bytes(b"x"), Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let remote = MemoryTransport::new();
        let (v1, b1) = single_block("a.txt", b"one");
        remote.put_block(v1.blocks[0].hash, b1).await.unwrap();
        remote.put_manifest("a.txt", &v1, None).await.unwrap();

        assert_eq!(
            remote.delete_manifest("a.txt", v1.id).await.unwrap(),
            PutOutcome::Committed
        );
        assert!(remote.list_remote().await.unwrap().is_empty());
        assert_eq!(remote.remote_history("a.txt").len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryTransport::new();
        remote.fail_next_puts(1);
        let data = Bytes::from_static(b"payload");
        let hash = ContentHash::from_bytes(&data);

        let err = remote.put_block(hash, data.clone()).await.unwrap_err();
        assert!(err.is_transient());
        remote.put_block(hash, data).await.unwrap();
        assert_eq!(remote.put_calls(), 2);
        assert_eq!(remote.uploaded(), vec![hash]);

        remote.corrupt_block(hash);
        let served = remote.get_block(hash).await.unwrap();
        assert_ne!(ContentHash::from_bytes(&served), hash);
    }
}

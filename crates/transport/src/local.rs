//! Directory-backed remote
//!
//! `LocalTransport` keeps a remote in an LMDB environment on the local
//! filesystem: a shared directory, a mounted drive, or a scratch dir in
//! tests. Several engines (in one process or several) can use the same
//! directory as their common remote.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use blocksync_core::error::{Result, SyncError};
use blocksync_core::{ContentHash, Manifest, ManifestId, PutOutcome, Transport};
use bytes::Bytes;
use heed::types::{Bytes as HeedBytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use tracing::{debug, trace};

/// zstd level for stored blocks
const COMPRESSION_LEVEL: i32 = 3;

/// Remote stored in a local directory.
///
/// `blocks`: hash -> zstd-compressed block
/// `manifests`: manifest id -> encoded manifest
/// `heads`: path -> id of the current manifest
/// `history`: path -> ids of every manifest committed for it, oldest first
///
/// Head moves happen inside one LMDB write transaction, which makes the
/// compare-and-swap atomic across every process sharing the directory.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    env: Env,
    blocks: Database<HeedBytes, HeedBytes>,
    manifests: Database<HeedBytes, HeedBytes>,
    heads: Database<Str, HeedBytes>,
    history: Database<Str, HeedBytes>,
}

/// Counts for `blocksync remote` style status output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStats {
    pub blocks: u64,
    pub manifests: u64,
    pub live_paths: u64,
}

impl LocalTransport {
    /// Open or create a remote in `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        // SAFETY: Standard LMDB memory-mapped I/O; other processes only
        // touch the environment through LMDB itself.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024 * 1024)
                .max_dbs(4)
                .open(&root)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("blocks")
            .create(&mut wtxn)?;
        let manifests = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("manifests")
            .create(&mut wtxn)?;
        let heads = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("heads")
            .create(&mut wtxn)?;
        let history = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("history")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        debug!(root = %root.display(), "opened local remote");
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                env,
                blocks,
                manifests,
                heads,
                history,
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Every manifest committed for `path`, oldest first
    pub fn history(&self, path: &str) -> Result<Vec<Manifest>> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        let Some(ids) = inner.history.get(&rtxn, path)? else {
            return Ok(Vec::new());
        };
        ids.chunks_exact(16)
            .filter_map(|raw| inner.read_manifest(&rtxn, &raw_id(raw)).transpose())
            .collect()
    }

    /// Reassemble the current content of `path`
    pub fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        let Some(head) = inner.read_head(&rtxn, path)? else {
            return Ok(None);
        };
        let mut missing = None;
        let data = head.reconstruct(|hash| match inner.read_block(&rtxn, hash) {
            Ok(Some(data)) => Some(data),
            _ => {
                missing = Some(*hash);
                None
            }
        });
        match (data, missing) {
            (Ok(data), _) => Ok(Some(data)),
            (Err(_), Some(hash)) => Err(SyncError::NotFound(format!("remote block {hash}"))),
            (Err(err), None) => Err(err),
        }
    }

    pub fn stats(&self) -> Result<RemoteStats> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        Ok(RemoteStats {
            blocks: inner.blocks.len(&rtxn)?,
            manifests: inner.manifests.len(&rtxn)?,
            live_paths: inner.heads.len(&rtxn)?,
        })
    }
}

fn raw_id(raw: &[u8]) -> ManifestId {
    let mut id = [0u8; 16];
    id.copy_from_slice(raw);
    ManifestId::from_raw(id)
}

impl Inner {
    fn read_manifest(&self, txn: &RoTxn<'_>, id: &ManifestId) -> Result<Option<Manifest>> {
        self.manifests
            .get(txn, id.as_bytes())?
            .map(Manifest::from_bytes)
            .transpose()
    }

    fn read_head(&self, txn: &RoTxn<'_>, path: &str) -> Result<Option<Manifest>> {
        match self.heads.get(txn, path)? {
            Some(raw) => self.read_manifest(txn, &raw_id(raw)),
            None => Ok(None),
        }
    }

    fn read_block(&self, txn: &RoTxn<'_>, hash: &ContentHash) -> Result<Option<Bytes>> {
        match self.blocks.get(txn, hash.as_bytes())? {
            Some(compressed) => Ok(Some(Bytes::from(zstd::stream::decode_all(compressed)?))),
            None => Ok(None),
        }
    }
}

impl Inner {
    fn store_block(&self, hash: ContentHash, data: &[u8]) -> Result<()> {
        let compressed = zstd::stream::encode_all(data, COMPRESSION_LEVEL)?;
        let mut wtxn = self.env.write_txn()?;
        if self.blocks.get(&wtxn, hash.as_bytes())?.is_none() {
            self.blocks.put(&mut wtxn, hash.as_bytes(), &compressed)?;
            trace!(%hash, raw = data.len(), stored = compressed.len(), "block stored");
        }
        wtxn.commit()?;
        Ok(())
    }

    fn swap_head(
        &self,
        path: &str,
        manifest: &Manifest,
        expected_previous: Option<ManifestId>,
    ) -> Result<PutOutcome> {
        let mut wtxn = self.env.write_txn()?;

        let current = self.read_head(&wtxn, path)?;
        if current.as_ref().map(|m| m.id) != expected_previous {
            debug!(path, "head moved, refusing manifest");
            return Ok(PutOutcome::Conflict { current });
        }
        for hash in manifest.unique_hashes() {
            if self.blocks.get(&wtxn, hash.as_bytes())?.is_none() {
                return Err(SyncError::integrity(
                    path,
                    format!("manifest references block {hash} the remote does not hold"),
                ));
            }
        }

        let id = manifest.id;
        self.manifests
            .put(&mut wtxn, id.as_bytes(), &manifest.to_bytes()?)?;
        self.heads.put(&mut wtxn, path, id.as_bytes())?;

        let mut ids = self
            .history
            .get(&wtxn, path)?
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        ids.extend_from_slice(id.as_bytes());
        self.history.put(&mut wtxn, path, &ids)?;

        wtxn.commit()?;
        debug!(path, manifest = %id, "head moved");
        Ok(PutOutcome::Committed)
    }

    fn drop_head(&self, path: &str, expected_previous: ManifestId) -> Result<PutOutcome> {
        let mut wtxn = self.env.write_txn()?;
        let current = self.read_head(&wtxn, path)?;
        if current.as_ref().map(|m| m.id) != Some(expected_previous) {
            return Ok(PutOutcome::Conflict { current });
        }
        self.heads.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        debug!(path, "head deleted");
        Ok(PutOutcome::Committed)
    }
}

impl LocalTransport {
    /// Run `f` on the blocking pool; write transactions wait on the LMDB
    /// writer lock, which may be held by another process
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn put_block(&self, hash: ContentHash, data: Bytes) -> Result<()> {
        let computed = ContentHash::from_bytes(&data);
        if computed != hash {
            return Err(SyncError::integrity(
                format!("block {hash}"),
                format!("uploaded bytes hash to {computed}"),
            ));
        }
        self.blocking(move |inner| inner.store_block(hash, &data))
            .await
    }

    async fn get_block(&self, hash: ContentHash) -> Result<Bytes> {
        self.blocking(move |inner| {
            let rtxn = inner.env.read_txn()?;
            inner
                .read_block(&rtxn, &hash)?
                .ok_or_else(|| SyncError::NotFound(format!("remote block {hash}")))
        })
        .await
    }

    async fn missing_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        let mut missing = Vec::new();
        for hash in hashes {
            if inner.blocks.get(&rtxn, hash.as_bytes())?.is_none() {
                missing.push(*hash);
            }
        }
        Ok(missing)
    }

    async fn get_remote_manifest(&self, path: &str) -> Result<Option<Manifest>> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        inner.read_head(&rtxn, path)
    }

    async fn put_manifest(
        &self,
        path: &str,
        manifest: &Manifest,
        expected_previous: Option<ManifestId>,
    ) -> Result<PutOutcome> {
        let path = path.to_string();
        let manifest = manifest.clone();
        self.blocking(move |inner| inner.swap_head(&path, &manifest, expected_previous))
            .await
    }

    async fn delete_manifest(
        &self,
        path: &str,
        expected_previous: ManifestId,
    ) -> Result<PutOutcome> {
        let path = path.to_string();
        self.blocking(move |inner| inner.drop_head(&path, expected_previous))
            .await
    }

    async fn list_remote(&self) -> Result<Vec<String>> {
        let inner = &self.inner;
        let rtxn = inner.env.read_txn()?;
        let mut paths = Vec::new();
        for entry in inner.heads.iter(&rtxn)? {
            let (path, _) = entry?;
            paths.push(path.to_string());
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use blocksync_core::{BlockRef, WriteStamp};
    use tempfile::TempDir;

    use super::*;

    fn single_block(path: &str, data: &[u8], parent: Option<&Manifest>) -> Manifest {
        let hash = ContentHash::from_bytes(data);
        let blocks = vec![BlockRef {
            hash,
            offset: 0,
            length: data.len() as u32,
        }];
        Manifest::build(
            path,
            data,
            blocks,
            parent.map(|p| p.id),
            WriteStamp::after(parent, 0, "test"),
        )
    }

    async fn upload(remote: &LocalTransport, data: &'static [u8]) {
        remote
            .put_block(ContentHash::from_bytes(data), Bytes::from_static(data))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocks_round_trip_compressed() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        let data = Bytes::from(vec![7u8; 64 * 1024]);
        let hash = ContentHash::from_bytes(&data);

        assert_eq!(remote.missing_blocks(&[hash]).await.unwrap(), vec![hash]);
        remote.put_block(hash, data.clone()).await.unwrap();
        remote.put_block(hash, data.clone()).await.unwrap();
        assert!(remote.missing_blocks(&[hash]).await.unwrap().is_empty());
        assert_eq!(remote.get_block(hash).await.unwrap(), data);
        assert_eq!(remote.stats().unwrap().blocks, 1);
    }

    #[tokio::test]
    async fn test_put_block_checks_digest() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        let err = remote
            .put_block(ContentHash::from_bytes(b"one"), Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_head_moves_by_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        upload(&remote, b"v1").await;
        upload(&remote, b"v2").await;

        let v1 = single_block("a.txt", b"v1", None);
        let v2 = single_block("a.txt", b"v2", Some(&v1));
        assert_eq!(
            remote.put_manifest("a.txt", &v1, None).await.unwrap(),
            PutOutcome::Committed
        );

        // A writer that never saw v1
        let stale = single_block("a.txt", b"v2", None);
        match remote.put_manifest("a.txt", &stale, None).await.unwrap() {
            PutOutcome::Conflict { current } => assert_eq!(current.unwrap().id, v1.id),
            PutOutcome::Committed => panic!("stale put must not commit"),
        }

        assert_eq!(
            remote.put_manifest("a.txt", &v2, Some(v1.id)).await.unwrap(),
            PutOutcome::Committed
        );
        assert_eq!(remote.read_file("a.txt").unwrap().unwrap(), b"v2");
        let history: Vec<_> = remote.history("a.txt").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(history, vec![v1.id, v2.id]);
    }

    #[tokio::test]
    async fn test_manifest_needs_its_blocks() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        let manifest = single_block("a.txt", b"never uploaded", None);
        let err = remote.put_manifest("a.txt", &manifest, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(remote.list_remote().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        upload(&remote, b"data").await;
        let manifest = single_block("a.txt", b"data", None);
        remote.put_manifest("a.txt", &manifest, None).await.unwrap();

        let wrong = ManifestId::new();
        assert!(matches!(
            remote.delete_manifest("a.txt", wrong).await.unwrap(),
            PutOutcome::Conflict { .. }
        ));
        assert_eq!(
            remote.delete_manifest("a.txt", manifest.id).await.unwrap(),
            PutOutcome::Committed
        );
        assert!(remote.get_remote_manifest("a.txt").await.unwrap().is_none());
        assert_eq!(remote.history("a.txt").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_sees_committed_state() {
        let dir = TempDir::new().unwrap();
        let manifest = single_block("docs/a.txt", b"data", None);
        {
            let remote = LocalTransport::open(dir.path()).unwrap();
            upload(&remote, b"data").await;
            remote.put_manifest("docs/a.txt", &manifest, None).await.unwrap();
        }
        let remote = LocalTransport::open(dir.path()).unwrap();
        assert_eq!(remote.list_remote().await.unwrap(), vec!["docs/a.txt".to_string()]);
        assert_eq!(
            remote.get_remote_manifest("docs/a.txt").await.unwrap().unwrap().id,
            manifest.id
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_writes_leave_the_runtime_free() {
        let dir = TempDir::new().unwrap();
        let remote = LocalTransport::open(dir.path()).unwrap();
        upload(&remote, b"base").await;
        let base = single_block("a.txt", b"base", None);

        // Racing writers on a single-threaded runtime; exactly one wins
        let mut set = tokio::task::JoinSet::new();
        for n in 0..8u8 {
            let remote = remote.clone();
            let base = base.clone();
            let data = vec![n; 4096];
            set.spawn(async move {
                let hash = ContentHash::from_bytes(&data);
                remote.put_block(hash, Bytes::from(data)).await.unwrap();
                remote.put_manifest("a.txt", &base, None).await.unwrap()
            });
        }
        let mut committed = 0;
        while let Some(outcome) = set.join_next().await {
            if outcome.unwrap() == PutOutcome::Committed {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
        assert_eq!(remote.stats().unwrap().blocks, 9);
        assert_eq!(remote.history("a.txt").unwrap().len(), 1);
    }
}

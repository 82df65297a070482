//! Block transfer between the local block store and the remote
//!
//! Only blocks the destination lacks are moved. Transfers within one file
//! run concurrently up to the configured fan-out, each retried on transient
//! failure. The coordinator never touches manifests: a manifest is
//! committed by the caller once every block it references has landed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::blocks::{BlockPins, BlockStore, PinGuard};
use crate::chunker::block_bytes;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::manifest::Manifest;
use crate::remote::Transport;
use crate::retry::{RetryConfig, retry};

/// Counts from one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Blocks actually moved
    pub transferred: usize,
    /// Blocks the destination already had
    pub skipped: usize,
    pub bytes: u64,
}

impl std::ops::AddAssign for TransferStats {
    fn add_assign(&mut self, rhs: Self) {
        self.transferred += rhs.transferred;
        self.skipped += rhs.skipped;
        self.bytes += rhs.bytes;
    }
}

pub struct TransferCoordinator {
    transport: Arc<dyn Transport>,
    blocks: Arc<BlockStore>,
    pins: BlockPins,
    retry: RetryConfig,
    fanout: usize,
}

impl TransferCoordinator {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        blocks: Arc<BlockStore>,
        pins: BlockPins,
        retry: RetryConfig,
        fanout: usize,
    ) -> Self {
        Self {
            transport,
            blocks,
            pins,
            retry,
            fanout: fanout.max(1),
        }
    }

    /// Upload the `candidates` of `manifest` the remote does not hold.
    ///
    /// Block bytes come from `source` (the file being committed) when given,
    /// otherwise from the local block store.
    #[instrument(skip_all, fields(path = %manifest.path))]
    pub async fn upload(
        &self,
        manifest: &Manifest,
        candidates: &[ContentHash],
        source: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        if candidates.is_empty() {
            return Ok(TransferStats::default());
        }

        let missing = retry("missing_blocks", &self.retry, cancel, || {
            self.transport.missing_blocks(candidates)
        })
        .await?;

        let refs: HashMap<ContentHash, _> = manifest.blocks.iter().map(|b| (b.hash, b)).collect();
        let mut payloads = Vec::with_capacity(missing.len());
        for hash in &missing {
            let data = match (source, refs.get(hash)) {
                (Some(source), Some(block)) => Bytes::copy_from_slice(block_bytes(source, block)),
                _ => self
                    .blocks
                    .get(hash)
                    .ok_or_else(|| SyncError::NotFound(format!("local block {hash}")))?,
            };
            payloads.push((*hash, data));
        }

        let bytes: u64 = payloads.iter().map(|(_, d)| d.len() as u64).sum();
        let uploads = stream::iter(payloads)
            .map(|(hash, data)| async move {
                retry("put_block", &self.retry, cancel, || {
                    self.transport.put_block(hash, data.clone())
                })
                .await
            })
            .buffer_unordered(self.fanout)
            .try_collect::<Vec<()>>();

        tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = uploads => { result?; }
        }

        let stats = TransferStats {
            transferred: missing.len(),
            skipped: candidates.len() - missing.len(),
            bytes,
        };
        debug!(uploaded = stats.transferred, skipped = stats.skipped, "blocks uploaded");
        Ok(stats)
    }

    /// Fetch every block of `manifest` missing from the local store.
    ///
    /// Each block is verified against its digest before it is stored. The
    /// returned guard pins the manifest's blocks; hold it until the manifest
    /// is committed locally.
    #[instrument(skip_all, fields(path = %manifest.path))]
    pub async fn download(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<(TransferStats, PinGuard)> {
        let unique = manifest.unique_hashes();
        let guard = self.pins.pin(unique.iter().copied());
        let needed = self.blocks.find_missing(&unique);

        let lengths: HashMap<ContentHash, u32> =
            manifest.blocks.iter().map(|b| (b.hash, b.length)).collect();

        let fetches = stream::iter(needed.iter().copied())
            .map(|hash| {
                let expected_len = lengths.get(&hash).copied().unwrap_or_default();
                async move {
                    let data = retry("get_block", &self.retry, cancel, || async move {
                        let data = self.transport.get_block(hash).await?;
                        verify_block(hash, expected_len, &data)?;
                        Ok(data)
                    })
                    .await?;
                    self.blocks.put(&hash, &data)?;
                    Ok::<u64, SyncError>(data.len() as u64)
                }
            })
            .buffer_unordered(self.fanout)
            .try_collect::<Vec<u64>>();

        let sizes = tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = fetches => result?,
        };

        let stats = TransferStats {
            transferred: needed.len(),
            skipped: unique.len() - needed.len(),
            bytes: sizes.iter().sum(),
        };
        debug!(downloaded = stats.transferred, skipped = stats.skipped, "blocks downloaded");
        Ok((stats, guard))
    }
}

fn verify_block(hash: ContentHash, expected_len: u32, data: &[u8]) -> Result<()> {
    if data.len() != expected_len as usize || ContentHash::from_bytes(data) != hash {
        return Err(SyncError::integrity(
            format!("block {hash}"),
            "downloaded bytes do not match the digest",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkConfig, chunk_data};
    use crate::manifest::WriteStamp;
    use crate::remote::MemoryTransport;
    use crate::test_support::noise;

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: Arc<MemoryTransport>,
        blocks: Arc<BlockStore>,
        coordinator: TransferCoordinator,
    }

    fn fixture(retry: RetryConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryTransport::new());
        let blocks = Arc::new(BlockStore::open(dir.path(), 64 * 1024 * 1024).unwrap());
        let coordinator =
            TransferCoordinator::new(remote.clone(), blocks.clone(), BlockPins::new(), retry, 4);
        Fixture {
            _dir: dir,
            remote,
            blocks,
            coordinator,
        }
    }

    fn manifest(data: &[u8]) -> Manifest {
        let blocks = chunk_data(data, &ChunkConfig::default()).collect();
        Manifest::build("f.bin", data, blocks, None, WriteStamp::after(None, 0, "t"))
    }

    #[tokio::test]
    async fn test_upload_skips_blocks_remote_has() {
        let f = fixture(RetryConfig::fast(3));
        let cancel = CancellationToken::new();
        let data = noise(b"upload", 100_000);
        let m = manifest(&data);
        let all = m.unique_hashes();

        let first = f.coordinator.upload(&m, &all, Some(&data), &cancel).await.unwrap();
        assert_eq!(first.transferred, all.len());

        let second = f.coordinator.upload(&m, &all, Some(&data), &cancel).await.unwrap();
        assert_eq!(second.transferred, 0);
        assert_eq!(second.skipped, all.len());
        assert_eq!(f.remote.uploaded().len(), all.len());
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let f = fixture(RetryConfig::fast(5));
        let cancel = CancellationToken::new();
        let data = noise(b"retry", 10_000);
        let m = manifest(&data);

        f.remote.fail_next_puts(2);
        let stats = f
            .coordinator
            .upload(&m, &m.unique_hashes(), Some(&data), &cancel)
            .await
            .unwrap();
        assert_eq!(stats.transferred, 1);
        assert_eq!(f.remote.put_calls(), 3);
    }

    #[tokio::test]
    async fn test_upload_exhaustion() {
        let f = fixture(RetryConfig::fast(3));
        let cancel = CancellationToken::new();
        let data = noise(b"down", 10_000);
        let m = manifest(&data);

        f.remote.set_puts_down(true);
        let err = f
            .coordinator
            .upload(&m, &m.unique_hashes(), Some(&data), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransferExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_download_verifies_and_stores() {
        let f = fixture(RetryConfig::fast(3));
        let cancel = CancellationToken::new();
        let data = noise(b"download", 100_000);
        let m = manifest(&data);
        f.coordinator
            .upload(&m, &m.unique_hashes(), Some(&data), &cancel)
            .await
            .unwrap();

        let (stats, _guard) = f.coordinator.download(&m, &cancel).await.unwrap();
        assert_eq!(stats.transferred, m.unique_hashes().len());
        assert_eq!(f.blocks.assemble(&m).unwrap(), data);

        // Everything is local now
        let (again, _guard) = f.coordinator.download(&m, &cancel).await.unwrap();
        assert_eq!(again.transferred, 0);
    }

    #[tokio::test]
    async fn test_download_rejects_corrupt_block_without_retry() {
        let f = fixture(RetryConfig::fast(5));
        let cancel = CancellationToken::new();
        let data = noise(b"corrupt", 100_000);
        let m = manifest(&data);
        f.coordinator
            .upload(&m, &m.unique_hashes(), Some(&data), &cancel)
            .await
            .unwrap();

        let victim = m.blocks[0].hash;
        f.remote.corrupt_block(victim);
        let err = f.coordinator.download(&m, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(!f.blocks.contains(&victim));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_uploads() {
        let f = fixture(RetryConfig::fast(3));
        let cancel = CancellationToken::new();
        let data = noise(b"slow", 100_000);
        let m = manifest(&data);

        f.remote
            .set_put_delay(Some(std::time::Duration::from_secs(30)));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f
            .coordinator
            .upload(&m, &m.unique_hashes(), Some(&data), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(f.remote.block_count(), 0);
    }
}

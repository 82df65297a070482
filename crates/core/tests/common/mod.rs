#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use blocksync_core::config::RetrySettings;
use blocksync_core::{ConflictPolicy, EngineConfig, MemoryTransport, SyncEngine};
use filetime::FileTime;
use tempfile::TempDir;

/// Deterministic incompressible bytes
pub fn noise(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    blake3::Hasher::new()
        .update(seed)
        .finalize_xof()
        .fill(&mut out);
    out
}

pub fn config(client: &str, policy: ConflictPolicy) -> EngineConfig {
    EngineConfig {
        client_name: client.to_string(),
        conflict_policy: policy,
        retry: RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        },
        ..EngineConfig::default()
    }
}

pub struct Client {
    pub dir: TempDir,
    pub engine: SyncEngine,
}

impl Client {
    pub fn new(name: &str, remote: &Arc<MemoryTransport>, policy: ConflictPolicy) -> Self {
        Self::with_config(remote, config(name, policy))
    }

    pub fn with_config(remote: &Arc<MemoryTransport>, config: EngineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::builder(dir.path(), remote.clone())
            .config(config)
            .open()
            .unwrap();
        Self { dir, engine }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, data: &[u8]) {
        write_file(self.root(), path, data);
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root().join(path)).ok()
    }

    pub fn remove(&self, path: &str) {
        std::fs::remove_file(self.root().join(path)).unwrap();
    }
}

static CLOCK: AtomicI64 = AtomicI64::new(0);

/// Write a file and give it an mtime later than any previous write, so
/// edits are visible to the metadata quick check
pub fn write_file(root: &Path, path: &str, data: &[u8]) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&full, data).unwrap();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let tick = CLOCK.fetch_add(1, Ordering::SeqCst);
    filetime::set_file_mtime(&full, FileTime::from_unix_time(now + 1_000 + tick, 0)).unwrap();
}

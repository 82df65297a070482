//! Engines syncing through a shared directory remote

use std::sync::Arc;

use blocksync_core::config::RetrySettings;
use blocksync_core::{ConflictPolicy, EngineConfig, SyncAction, SyncEngine};
use blocksync_transport::LocalTransport;
use filetime::FileTime;
use tempfile::TempDir;

fn engine(root: &TempDir, remote: &LocalTransport, name: &str) -> SyncEngine {
    let config = EngineConfig {
        client_name: name.to_string(),
        conflict_policy: ConflictPolicy::KeepBoth,
        retry: RetrySettings {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            factor: 2.0,
        },
        ..EngineConfig::default()
    };
    SyncEngine::builder(root.path(), Arc::new(remote.clone()))
        .config(config)
        .open()
        .unwrap()
}

fn write(root: &TempDir, path: &str, data: &[u8], mtime: i64) {
    let full = root.path().join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(&full, data).unwrap();
    filetime::set_file_mtime(&full, FileTime::from_unix_time(mtime, 0)).unwrap();
}

#[tokio::test]
async fn test_two_clients_through_directory_remote() {
    let remote_dir = TempDir::new().unwrap();
    let remote = LocalTransport::open(remote_dir.path()).unwrap();
    let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = engine(&a_dir, &remote, "alpha");
    let b = engine(&b_dir, &remote, "beta");

    let big: Vec<u8> = (0..200_000u32).flat_map(|i| i.wrapping_mul(2_654_435_761).to_le_bytes()).collect();
    write(&a_dir, "data/big.bin", &big, 1_800_000_000);
    write(&a_dir, "notes.txt", b"hello", 1_800_000_000);
    let report = a.sync_all().await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.changed().count(), 2);

    let report = b.sync_all().await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(std::fs::read(b_dir.path().join("data/big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(b_dir.path().join("notes.txt")).unwrap(), b"hello");

    // An edit on one side flows to the other
    write(&b_dir, "notes.txt", b"hello from beta", 1_800_000_100);
    let report = b.sync_path("notes.txt").await.unwrap();
    assert_eq!(report.action, SyncAction::Uploaded);
    a.sync_all().await.unwrap();
    assert_eq!(
        std::fs::read(a_dir.path().join("notes.txt")).unwrap(),
        b"hello from beta"
    );
    assert_eq!(remote.history("notes.txt").unwrap().len(), 2);
    assert_eq!(remote.stats().unwrap().live_paths, 2);
}

//! blocksync-core: Differential block-level sync engine
//!
//! Files are cut into content-defined blocks, described by manifests, and
//! synced against a remote that moves each path's head by compare-and-swap.
//! Only blocks the remote lacks are ever transferred.

pub mod blocks;
pub mod chunker;
pub mod config;
pub mod conflict;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod hash;
pub mod manifest;
pub mod merge;
pub mod remote;
pub mod retry;
pub mod scan;
pub mod scope;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod sync_state;
pub mod transfer;

pub use blocks::{BlockPins, BlockStore};
pub use chunker::{ChunkConfig, Segmenter};
pub use config::EngineConfig;
pub use conflict::{ConflictPolicy, ConflictRecord, Resolution};
pub use engine::{EngineBuilder, ScopeUpdate, SessionReport, SyncAction, SyncEngine, SyncReport};
pub use error::{Result, SyncError};
pub use events::{ChannelSink, EventSink, SyncEvent, TracingSink};
pub use hash::ContentHash;
pub use manifest::{BlockRef, Manifest, ManifestId, WriteStamp};
pub use remote::{MemoryTransport, PutOutcome, Transport};
pub use retry::RetryConfig;
pub use scan::Scanner;
pub use scope::{ScopeFilter, ScopeRule};
pub use session::{SessionState, SyncSession};
pub use snapshot::Snapshot;
pub use store::{ManifestStore, RetentionPolicy};
pub use sync_state::{FileEntity, SyncStatus};

#[cfg(test)]
pub(crate) mod test_support {
    /// Deterministic incompressible bytes
    pub fn noise(seed: &[u8], len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        blake3::Hasher::new()
            .update(seed)
            .finalize_xof()
            .fill(&mut out);
        out
    }
}

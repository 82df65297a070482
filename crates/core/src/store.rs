//! Manifest store: committed manifests, per-path history, file entities
//!
//! Each path has a head pointer and a singly-linked chain of prior versions.
//! Committing moves the head and links the previous head behind it; older
//! versions only disappear when the retention policy evicts them.
//!
//! Layout (one LMDB environment):
//! - `nodes`: manifest id -> history node (previous id, commit time, manifest)
//! - `heads`: path -> head id + tombstone flag
//! - `files`: path -> [`FileEntity`]
//! - `pending`: path -> open [`ConflictRecord`]
//! - `audit`: (detected_at, record id) -> resolved [`ConflictRecord`]

use std::path::Path;
use std::time::Duration;

use heed::types::{Bytes as HeedBytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::conflict::ConflictRecord;
use crate::error::{Result, SyncError};
use crate::manifest::{Manifest, ManifestId, now_ms};
use crate::sync_state::FileEntity;

/// Bounds on how much history is kept per path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Versions kept per path, the head included
    pub max_versions: usize,
    /// Non-head versions committed longer ago than this are evicted
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_versions: 25,
            max_age: None,
        }
    }
}

impl RetentionPolicy {
    fn keeps(&self, index: usize, committed_at_ms: i64, now: i64) -> bool {
        if index == 0 {
            return true;
        }
        if index >= self.max_versions {
            return false;
        }
        match self.max_age {
            Some(age) => now.saturating_sub(committed_at_ms) <= age.as_millis() as i64,
            None => true,
        }
    }
}

/// Result of [`ManifestStore::commit_manifest`]
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// False when the manifest was already the head
    pub committed: bool,
    /// Versions dropped by retention; their block references must be released
    pub evicted: Vec<Manifest>,
}

struct Node {
    previous: Option<ManifestId>,
    committed_at_ms: i64,
    manifest: Manifest,
}

impl Node {
    fn encode(&self) -> Result<Vec<u8>> {
        let manifest = self.manifest.to_bytes()?;
        let mut buf = Vec::with_capacity(25 + manifest.len());
        match self.previous {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(id.as_bytes());
            }
            None => buf.extend_from_slice(&[0u8; 17]),
        }
        buf.extend_from_slice(&self.committed_at_ms.to_be_bytes());
        buf.extend_from_slice(&manifest);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 25 {
            return Err(SyncError::Codec("truncated history node".into()));
        }
        let previous = (bytes[0] == 1).then(|| {
            let mut id = [0u8; 16];
            id.copy_from_slice(&bytes[1..17]);
            ManifestId::from_raw(id)
        });
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[17..25]);
        Ok(Self {
            previous,
            committed_at_ms: i64::from_be_bytes(ts),
            manifest: Manifest::from_bytes(&bytes[25..])?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Head {
    id: ManifestId,
    deleted: bool,
}

impl Head {
    fn encode(self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[..16].copy_from_slice(self.id.as_bytes());
        buf[16] = u8::from(self.deleted);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 17] = bytes
            .try_into()
            .map_err(|_| SyncError::Codec("bad head record".into()))?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&raw[..16]);
        Ok(Self {
            id: ManifestId::from_raw(id),
            deleted: raw[16] == 1,
        })
    }
}

/// Persistent manifest store using LMDB
pub struct ManifestStore {
    env: Env,
    nodes: Database<HeedBytes, HeedBytes>,
    heads: Database<Str, HeedBytes>,
    files: Database<Str, HeedBytes>,
    pending: Database<Str, HeedBytes>,
    audit: Database<HeedBytes, HeedBytes>,
    retention: RetentionPolicy,
}

impl ManifestStore {
    /// Open or create a manifest store at the given path.
    pub fn open(path: &Path, retention: RetentionPolicy) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: Standard LMDB memory-mapped I/O
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(1024 * 1024 * 1024)
                .max_dbs(5)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let nodes = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("nodes")
            .create(&mut wtxn)?;
        let heads = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("heads")
            .create(&mut wtxn)?;
        let files = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("files")
            .create(&mut wtxn)?;
        let pending = env
            .database_options()
            .types::<Str, HeedBytes>()
            .name("pending")
            .create(&mut wtxn)?;
        let audit = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("audit")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self {
            env,
            nodes,
            heads,
            files,
            pending,
            audit,
            retention,
        })
    }

    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    fn read_head(&self, txn: &RoTxn<'_>, path: &str) -> Result<Option<Head>> {
        self.heads
            .get(txn, path)?
            .map(Head::decode)
            .transpose()
    }

    fn read_node(&self, txn: &RoTxn<'_>, id: ManifestId) -> Result<Option<Node>> {
        self.nodes
            .get(txn, id.as_bytes())?
            .map(Node::decode)
            .transpose()
    }

    /// Current manifest for `path`, or `None` if never committed or deleted
    pub fn get_last_manifest(&self, path: &str) -> Result<Option<Manifest>> {
        let rtxn = self.env.read_txn()?;
        match self.read_head(&rtxn, path)? {
            Some(head) if !head.deleted => {
                Ok(self.read_node(&rtxn, head.id)?.map(|node| node.manifest))
            }
            _ => Ok(None),
        }
    }

    /// Any retained manifest by id
    pub fn get_manifest(&self, id: ManifestId) -> Result<Option<Manifest>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.read_node(&rtxn, id)?.map(|node| node.manifest))
    }

    /// Make `manifest` the current version of `path`.
    ///
    /// The previous head stays reachable through [`history`](Self::history)
    /// until retention evicts it.
    pub fn commit_manifest(&self, path: &str, manifest: &Manifest) -> Result<CommitOutcome> {
        let mut wtxn = self.env.write_txn()?;
        let head = self.read_head(&wtxn, path)?;

        if let Some(head) = head {
            if head.id == manifest.id && !head.deleted {
                return Ok(CommitOutcome::default());
            }
        }
        if self.nodes.get(&wtxn, manifest.id.as_bytes())?.is_some() {
            return Err(SyncError::integrity(
                path,
                format!("manifest {} is already part of the history", manifest.id),
            ));
        }

        let node = Node {
            previous: head.map(|h| h.id),
            committed_at_ms: now_ms(),
            manifest: manifest.clone(),
        };
        self.nodes
            .put(&mut wtxn, manifest.id.as_bytes(), &node.encode()?)?;
        let new_head = Head {
            id: manifest.id,
            deleted: false,
        };
        self.heads.put(&mut wtxn, path, &new_head.encode())?;

        let evicted = self.apply_retention(&mut wtxn, manifest.id)?;
        wtxn.commit()?;

        Ok(CommitOutcome {
            committed: true,
            evicted,
        })
    }

    /// Walk the chain from `head` and drop whatever retention no longer keeps
    fn apply_retention(&self, wtxn: &mut RwTxn<'_>, head: ManifestId) -> Result<Vec<Manifest>> {
        let now = now_ms();
        let mut last_kept: Option<(ManifestId, Node)> = None;
        let mut evicted = Vec::new();
        let mut cursor = Some(head);
        let mut index = 0;

        while let Some(id) = cursor {
            let Some(node) = self.read_node(wtxn, id)? else {
                break;
            };
            cursor = node.previous;
            if evicted.is_empty() && self.retention.keeps(index, node.committed_at_ms, now) {
                last_kept = Some((id, node));
            } else {
                self.nodes.delete(wtxn, id.as_bytes())?;
                evicted.push(node.manifest);
            }
            index += 1;
        }

        if !evicted.is_empty() {
            if let Some((id, mut node)) = last_kept {
                node.previous = None;
                self.nodes.put(wtxn, id.as_bytes(), &node.encode()?)?;
            }
        }
        Ok(evicted)
    }

    /// Mark `path` deleted. History stays; returns whether a live head existed.
    pub fn tombstone(&self, path: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let Some(mut head) = self.read_head(&wtxn, path)? else {
            return Ok(false);
        };
        let was_live = !head.deleted;
        head.deleted = true;
        self.heads.put(&mut wtxn, path, &head.encode())?;
        self.files.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(was_live)
    }

    /// Forget everything held locally for `path`.
    ///
    /// Returns the removed manifests so their blocks can be released.
    pub fn purge(&self, path: &str) -> Result<Vec<Manifest>> {
        let mut wtxn = self.env.write_txn()?;
        let mut removed = Vec::new();
        let mut cursor = self.read_head(&wtxn, path)?.map(|h| h.id);

        while let Some(id) = cursor {
            let Some(node) = self.read_node(&wtxn, id)? else {
                break;
            };
            self.nodes.delete(&mut wtxn, id.as_bytes())?;
            cursor = node.previous;
            removed.push(node.manifest);
        }

        self.heads.delete(&mut wtxn, path)?;
        self.files.delete(&mut wtxn, path)?;
        self.pending.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Prior versions of `path`, most recent first.
    ///
    /// Lazy: each step reads one node. Calling `history` again (or
    /// [`History::restart`]) starts over from the current head.
    #[must_use]
    pub fn history(&self, path: &str) -> History<'_> {
        History {
            store: self,
            path: path.to_string(),
            cursor: None,
            started: false,
            yielded: 0,
        }
    }

    /// Paths with a live head
    pub fn paths(&self) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut paths = Vec::new();
        for entry in self.heads.iter(&rtxn)? {
            let (path, raw) = entry?;
            if !Head::decode(raw)?.deleted {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }

    pub fn get_entity(&self, path: &str) -> Result<Option<FileEntity>> {
        let rtxn = self.env.read_txn()?;
        self.files
            .get(&rtxn, path)?
            .map(FileEntity::from_bytes)
            .transpose()
    }

    pub fn put_entity(&self, entity: &FileEntity) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.files
            .put(&mut wtxn, &entity.path, &entity.to_bytes()?)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn remove_entity(&self, path: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.files.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(removed)
    }

    pub fn entities(&self) -> Result<Vec<FileEntity>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.files.iter(&rtxn)? {
            let (_, raw) = entry?;
            out.push(FileEntity::from_bytes(raw)?);
        }
        Ok(out)
    }

    /// Record an open conflict for its path
    pub fn put_pending(&self, record: &ConflictRecord) -> Result<()> {
        let json = serde_json::to_vec(record).map_err(|e| SyncError::Codec(e.to_string()))?;
        let mut wtxn = self.env.write_txn()?;
        self.pending.put(&mut wtxn, &record.file_path, &json)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn pending(&self, path: &str) -> Result<Option<ConflictRecord>> {
        let rtxn = self.env.read_txn()?;
        self.pending
            .get(&rtxn, path)?
            .map(|raw| serde_json::from_slice(raw).map_err(|e| SyncError::Codec(e.to_string())))
            .transpose()
    }

    pub fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.pending.iter(&rtxn)? {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(raw).map_err(|e| SyncError::Codec(e.to_string()))?);
        }
        Ok(out)
    }

    /// Close the open conflict for the record's path and append the record
    /// to the audit log, in one transaction.
    pub fn resolve_conflict(&self, record: &ConflictRecord) -> Result<()> {
        let json = serde_json::to_vec(record).map_err(|e| SyncError::Codec(e.to_string()))?;
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&record.detected_at_ms.to_be_bytes());
        key.extend_from_slice(record.id.as_bytes());

        let mut wtxn = self.env.write_txn()?;
        self.pending.delete(&mut wtxn, &record.file_path)?;
        self.audit.put(&mut wtxn, &key, &json)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Resolved conflicts, oldest first
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.audit.iter(&rtxn)? {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(raw).map_err(|e| SyncError::Codec(e.to_string()))?);
        }
        Ok(out)
    }
}

/// Lazy walk over a path's history chain, newest first
pub struct History<'a> {
    store: &'a ManifestStore,
    path: String,
    cursor: Option<ManifestId>,
    started: bool,
    yielded: usize,
}

impl History<'_> {
    /// Start again from the current head
    pub fn restart(&mut self) {
        self.cursor = None;
        self.started = false;
        self.yielded = 0;
    }

    fn step(&mut self) -> Result<Option<Manifest>> {
        let rtxn = self.store.env.read_txn()?;
        if !self.started {
            self.started = true;
            self.cursor = self.store.read_head(&rtxn, &self.path)?.map(|h| h.id);
        }

        let Some(id) = self.cursor.take() else {
            return Ok(None);
        };
        let Some(node) = self.store.read_node(&rtxn, id)? else {
            return Ok(None);
        };
        if !self
            .store
            .retention
            .keeps(self.yielded, node.committed_at_ms, now_ms())
        {
            return Ok(None);
        }

        self.cursor = node.previous;
        self.yielded += 1;
        Ok(Some(node.manifest))
    }
}

impl Iterator for History<'_> {
    type Item = Result<Manifest>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(manifest)) => Some(Ok(manifest)),
            Ok(None) => None,
            Err(e) => {
                self.cursor = None;
                Some(Err(e))
            }
        }
    }
}

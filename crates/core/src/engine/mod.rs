//! The sync engine
//!
//! A [`SyncEngine`] owns one scope root. Every sync of a path runs as a
//! [`SyncSession`] that holds that path's lock from scan to commit, so
//! sessions for one path run strictly in the order they started while
//! different paths proceed in parallel on a bounded worker pool.

mod local;
mod locks;
mod resolve;

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use locks::{PathGuard, PathLocks};

use self::local::{FileStat, LocalFile};
use crate::blocks::{BlockPins, BlockStore, StoreStats};
use crate::chunker::{Segmenter, block_bytes};
use crate::config::EngineConfig;
use crate::conflict::{ConflictRecord, Resolution};
use crate::detect::{BlockDiff, Plan, plan};
use crate::error::{Result, SyncError};
use crate::events::{EventSink, SyncEvent, TracingSink};
use crate::hash::ContentHash;
use crate::manifest::{Manifest, ManifestId, WriteStamp, now_ms, system_time_ms};
use crate::remote::{PutOutcome, Transport};
use crate::retry::{RetryConfig, retry};
use crate::scan::{STATE_DIR, Scanner};
use crate::scope::{ScopeChange, ScopeFilter, ScopeRule, checked_path, normalize_path};
use crate::session::{SessionState, SyncSession};
use crate::snapshot::{Snapshot, SnapshotDiff};
use crate::store::{History, ManifestStore};
use crate::sync_state::{FileEntity, SyncStatus};
use crate::transfer::{TransferCoordinator, TransferStats};

/// Compare-and-swap losses tolerated within one session
const MAX_CAS_ATTEMPTS: u32 = 3;

/// What a session did to its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncAction {
    Unchanged,
    Uploaded,
    Downloaded,
    /// Local and remote already matched; only bookkeeping changed
    Adopted,
    DeletedRemote,
    DeletedLocal,
    Forgotten,
    Resolved(Resolution),
    Restored,
    OutOfScope,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => f.write_str("unchanged"),
            Self::Uploaded => f.write_str("uploaded"),
            Self::Downloaded => f.write_str("downloaded"),
            Self::Adopted => f.write_str("adopted"),
            Self::DeletedRemote => f.write_str("deleted remote"),
            Self::DeletedLocal => f.write_str("deleted local"),
            Self::Forgotten => f.write_str("forgotten"),
            Self::Resolved(resolution) => write!(f, "conflict {resolution}"),
            Self::Restored => f.write_str("restored"),
            Self::OutOfScope => f.write_str("out of scope"),
        }
    }
}

/// Outcome of one successful session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: Uuid,
    pub path: String,
    pub action: SyncAction,
    pub uploaded: TransferStats,
    pub downloaded: TransferStats,
    /// Manifest now current for the path, if any
    pub manifest: Option<ManifestId>,
}

#[derive(Debug)]
pub struct SessionFailure {
    pub path: String,
    pub error: SyncError,
}

/// Outcome of a full pass over the scope
#[derive(Debug, Default)]
pub struct SyncReport {
    pub sessions: Vec<SessionReport>,
    pub failures: Vec<SessionFailure>,
    pub collected_blocks: usize,
}

impl SyncReport {
    #[must_use]
    pub fn changed(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|s| !matches!(s.action, SyncAction::Unchanged | SyncAction::OutOfScope))
    }

    #[must_use]
    pub fn blocks_uploaded(&self) -> usize {
        self.sessions.iter().map(|s| s.uploaded.transferred).sum()
    }

    #[must_use]
    pub fn blocks_downloaded(&self) -> usize {
        self.sessions.iter().map(|s| s.downloaded.transferred).sum()
    }
}

/// Result of [`SyncEngine::set_scope`]
#[derive(Debug)]
pub struct ScopeUpdate {
    pub change: ScopeChange,
    /// Full pass run because paths came into scope
    pub rescan: Option<SyncReport>,
}

#[derive(Debug, Default)]
struct Tally {
    uploaded: TransferStats,
    downloaded: TransferStats,
}

/// How a plan step ended
enum Step {
    Done(SyncAction, Option<ManifestId>),
    /// Lost a compare-and-swap; re-plan against the new remote head
    Retry(Option<Manifest>),
}

pub struct EngineBuilder {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    config: Option<EngineConfig>,
    events: Option<Arc<dyn EventSink>>,
    state_dir: Option<PathBuf>,
}

impl EngineBuilder {
    /// Use `config` instead of the root's `.blocksync.toml`
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Keep engine state outside the scope root
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn open(self) -> Result<SyncEngine> {
        let config = match self.config {
            Some(config) => config,
            None => EngineConfig::load(&self.root)?,
        };
        config.validate()?;
        std::fs::create_dir_all(&self.root)?;

        let state = self
            .state_dir
            .unwrap_or_else(|| self.root.join(STATE_DIR));
        let store = Arc::new(ManifestStore::open(
            &state.join("manifests"),
            config.retention.into(),
        )?);
        let blocks = Arc::new(BlockStore::open(
            &state.join("blocks"),
            config.limits.block_store_map_size(),
        )?);
        let pins = BlockPins::new();
        let retry = RetryConfig::from(&config.retry);
        let coordinator = TransferCoordinator::new(
            self.transport.clone(),
            blocks.clone(),
            pins.clone(),
            retry.clone(),
            config.block_fanout,
        );
        let segmenter = Segmenter::new(config.chunking.clone(), config.limits)?;
        let scope = Arc::new(ScopeFilter::new(config.scope_rules.clone()));

        info!(
            root = %self.root.display(),
            client = %config.client_name,
            workers = config.workers,
            "sync engine opened"
        );

        Ok(SyncEngine {
            inner: Arc::new(Inner {
                root: self.root,
                workers: Arc::new(Semaphore::new(config.workers)),
                config,
                scope: RwLock::new(scope),
                store,
                blocks,
                pins,
                transport: self.transport,
                coordinator,
                segmenter,
                locks: PathLocks::new(),
                shutdown: CancellationToken::new(),
                events: self.events.unwrap_or_else(|| Arc::new(TracingSink)),
                retry,
            }),
        })
    }
}

/// Client-side sync engine for one scope root
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    config: EngineConfig,
    scope: RwLock<Arc<ScopeFilter>>,
    store: Arc<ManifestStore>,
    blocks: Arc<BlockStore>,
    pins: BlockPins,
    transport: Arc<dyn Transport>,
    coordinator: TransferCoordinator,
    segmenter: Segmenter,
    locks: PathLocks,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    events: Arc<dyn EventSink>,
    retry: RetryConfig,
}

impl SyncEngine {
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder {
            root: root.into(),
            transport,
            config: None,
            events: None,
            state_dir: None,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Token for one session; also fires on [`cancel_all`](Self::cancel_all)
    #[must_use]
    pub fn session_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Cancel every running and future session of this engine
    pub fn cancel_all(&self) {
        info!("cancelling all sync sessions");
        self.inner.shutdown.cancel();
    }

    /// Current scope snapshot
    #[must_use]
    pub fn scope(&self) -> Arc<ScopeFilter> {
        self.inner.scope()
    }

    #[must_use]
    pub fn is_in_scope(&self, path: &str) -> bool {
        self.inner.scope().is_in_scope(path)
    }

    pub async fn sync_path(&self, path: &str) -> Result<SessionReport> {
        self.sync_path_with_cancel(path, self.session_token()).await
    }

    /// Sync one path; cancelling `cancel` aborts the session and leaves the
    /// committed state untouched
    pub async fn sync_path_with_cancel(
        &self,
        path: &str,
        cancel: CancellationToken,
    ) -> Result<SessionReport> {
        let path = self.inner.checked(path)?;
        self.inner.run_session(&path, cancel).await
    }

    /// Scan the root and sync every in-scope path known locally or remotely
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        let scope = inner.scope();
        let cancel = self.session_token();

        let scan = {
            let root = inner.root.clone();
            let scope = scope.clone();
            tokio::task::spawn_blocking(move || Scanner::new(root).scan(&scope))
                .await
                .map_err(join_error)??
        };

        let mut paths: BTreeSet<String> = scan.entries.into_iter().map(|e| e.path).collect();
        paths.extend(inner.store.paths()?);
        paths.extend(inner.store.entities()?.into_iter().map(|e| e.path));
        paths.extend(
            retry("list_remote", &inner.retry, &cancel, || {
                inner.transport.list_remote()
            })
            .await?,
        );
        paths.retain(|p| scope.is_in_scope(p));
        debug!(paths = paths.len(), "starting sync pass");

        let mut set = JoinSet::new();
        let mut tasks = HashMap::new();
        for path in paths {
            let engine = self.clone();
            let cancel = cancel.clone();
            let task = path.clone();
            let handle = set.spawn(async move {
                let result = engine.sync_path_with_cancel(&task, cancel).await;
                (task, result)
            });
            tasks.insert(handle.id(), path);
        }

        let mut report = SyncReport::default();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, (_, Ok(session)))) => report.sessions.push(session),
                Ok((_, (path, Err(error)))) => report.failures.push(SessionFailure { path, error }),
                Err(err) => {
                    // A crashed session costs only its own path
                    let path = tasks.remove(&err.id()).unwrap_or_default();
                    warn!(path = %path, error = %err, "sync session aborted");
                    report.failures.push(SessionFailure {
                        path,
                        error: join_error(err),
                    });
                }
            }
        }
        report.sessions.sort_by(|a, b| a.path.cmp(&b.path));
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));
        report.collected_blocks = self.collect_garbage()?;

        info!(
            sessions = report.sessions.len(),
            changed = report.changed().count(),
            failed = report.failures.len(),
            "sync pass finished"
        );
        Ok(report)
    }

    /// Replace the scope rules.
    ///
    /// Newly excluded paths lose their local blocks and manifests (and the
    /// file, if it holds nothing unsynced); the remote is never touched.
    /// Newly included paths trigger a full pass.
    pub async fn set_scope(&self, rules: Vec<ScopeRule>) -> Result<ScopeUpdate> {
        let inner = &self.inner;
        let current = Arc::new(ScopeFilter::new(rules));
        let previous = std::mem::replace(&mut *inner.scope.write(), current.clone());

        let cancel = self.session_token();
        let mut known: BTreeSet<String> = inner.store.paths()?.into_iter().collect();
        known.extend(inner.store.entities()?.into_iter().map(|e| e.path));
        known.extend(
            retry("list_remote", &inner.retry, &cancel, || {
                inner.transport.list_remote()
            })
            .await?,
        );
        known.retain(|path| match checked_path(path) {
            Ok(valid) => valid == *path,
            Err(err) => {
                warn!(error = %err, "ignoring path outside the scope root");
                false
            }
        });
        let change = current.changes_from(&previous, known.iter().map(String::as_str));

        for path in &change.newly_excluded {
            inner.evict(path).await?;
        }
        for path in &change.newly_included {
            if let Some(stat) = local::stat(&inner.root, path).await? {
                let mut entity = FileEntity::new(path, stat.size, stat.modified);
                entity.status = SyncStatus::InScopePending;
                inner.store.put_entity(&entity)?;
            }
        }

        info!(
            excluded = change.newly_excluded.len(),
            included = change.newly_included.len(),
            "scope updated"
        );
        inner.events.emit(SyncEvent::ScopeChanged {
            newly_excluded: change.newly_excluded.clone(),
            newly_included: change.newly_included.clone(),
        });

        let rescan = if change.newly_included.is_empty() {
            None
        } else {
            Some(self.sync_all().await?)
        };
        Ok(ScopeUpdate { change, rescan })
    }

    pub fn get_last_manifest(&self, path: &str) -> Result<Option<Manifest>> {
        self.inner.store.get_last_manifest(&normalize_path(path))
    }

    /// Versions of `path`, most recent first
    #[must_use]
    pub fn history(&self, path: &str) -> History<'_> {
        self.inner.store.history(&normalize_path(path))
    }

    /// Make a historical version of `path` current again.
    ///
    /// The old block list is committed as a new version on top of the
    /// current one; nothing in history is rewritten.
    pub async fn restore(&self, path: &str, id: ManifestId) -> Result<SessionReport> {
        let path = self.inner.checked(path)?;
        self.inner.run_restore(&path, id, self.session_token()).await
    }

    /// Conflicts that are detected but not yet resolved
    pub fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.pending_conflicts()
    }

    /// Audit log of resolved conflicts, oldest first
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.conflicts()
    }

    pub fn entities(&self) -> Result<Vec<FileEntity>> {
        self.inner.store.entities()
    }

    /// Walk the root and compare it with the engine's records
    pub fn snapshot(&self) -> Result<(Snapshot, SnapshotDiff)> {
        let scan = Scanner::new(&self.inner.root).scan(&self.inner.scope())?;
        let snapshot = Snapshot::from_entries(scan.entries);
        let diff = snapshot.diff(&self.inner.store.entities()?);
        Ok((snapshot, diff))
    }

    /// Delete local blocks no retained manifest references
    pub fn collect_garbage(&self) -> Result<usize> {
        let inner = &self.inner;
        inner
            .pins
            .with_pinned(|pinned| inner.blocks.collect_garbage(pinned))
    }

    #[must_use]
    pub fn block_stats(&self) -> Option<StoreStats> {
        self.inner.blocks.stats()
    }

    #[must_use]
    pub fn refcount(&self, hash: &ContentHash) -> u64 {
        self.inner.blocks.refcount(hash)
    }

    #[must_use]
    pub fn has_local_block(&self, hash: &ContentHash) -> bool {
        self.inner.blocks.contains(hash)
    }
}

fn join_error(e: tokio::task::JoinError) -> SyncError {
    SyncError::Io(std::io::Error::other(e))
}

fn enter(session: &mut SyncSession, state: SessionState) -> Result<()> {
    if session.state() == state {
        Ok(())
    } else {
        session.advance(state)
    }
}

impl Inner {
    fn scope(&self) -> Arc<ScopeFilter> {
        self.scope.read().clone()
    }

    /// Canonical form of a caller- or remote-supplied path; a path that
    /// escapes the root fails here as that path's session
    fn checked(&self, path: &str) -> Result<String> {
        checked_path(path).inspect_err(|err| {
            warn!(path, error = %err, "refusing to sync path");
            self.events.emit(SyncEvent::SessionFailed {
                path: path.to_string(),
                session: Uuid::new_v4(),
                error: err.to_string(),
            });
        })
    }

    fn client(&self) -> &str {
        &self.config.client_name
    }

    async fn run_session(&self, path: &str, cancel: CancellationToken) -> Result<SessionReport> {
        let _path = self.locks.lock(path).await;
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let mut session = SyncSession::new(self.root.clone(), path, cancel);
        let mut tally = Tally::default();
        let result = if self.scope().is_in_scope(path) {
            self.drive(&mut session, &mut tally).await
        } else {
            Ok(Step::Done(SyncAction::OutOfScope, None))
        };
        self.finish(session, tally, result)
    }

    async fn run_restore(
        &self,
        path: &str,
        id: ManifestId,
        cancel: CancellationToken,
    ) -> Result<SessionReport> {
        let _path = self.locks.lock(path).await;
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let mut session = SyncSession::new(self.root.clone(), path, cancel);
        let mut tally = Tally::default();
        let result = self.restore(&mut session, id, &mut tally).await;
        self.finish(session, tally, result)
    }

    fn finish(
        &self,
        mut session: SyncSession,
        tally: Tally,
        result: Result<Step>,
    ) -> Result<SessionReport> {
        match result {
            Ok(Step::Done(action, manifest)) => {
                self.events.emit(SyncEvent::SessionCompleted {
                    path: session.path.clone(),
                    session: session.id,
                    action: action.to_string(),
                    uploaded: tally.uploaded.transferred,
                    downloaded: tally.downloaded.transferred,
                });
                Ok(SessionReport {
                    session: session.id,
                    path: session.path,
                    action,
                    uploaded: tally.uploaded,
                    downloaded: tally.downloaded,
                    manifest,
                })
            }
            Ok(Step::Retry(_)) => {
                let err = SyncError::ManifestConflict {
                    path: session.path.clone(),
                };
                self.finish(session, tally, Err(err))
            }
            Err(err) => {
                session.fail(&err);
                if matches!(err, SyncError::Cancelled) {
                    info!(path = %session.path, session = %session.id, "sync session cancelled");
                } else {
                    self.events.emit(SyncEvent::SessionFailed {
                        path: session.path.clone(),
                        session: session.id,
                        error: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(path = %session.path, session = %session.id))]
    async fn drive(&self, session: &mut SyncSession, tally: &mut Tally) -> Result<Step> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();

        session.advance(SessionState::Scanning)?;
        let base = self.store.get_last_manifest(&path)?;
        let local = self.observe_local(&path, base.as_ref()).await?;
        session.check_cancelled()?;

        session.advance(SessionState::Diffing)?;
        let mut remote = self.fetch_remote(&path, &cancel).await?;
        let mut attempts = 0;

        loop {
            session.check_cancelled()?;
            let next = plan(
                local.as_ref().map(|l| &l.manifest),
                base.as_ref(),
                remote.as_ref(),
            );
            debug!(plan = ?next, "planned");

            if session.state() == SessionState::Diffing {
                if next == Plan::Clean {
                    session.advance(SessionState::Clean)?;
                    self.record_clean(&path, local.as_ref())?;
                    session.advance(SessionState::Idle)?;
                    return Ok(Step::Done(
                        SyncAction::Unchanged,
                        base.as_ref().map(|b| b.id),
                    ));
                }
                session.advance(SessionState::HasChanges)?;
            }

            let step = match (next, local.as_ref(), remote.as_ref()) {
                (Plan::Clean, _, _) => {
                    enter(session, SessionState::Committing)?;
                    self.record_clean(&path, local.as_ref())?;
                    Step::Done(SyncAction::Unchanged, base.as_ref().map(|b| b.id))
                }
                (Plan::Upload { expected }, Some(local), _) => {
                    self.upload(session, local, base.as_ref(), expected, tally)
                        .await?
                }
                (Plan::Download, local, Some(remote)) => {
                    self.download(session, local, remote, tally).await?
                }
                (Plan::Adopt, Some(local), Some(remote)) => {
                    enter(session, SessionState::Committing)?;
                    let data = self.local_bytes(local)?;
                    self.commit_local(&path, remote, Some(&*data))?;
                    self.record_synced(&path, local.stat, remote)?;
                    Step::Done(SyncAction::Adopted, Some(remote.id))
                }
                (Plan::DeleteRemote, None, Some(remote)) => {
                    enter(session, SessionState::Committing)?;
                    session.check_cancelled()?;
                    match retry("delete_manifest", &self.retry, &cancel, || {
                        self.transport.delete_manifest(&path, remote.id)
                    })
                    .await?
                    {
                        PutOutcome::Committed => {
                            self.store.tombstone(&path)?;
                            Step::Done(SyncAction::DeletedRemote, None)
                        }
                        PutOutcome::Conflict { current } => Step::Retry(current),
                    }
                }
                (Plan::DeleteLocal, Some(local), None) => {
                    enter(session, SessionState::Committing)?;
                    local::ensure_unchanged(&self.root, &path, Some(local.stat)).await?;
                    local::remove(&self.root, &path)?;
                    self.store.tombstone(&path)?;
                    Step::Done(SyncAction::DeletedLocal, None)
                }
                (Plan::Forget, _, _) => {
                    enter(session, SessionState::Committing)?;
                    self.store.tombstone(&path)?;
                    self.store.remove_entity(&path)?;
                    Step::Done(SyncAction::Forgotten, None)
                }
                (Plan::Conflict { ancestor }, Some(local), Some(remote)) => {
                    enter(session, SessionState::Resolving)?;
                    self.resolve_conflict(session, local, remote, ancestor, tally)
                        .await?
                }
                (unexpected, _, _) => {
                    return Err(SyncError::InvalidTransition {
                        from: session.state().to_string(),
                        to: format!("{unexpected:?}"),
                    });
                }
            };

            match step {
                Step::Done(action, manifest) => {
                    enter(session, SessionState::Committing)?;
                    session.advance(SessionState::Idle)?;
                    debug!(%action, "session finished");
                    return Ok(Step::Done(action, manifest));
                }
                Step::Retry(current) => {
                    attempts += 1;
                    if attempts >= MAX_CAS_ATTEMPTS {
                        warn!(attempts, "remote kept moving, giving up for now");
                        return Err(SyncError::ManifestConflict { path });
                    }
                    debug!(attempts, "remote head moved, re-planning");
                    remote = current;
                    enter(session, SessionState::Resolving)?;
                }
            }
        }
    }

    async fn upload(
        &self,
        session: &mut SyncSession,
        local: &LocalFile,
        base: Option<&Manifest>,
        expected: Option<ManifestId>,
        tally: &mut Tally,
    ) -> Result<Step> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();
        let manifest = &local.manifest;
        let data = self.local_bytes(local)?;

        enter(session, SessionState::Transferring)?;
        let candidates = match base {
            Some(base) if Some(base.id) == expected => BlockDiff::between(Some(base), manifest).added,
            _ => manifest.unique_hashes(),
        };
        tally.uploaded += self
            .coordinator
            .upload(manifest, &candidates, Some(&*data), &cancel)
            .await?;

        session.advance(SessionState::Committing)?;
        session.check_cancelled()?;
        match self.put_manifest(&path, manifest, expected, &cancel).await? {
            PutOutcome::Committed => {
                self.commit_local(&path, manifest, Some(&*data))?;
                self.record_synced(&path, local.stat, manifest)?;
                Ok(Step::Done(SyncAction::Uploaded, Some(manifest.id)))
            }
            PutOutcome::Conflict { current } => Ok(Step::Retry(current)),
        }
    }

    async fn download(
        &self,
        session: &mut SyncSession,
        local: Option<&LocalFile>,
        remote: &Manifest,
        tally: &mut Tally,
    ) -> Result<Step> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();

        enter(session, SessionState::Transferring)?;
        let (stats, _pins) = self.coordinator.download(remote, &cancel).await?;
        tally.downloaded += stats;
        let data = self.blocks.assemble(remote)?;

        session.advance(SessionState::Committing)?;
        session.check_cancelled()?;
        local::ensure_unchanged(&self.root, &path, local.map(|l| l.stat)).await?;
        let stat = local::write_atomic(&self.root, &path, &data)?;
        self.commit_local(&path, remote, None)?;
        self.record_synced(&path, stat, remote)?;
        Ok(Step::Done(SyncAction::Downloaded, Some(remote.id)))
    }

    async fn restore(
        &self,
        session: &mut SyncSession,
        id: ManifestId,
        tally: &mut Tally,
    ) -> Result<Step> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();

        session.advance(SessionState::Scanning)?;
        let target = self
            .store
            .get_manifest(id)?
            .filter(|m| m.path == path)
            .ok_or_else(|| SyncError::NotFound(format!("version {id} of {path}")))?;
        let head = self.store.get_last_manifest(&path)?;
        let seen = local::stat(&self.root, &path).await?;
        if seen.is_some() {
            let current = ContentHash::from_bytes(&local::read(&self.root, &path).await?);
            if head.as_ref().map(|h| h.file_hash) != Some(current) {
                return Err(SyncError::UnsyncedChanges { path });
            }
        }

        session.advance(SessionState::Diffing)?;
        let mut remote = self.fetch_remote(&path, &cancel).await?;
        session.advance(SessionState::HasChanges)?;

        session.advance(SessionState::Transferring)?;
        let (stats, _pins) = self.coordinator.download(&target, &cancel).await?;
        tally.downloaded += stats;
        let data = self.blocks.assemble(&target)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let parent = remote.as_ref().or(head.as_ref());
            let restored = target.derive(
                &path,
                remote.as_ref().map(|m| m.id),
                WriteStamp::after(parent, now_ms(), self.client()),
            );
            enter(session, SessionState::Transferring)?;
            tally.uploaded += self
                .coordinator
                .upload(&restored, &restored.unique_hashes(), Some(&*data), &cancel)
                .await?;

            session.advance(SessionState::Committing)?;
            session.check_cancelled()?;
            let expected = remote.as_ref().map(|m| m.id);
            match self.put_manifest(&path, &restored, expected, &cancel).await? {
                PutOutcome::Committed => {
                    local::ensure_unchanged(&self.root, &path, seen).await?;
                    let stat = local::write_atomic(&self.root, &path, &data)?;
                    self.commit_local(&path, &restored, Some(&*data))?;
                    self.record_synced(&path, stat, &restored)?;
                    session.advance(SessionState::Idle)?;
                    info!(path = %path, version = %id, "restored");
                    return Ok(Step::Done(SyncAction::Restored, Some(restored.id)));
                }
                PutOutcome::Conflict { current } => {
                    remote = current;
                    session.advance(SessionState::Resolving)?;
                }
            }
        }
        Err(SyncError::ManifestConflict { path })
    }

    /// Stat (and if needed read and segment) the local file
    async fn observe_local(&self, path: &str, base: Option<&Manifest>) -> Result<Option<LocalFile>> {
        let Some(stat) = local::stat(&self.root, path).await? else {
            return Ok(None);
        };
        if let Err(err) = self.segmenter.check_size(path, stat.size) {
            self.mark_excluded(path, stat, &err)?;
            return Err(err);
        }

        // Quick check: metadata unchanged since the last sync
        if let (Some(entity), Some(base)) = (self.store.get_entity(path)?, base) {
            if entity.unchanged_since_sync(stat.size, stat.modified)
                && entity.content_manifest_id == Some(base.id)
            {
                return Ok(Some(LocalFile {
                    stat,
                    manifest: base.clone(),
                    data: None,
                }));
            }
        }

        let data = local::read(&self.root, path).await?;
        let segmenter = self.segmenter.clone();
        let owned = path.to_string();
        let (data, segmented) = tokio::task::spawn_blocking(move || {
            let blocks = segmenter.segment(&owned, &data);
            (data, blocks)
        })
        .await
        .map_err(join_error)?;

        let blocks = match segmented {
            Ok(blocks) => blocks,
            Err(err @ SyncError::CapacityExceeded { .. }) => {
                self.mark_excluded(path, stat, &err)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let stamp = WriteStamp::after(base, system_time_ms(stat.modified), self.client());
        let manifest = Manifest::build(path, &data, blocks, base.map(|b| b.id), stamp);
        Ok(Some(LocalFile {
            stat,
            manifest,
            data: Some(data),
        }))
    }

    fn local_bytes<'a>(&self, local: &'a LocalFile) -> Result<Cow<'a, [u8]>> {
        match &local.data {
            Some(data) => Ok(Cow::Borrowed(data)),
            None => Ok(Cow::Owned(self.blocks.assemble(&local.manifest)?)),
        }
    }

    async fn fetch_remote(&self, path: &str, cancel: &CancellationToken) -> Result<Option<Manifest>> {
        retry("get_remote_manifest", &self.retry, cancel, || {
            self.transport.get_remote_manifest(path)
        })
        .await
    }

    /// Compare-and-swap a remote head. A retried put that already landed
    /// shows up as a conflict with our own manifest and counts as committed.
    async fn put_manifest(
        &self,
        path: &str,
        manifest: &Manifest,
        expected: Option<ManifestId>,
        cancel: &CancellationToken,
    ) -> Result<PutOutcome> {
        let outcome = retry("put_manifest", &self.retry, cancel, || {
            self.transport.put_manifest(path, manifest, expected)
        })
        .await?;
        Ok(match outcome {
            PutOutcome::Conflict {
                current: Some(current),
            } if current.id == manifest.id => PutOutcome::Committed,
            other => other,
        })
    }

    /// Make `manifest` the local head of `path`, storing its blocks from
    /// `source` when given and taking a reference on each.
    fn commit_local(&self, path: &str, manifest: &Manifest, source: Option<&[u8]>) -> Result<bool> {
        let unique = manifest.unique_hashes();
        let _pins = self.pins.pin(unique.iter().copied());

        if let Some(data) = source {
            self.blocks.put_many(
                manifest
                    .blocks
                    .iter()
                    .map(|b| (b.hash, block_bytes(data, b))),
            )?;
        }
        let missing = self.blocks.find_missing(&unique);
        if !missing.is_empty() {
            return Err(SyncError::NotFound(format!(
                "{} blocks of {path} are not stored locally",
                missing.len()
            )));
        }

        self.blocks.retain(unique.iter().copied())?;
        let outcome = match self.store.commit_manifest(path, manifest) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.blocks.release(unique.iter().copied())?;
                return Err(err);
            }
        };
        if !outcome.committed {
            self.blocks.release(unique)?;
            return Ok(false);
        }

        if !outcome.evicted.is_empty() {
            let freed = self.release_manifests(&outcome.evicted)?;
            debug!(path, evicted = outcome.evicted.len(), freed, "retention applied");
        }
        Ok(true)
    }

    /// Drop one reference per manifest and delete blocks left unreferenced
    fn release_manifests(&self, manifests: &[Manifest]) -> Result<usize> {
        let mut unreferenced = Vec::new();
        for manifest in manifests {
            unreferenced.extend(self.blocks.release(manifest.unique_hashes())?);
        }
        self.pins
            .with_pinned(|pinned| self.blocks.delete_unreferenced(&unreferenced, pinned))
    }

    fn record_synced(&self, path: &str, stat: FileStat, manifest: &Manifest) -> Result<()> {
        let mut entity = FileEntity::new(path, stat.size, stat.modified);
        entity.content_manifest_id = Some(manifest.id);
        entity.status = SyncStatus::Synced;
        self.store.put_entity(&entity)
    }

    fn record_clean(&self, path: &str, local: Option<&LocalFile>) -> Result<()> {
        match local {
            Some(local) => self.record_synced(path, local.stat, &local.manifest),
            None => self.store.remove_entity(path).map(|_| ()),
        }
    }

    fn mark_excluded(&self, path: &str, stat: FileStat, err: &SyncError) -> Result<()> {
        warn!(path, error = %err, "excluding file from sync");
        let mut entity = FileEntity::new(path, stat.size, stat.modified);
        entity.status = SyncStatus::Excluded;
        entity.excluded_reason = Some(err.to_string());
        self.store.put_entity(&entity)
    }

    /// Drop local data for a path that left the scope
    async fn evict(&self, path: &str) -> Result<()> {
        let _path = self.locks.lock(path).await;

        if let Some(head) = self.store.get_last_manifest(path)? {
            if local::stat(&self.root, path).await?.is_some() {
                let data = local::read(&self.root, path).await?;
                if ContentHash::from_bytes(&data) == head.file_hash {
                    local::remove(&self.root, path)?;
                } else {
                    warn!(path, "excluded file has unsynced edits; leaving it on disk");
                }
            }
        }

        let removed = self.store.purge(path)?;
        let freed = self.release_manifests(&removed)?;
        debug!(path, versions = removed.len(), freed, "evicted from local store");
        Ok(())
    }
}

//! Conflict resolution
//!
//! Every strategy leaves both sides reachable: the losing version either
//! gets its own path (a conflict copy) or survives in the path's history
//! next to the merge result.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::local::{self, LocalFile};
use super::{Inner, Step, SyncAction, Tally, enter};
use crate::conflict::{ConflictRecord, Resolution, Strategy, choose_strategy, conflict_copy_name};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::manifest::{Manifest, ManifestId, WriteStamp, now_ms};
use crate::merge::merge3;
use crate::remote::PutOutcome;
use crate::session::{SessionState, SyncSession};
use crate::sync_state::SyncStatus;

/// Conflict copy names tried before giving up
const MAX_COPY_NAMES: u32 = 100;

/// Outcome of a step that ends in a compare-and-swap
enum Cas<T> {
    Won(T),
    Lost(Option<Manifest>),
}

impl Inner {
    pub(super) async fn resolve_conflict(
        &self,
        session: &mut SyncSession,
        local: &LocalFile,
        remote: &Manifest,
        ancestor: Option<ManifestId>,
        tally: &mut Tally,
    ) -> Result<Step> {
        let path = session.path.clone();
        let policy = self.config.conflict_policy;

        let mut record = ConflictRecord::open(&path, local.manifest.id, remote.id, ancestor, policy);
        self.store.put_pending(&record)?;
        if let Some(mut entity) = self.store.get_entity(&path)? {
            entity.status = SyncStatus::Conflicted;
            self.store.put_entity(&entity)?;
        }
        warn!(path = %path, %policy, "conflict detected");
        self.events.emit(SyncEvent::ConflictDetected {
            path: path.clone(),
            local: local.manifest.id,
            remote: remote.id,
            policy,
        });

        let strategy = choose_strategy(policy, &local.manifest, remote);
        debug!(?strategy, "resolving");
        let outcome = match strategy {
            Strategy::KeepBoth | Strategy::RemoteWins => {
                let copy = self.keep_local_as_copy(session, local, remote, tally).await?;
                Cas::Won((strategy.resolution(), Some(copy)))
            }
            Strategy::LocalWins => match self.keep_remote_as_copy(session, local, remote, tally).await? {
                Cas::Won(copy) => Cas::Won((Resolution::KeepLocal, Some(copy))),
                Cas::Lost(current) => Cas::Lost(current),
            },
            Strategy::Merge => match self.try_merge(session, local, remote, ancestor, tally).await? {
                Cas::Won(true) => Cas::Won((Resolution::Merged, None)),
                Cas::Won(false) => {
                    let copy = self.keep_local_as_copy(session, local, remote, tally).await?;
                    Cas::Won((Resolution::KeptBoth, Some(copy)))
                }
                Cas::Lost(current) => Cas::Lost(current),
            },
        };

        let (resolution, copy_path) = match outcome {
            Cas::Won(won) => won,
            Cas::Lost(current) => return Ok(Step::Retry(current)),
        };

        record.resolve(resolution, copy_path.clone());
        self.store.resolve_conflict(&record)?;
        info!(path = %path, %resolution, copy = copy_path.as_deref().unwrap_or("-"), "conflict resolved");
        self.events.emit(SyncEvent::ConflictResolved {
            path: path.clone(),
            resolution,
            copy_path,
        });

        let head = self.store.get_last_manifest(&path)?.map(|m| m.id);
        Ok(Step::Done(SyncAction::Resolved(resolution), head))
    }

    /// Whether `name` is used locally, in the store, or on the remote
    async fn copy_name_taken(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(local::stat(&self.root, name).await?.is_some()
            || self.store.get_last_manifest(name)?.is_some()
            || self.fetch_remote(name, cancel).await?.is_some())
    }

    /// Commit `source` under the first free conflict copy name for `origin`
    async fn publish_copy(
        &self,
        session: &SyncSession,
        source: &Manifest,
        origin: &str,
        data: Option<&[u8]>,
        tally: &mut Tally,
    ) -> Result<Manifest> {
        let cancel = session.cancellation_token();
        for n in 1..=MAX_COPY_NAMES {
            let name = conflict_copy_name(&session.path, origin, n);
            if self.copy_name_taken(&name, cancel).await? {
                continue;
            }
            let stamp = WriteStamp::after(None, source.stamp.mtime_ms, origin);
            let copy = source.derive(&name, None, stamp);
            tally.uploaded += self
                .coordinator
                .upload(&copy, &copy.unique_hashes(), data, cancel)
                .await?;
            session.check_cancelled()?;
            match self.put_manifest(&name, &copy, None, cancel).await? {
                PutOutcome::Committed => return Ok(copy),
                PutOutcome::Conflict { .. } => debug!(name, "copy name taken remotely"),
            }
        }
        Err(SyncError::ManifestConflict {
            path: session.path.clone(),
        })
    }

    /// Write a published copy to disk and commit it locally
    fn land_copy(&self, copy: &Manifest, data: &[u8]) -> Result<()> {
        let stat = local::write_atomic(&self.root, &copy.path, data)?;
        self.commit_local(&copy.path, copy, Some(data))?;
        self.record_synced(&copy.path, stat, copy)
    }

    /// Local edits move to a conflict copy; the remote version takes the path
    async fn keep_local_as_copy(
        &self,
        session: &mut SyncSession,
        local: &LocalFile,
        remote: &Manifest,
        tally: &mut Tally,
    ) -> Result<String> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();
        let data = self.local_bytes(local)?;

        let copy = self
            .publish_copy(session, &local.manifest, self.client(), Some(&*data), tally)
            .await?;
        self.land_copy(&copy, &data)?;

        enter(session, SessionState::Transferring)?;
        let (stats, _pins) = self.coordinator.download(remote, &cancel).await?;
        tally.downloaded += stats;
        let bytes = self.blocks.assemble(remote)?;

        session.advance(SessionState::Committing)?;
        local::ensure_unchanged(&self.root, &path, Some(local.stat)).await?;
        let stat = local::write_atomic(&self.root, &path, &bytes)?;
        self.commit_local(&path, remote, None)?;
        self.record_synced(&path, stat, remote)?;
        Ok(copy.path)
    }

    /// Local edits are committed on top of the remote version, which then
    /// moves to a conflict copy named for its writer.
    ///
    /// The head is swapped before the copy is published, so losing the
    /// race leaves nothing behind and the retry copies only the version it
    /// actually replaced.
    async fn keep_remote_as_copy(
        &self,
        session: &mut SyncSession,
        local: &LocalFile,
        remote: &Manifest,
        tally: &mut Tally,
    ) -> Result<Cas<String>> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();
        let data = self.local_bytes(local)?;

        enter(session, SessionState::Transferring)?;
        let winner = local.manifest.derive(
            &path,
            Some(remote.id),
            WriteStamp::after(Some(remote), local.manifest.stamp.mtime_ms, self.client()),
        );
        tally.uploaded += self
            .coordinator
            .upload(&winner, &winner.unique_hashes(), Some(&*data), &cancel)
            .await?;

        session.advance(SessionState::Committing)?;
        session.check_cancelled()?;
        if let PutOutcome::Conflict { current } =
            self.put_manifest(&path, &winner, Some(remote.id), &cancel).await?
        {
            return Ok(Cas::Lost(current));
        }
        self.commit_local(&path, &winner, Some(&*data))?;
        self.record_synced(&path, local.stat, &winner)?;

        // The replaced version is already in the path's remote history
        let origin = if remote.stamp.origin.is_empty() {
            "remote"
        } else {
            remote.stamp.origin.as_str()
        };
        let copy = self.publish_copy(session, remote, origin, None, tally).await?;
        let (stats, _pins) = self.coordinator.download(&copy, &cancel).await?;
        tally.downloaded += stats;
        let remote_bytes = self.blocks.assemble(&copy)?;
        self.land_copy(&copy, &remote_bytes)?;
        Ok(Cas::Won(copy.path))
    }

    /// Three-way merge of text edits.
    ///
    /// `Won(false)` means the merge was not possible and the caller falls
    /// back to keeping both versions.
    async fn try_merge(
        &self,
        session: &mut SyncSession,
        local: &LocalFile,
        remote: &Manifest,
        ancestor: Option<ManifestId>,
        tally: &mut Tally,
    ) -> Result<Cas<bool>> {
        let path = session.path.clone();
        let cancel = session.cancellation_token().clone();

        let ancestor = match ancestor {
            Some(id) => self.store.get_manifest(id)?,
            None => None,
        };
        let Some(ancestor) = ancestor else {
            debug!(path = %path, "no common ancestor, cannot merge");
            return Ok(Cas::Won(false));
        };
        let base = match self.blocks.assemble(&ancestor) {
            Ok(base) => base,
            Err(err) => {
                debug!(path = %path, error = %err, "ancestor content unavailable");
                return Ok(Cas::Won(false));
            }
        };

        let data = self.local_bytes(local)?;
        let (stats, _pins) = self.coordinator.download(remote, &cancel).await?;
        tally.downloaded += stats;
        let theirs = self.blocks.assemble(remote)?;

        let merged = match merge3(&base, &data, &theirs) {
            Ok(merged) => merged,
            Err(err) => {
                info!(path = %path, error = %err, "merge failed, keeping both versions");
                return Ok(Cas::Won(false));
            }
        };

        let blocks = self.segmenter.segment(&path, &merged)?;
        let result = Manifest::build(
            &path,
            &merged,
            blocks,
            Some(remote.id),
            WriteStamp::after(Some(remote), now_ms(), self.client()),
        );

        enter(session, SessionState::Transferring)?;
        tally.uploaded += self
            .coordinator
            .upload(&result, &result.unique_hashes(), Some(&*merged), &cancel)
            .await?;

        session.advance(SessionState::Committing)?;
        session.check_cancelled()?;
        local::ensure_unchanged(&self.root, &path, Some(local.stat)).await?;
        match self.put_manifest(&path, &result, Some(remote.id), &cancel).await? {
            PutOutcome::Committed => {
                // Both pre-merge versions stay in history below the merge
                self.commit_local(&path, &local.manifest, Some(&*data))?;
                self.commit_local(&path, remote, None)?;
                self.commit_local(&path, &result, Some(&*merged))?;
                let stat = local::write_atomic(&self.root, &path, &merged)?;
                self.record_synced(&path, stat, &result)?;
                Ok(Cas::Won(true))
            }
            PutOutcome::Conflict { current } => Ok(Cas::Lost(current)),
        }
    }
}

//! Incremental local to remote pass driven by watcher activity.

use std::collections::HashSet;
use std::path::Path;

use crate::error::SyncError;
use crate::util::hash;
use crate::util::path as sync_path;

use super::state::{self, CacheEntry, EntryKind};
use super::{PassFuture, SyncEngine, remote_failure};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanStats {
    pub folders_created: usize,
    pub uploaded: usize,
    pub updated: usize,
    /// Stale rows whose folder or unchanged file showed up again.
    pub revalidated: usize,
    /// Cached paths no longer present on disk, now marked invalid.
    pub missing: usize,
}

/// Bookkeeping for one walk of the local tree.
struct Pass {
    /// Cached paths not yet seen on disk.
    folders: HashSet<String>,
    files: HashSet<String>,
    stale_folders: HashSet<String>,
    conflicts: Vec<String>,
    stats: RescanStats,
}

impl Pass {
    /// Record a conflict from one step and let the walk go on. Returns
    /// whether the step succeeded; any other error ends the pass.
    fn settle(&mut self, step: Result<(), SyncError>) -> Result<bool, SyncError> {
        match step {
            Ok(()) => Ok(true),
            Err(SyncError::Conflict { paths }) => {
                self.conflicts.extend(paths);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl SyncEngine {
    /// Push local changes to the remote side.
    ///
    /// New folders and files are created remotely, changed files are
    /// uploaded as new versions. A path whose remote side also moved on
    /// (edited, trashed, or created under the same name) is left untouched
    /// and reported in [`SyncError::Conflict`] after the walk completes; a
    /// conflicted directory is not descended. Cached paths missing on disk
    /// are marked invalid; nothing is deleted remotely.
    pub async fn rescan_local_tree(&self) -> Result<RescanStats, SyncError> {
        let _guard = self.run_lock.lock().await;

        let mut pass = Pass {
            folders: state::scan_all_paths(&self.pool, EntryKind::Folder).await?,
            files: state::scan_all_paths(&self.pool, EntryKind::File).await?,
            stale_folders: state::scan_stale_paths(&self.pool, EntryKind::Folder).await?,
            conflicts: Vec::new(),
            stats: RescanStats::default(),
        };

        let root = self.mapper.local_root().to_path_buf();
        self.rescan_dir(&root, &mut pass).await?;

        let mut leftovers: Vec<(EntryKind, String)> = pass
            .folders
            .drain()
            .map(|p| (EntryKind::Folder, p))
            .chain(pass.files.drain().map(|p| (EntryKind::File, p)))
            .collect();
        leftovers.sort_by(|a, b| a.1.cmp(&b.1));
        for (kind, path) in leftovers {
            if state::set_valid(&self.pool, kind, &path, false).await? {
                tracing::debug!(path = %path, ?kind, "missing locally, marked invalid");
                pass.stats.missing += 1;
            }
        }

        let stats = pass.stats;
        tracing::info!(
            folders_created = stats.folders_created,
            uploaded = stats.uploaded,
            updated = stats.updated,
            missing = stats.missing,
            conflicts = pass.conflicts.len(),
            "local rescan finished"
        );

        if pass.conflicts.is_empty() {
            Ok(stats)
        } else {
            Err(SyncError::Conflict {
                paths: pass.conflicts,
            })
        }
    }

    fn canonical(&self, local: &Path) -> Result<String, SyncError> {
        self.mapper
            .to_canonical(local)
            .map_err(|e| SyncError::Integrity(format!("{e:#}")))
    }

    /// Pre-order: a directory is resolved remotely before anything inside it.
    fn rescan_dir<'a>(&'a self, dir: &'a Path, pass: &'a mut Pass) -> PassFuture<'a, ()> {
        Box::pin(async move {
            let path = self.canonical(dir)?;
            if !pass.folders.remove(&path) {
                let created = self.ensure_folder_locked(&path).await.map(|_| ());
                if !pass.settle(created)? {
                    return Ok(());
                }
                pass.stats.folders_created += 1;
            } else if pass.stale_folders.remove(&path) {
                state::set_valid(&self.pool, EntryKind::Folder, &path, true).await?;
                pass.stats.revalidated += 1;
            }

            let mut read_dir = tokio::fs::read_dir(dir)
                .await
                .map_err(|e| SyncError::filesystem(dir, e))?;
            let mut children = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| SyncError::filesystem(dir, e))?
            {
                children.push(entry.path());
            }
            children.sort();

            let mut subdirs = Vec::new();
            for child in children {
                let meta = match tokio::fs::symlink_metadata(&child).await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %child.display(), error = %e, "cannot stat, skipping");
                        continue;
                    }
                };
                if meta.is_symlink() {
                    tracing::debug!(path = %child.display(), "skipping symlink");
                    continue;
                }
                if self.exclude.is_match(&child) {
                    tracing::debug!(path = %child.display(), "excluded (local)");
                    continue;
                }

                if meta.is_dir() {
                    subdirs.push(child);
                } else if meta.is_file() {
                    let step = self.rescan_file(&child, pass).await;
                    pass.settle(step)?;
                }
            }

            for sub in subdirs {
                self.rescan_dir(&sub, pass).await?;
            }
            Ok(())
        })
    }

    async fn rescan_file(&self, local: &Path, pass: &mut Pass) -> Result<(), SyncError> {
        let path = self.canonical(local)?;
        let digest = hash::content_digest(local).await;

        let cached = if pass.files.remove(&path) {
            state::get(&self.pool, EntryKind::File, &path).await?
        } else {
            None
        };

        match cached {
            None => self.upload_new(local, &path, digest, pass).await,
            Some(c) if hash::digests_match(&digest, &c.content_hash) => {
                if !c.valid {
                    state::set_valid(&self.pool, EntryKind::File, &path, true).await?;
                    pass.stats.revalidated += 1;
                }
                Ok(())
            }
            Some(c) => self.upload_changed(local, c, digest, pass).await,
        }
    }

    async fn upload_new(
        &self,
        local: &Path,
        path: &str,
        digest: String,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        let (parent, _) = sync_path::split_parent(path)
            .ok_or_else(|| SyncError::Integrity("the sync root is not a file".into()))?;
        let parent_id = self.ensure_folder_locked(parent).await?;

        tracing::info!(path, "uploading");
        let uploaded = self
            .client
            .upload_file(local, &parent_id)
            .await
            .map_err(|e| remote_failure(path, e))?;

        state::upsert(
            &self.pool,
            &CacheEntry::file(
                path,
                &uploaded.id,
                uploaded.content_hash.unwrap_or(digest),
                uploaded.sequence_id,
                parent_id,
            ),
        )
        .await?;
        pass.stats.uploaded += 1;
        Ok(())
    }

    async fn upload_changed(
        &self,
        local: &Path,
        cached: CacheEntry,
        digest: String,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        let Some(file_id) = cached.remote_id.as_deref() else {
            return Err(SyncError::Integrity(format!(
                "{} is cached without a remote id",
                cached.path
            )));
        };

        let remote = self
            .client
            .get_file_metadata(file_id)
            .await
            .map_err(|e| remote_failure(&cached.path, e))?;

        if remote.sequence_id != cached.sequence_id {
            // Both sides already hold the same bytes: adopt the remote revision.
            if remote
                .content_hash
                .as_deref()
                .is_some_and(|h| hash::digests_match(h, &digest))
            {
                tracing::debug!(path = %cached.path, "remote already has local content");
                let entry = CacheEntry {
                    content_hash: digest,
                    sequence_id: remote.sequence_id,
                    valid: true,
                    ..cached
                };
                state::upsert(&self.pool, &entry).await?;
                return Ok(());
            }

            tracing::warn!(
                path = %cached.path,
                cached = ?cached.sequence_id,
                remote = ?remote.sequence_id,
                "changed locally and remotely, not uploading"
            );
            return Err(SyncError::Conflict {
                paths: vec![cached.path],
            });
        }

        tracing::info!(path = %cached.path, "uploading new version");
        let updated = self
            .client
            .upload_new_version(file_id, local)
            .await
            .map_err(|e| remote_failure(&cached.path, e))?;

        let entry = CacheEntry {
            remote_id: Some(updated.id),
            content_hash: updated.content_hash.unwrap_or(digest),
            sequence_id: updated.sequence_id,
            valid: true,
            ..cached
        };
        state::upsert(&self.pool, &entry).await?;
        pass.stats.updated += 1;
        Ok(())
    }
}

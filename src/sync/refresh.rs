//! Full top-down rebuild of the cache and local tree from the remote tree.

use anyhow::Context;

use crate::error::SyncError;
use crate::remote::{ROOT_FOLDER_ID, RemoteFolder};
use crate::util::hash;
use crate::util::path::{self as sync_path, ROOT_PATH};

use super::state::{self, CacheEntry, EntryKind};
use super::{PassFuture, SyncEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub folders: usize,
    pub files: usize,
    pub downloaded: usize,
}

impl SyncEngine {
    /// Download everything under the remote sync root that is missing or
    /// differs locally, recording every file and folder in the cache.
    ///
    /// Rerunning against an unchanged remote tree transfers nothing.
    pub async fn hard_refresh(&self) -> Result<RefreshStats, SyncError> {
        let _guard = self.run_lock.lock().await;

        let root = self.resolve_sync_root().await?;
        let local_root = self.mapper.local_root();
        tokio::fs::create_dir_all(local_root)
            .await
            .map_err(|e| SyncError::filesystem(local_root, e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        state::rebind_folder(&mut tx, ROOT_PATH, &root.id).await?;
        state::upsert(
            &mut *tx,
            &CacheEntry::folder(ROOT_PATH, &root.id, root.sequence_id.clone(), None),
        )
        .await?;
        tx.commit().await.context("Failed to commit sync root")?;

        tracing::info!(remote_root = %self.remote_root, id = %root.id, "full refresh started");
        let mut stats = RefreshStats::default();
        self.refresh_folder(&root.id, ROOT_PATH, &mut stats).await?;

        tracing::info!(
            folders = stats.folders,
            files = stats.files,
            downloaded = stats.downloaded,
            "full refresh finished"
        );
        Ok(stats)
    }

    async fn resolve_sync_root(&self) -> Result<RemoteFolder, SyncError> {
        let top = self
            .client
            .list_folder(ROOT_FOLDER_ID)
            .await
            .map_err(SyncError::Transport)?;

        top.folders
            .into_iter()
            .find(|f| f.name == self.remote_root)
            .ok_or_else(|| {
                SyncError::Integrity(format!(
                    "remote sync folder \"{}\" not found",
                    self.remote_root
                ))
            })
    }

    /// One folder level is written in a single transaction. Subfolders are
    /// descended only after that level is committed, so a child row never
    /// lands before its parent row.
    ///
    /// Rows whose remote id moved to another path, or whose path now holds
    /// a different remote folder, are dropped before the level is written.
    fn refresh_folder<'a>(
        &'a self,
        folder_id: &'a str,
        path: &'a str,
        stats: &'a mut RefreshStats,
    ) -> PassFuture<'a, ()> {
        Box::pin(async move {
            let contents = self
                .client
                .list_folder(folder_id)
                .await
                .map_err(SyncError::Transport)?;

            let mut tx = self
                .pool
                .begin()
                .await
                .context("Failed to begin transaction")?;

            for file in &contents.files {
                let file_path = sync_path::join(path, &file.name);
                let local = self.mapper.to_local(&file_path);
                if self.exclude.is_match(&local) {
                    tracing::debug!(path = %file_path, "excluded (remote)");
                    continue;
                }

                let cached = state::get(&mut *tx, EntryKind::File, &file_path).await?;
                let unchanged = match (&cached, &file.content_hash) {
                    (Some(c), Some(remote)) => {
                        hash::digests_match(&c.content_hash, remote)
                            && tokio::fs::try_exists(&local).await.unwrap_or(false)
                    }
                    _ => false,
                };

                let content_hash = if unchanged {
                    file.content_hash.clone().unwrap_or_default()
                } else {
                    tracing::info!(path = %file_path, "downloading");
                    self.client
                        .download_file(&file.id, &local)
                        .await
                        .map_err(SyncError::Transport)?;
                    stats.downloaded += 1;
                    match &file.content_hash {
                        Some(h) => h.clone(),
                        None => hash::content_digest(&local).await,
                    }
                };

                if let Some(old) =
                    state::evict_moved(&mut tx, EntryKind::File, &file.id, &file_path).await?
                {
                    tracing::debug!(from = %old, to = %file_path, "file moved remotely");
                }
                state::upsert(
                    &mut *tx,
                    &CacheEntry::file(
                        file_path,
                        &file.id,
                        content_hash,
                        file.sequence_id.clone(),
                        folder_id,
                    ),
                )
                .await?;
                stats.files += 1;
            }

            let mut subfolders = Vec::with_capacity(contents.folders.len());
            for folder in &contents.folders {
                let sub_path = sync_path::join(path, &folder.name);
                if self.exclude.is_match(&self.mapper.to_local(&sub_path)) {
                    tracing::debug!(path = %sub_path, "excluded (remote)");
                    continue;
                }
                state::rebind_folder(&mut tx, &sub_path, &folder.id).await?;
                state::upsert(
                    &mut *tx,
                    &CacheEntry::folder(
                        &sub_path,
                        &folder.id,
                        folder.sequence_id.clone(),
                        Some(folder_id.to_string()),
                    ),
                )
                .await?;
                stats.folders += 1;
                subfolders.push((folder.id.as_str(), sub_path));
            }

            tx.commit()
                .await
                .with_context(|| format!("Failed to commit folder level {path:?}"))?;

            for (id, sub_path) in subfolders {
                let local = self.mapper.to_local(&sub_path);
                tokio::fs::create_dir_all(&local)
                    .await
                    .map_err(|e| SyncError::filesystem(&local, e))?;
                self.refresh_folder(id, &sub_path, stats).await?;
            }

            Ok(())
        })
    }
}

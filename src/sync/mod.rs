mod debounce;
pub mod driver;
pub mod exclude;
pub mod local_watcher;
mod refresh;
mod rescan;
pub mod state;


use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::remote::{RemoteApi, RemoteError};
use crate::util::path::{self as sync_path, PathMapper};

use exclude::Exclude;
use state::{CacheEntry, EntryKind};

pub use refresh::RefreshStats;
pub use rescan::RescanStats;

type PassFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Classify a failed remote call made on behalf of `path`. A response saying
/// the remote tree is not what the cache describes is a conflict on that
/// path; anything else is a transport failure.
fn remote_failure(path: &str, err: anyhow::Error) -> SyncError {
    match RemoteError::find(&err) {
        Some(e) => {
            tracing::warn!(path, error = %e, "remote differs from the cache");
            SyncError::Conflict {
                paths: vec![path.to_string()],
            }
        }
        None => SyncError::Transport(err),
    }
}

/// Reconciles one local directory tree with one remote folder tree through
/// the metadata cache.
///
/// At most one pass (refresh, rescan, or standalone folder creation) runs at
/// a time; a second caller waits for the first to finish.
pub struct SyncEngine {
    pool: SqlitePool,
    client: Arc<dyn RemoteApi>,
    mapper: PathMapper,
    /// Name of the sync root folder directly under the remote account root.
    remote_root: String,
    exclude: Exclude,
    run_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        client: Arc<dyn RemoteApi>,
        mapper: PathMapper,
        remote_root: impl Into<String>,
        exclude: Exclude,
    ) -> Self {
        Self {
            pool,
            client,
            mapper,
            remote_root: remote_root.into(),
            exclude,
            run_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Resolve the remote id of a canonical folder path, creating it and any
    /// missing ancestors remotely (root first).
    ///
    /// If a folder of that name already exists remotely but not in the cache,
    /// the result is [`SyncError::Conflict`] for that path; a full refresh
    /// picks it up.
    pub async fn ensure_folder(&self, path: &str) -> Result<String, SyncError> {
        let _guard = self.run_lock.lock().await;
        self.ensure_folder_locked(path).await
    }

    fn ensure_folder_locked<'a>(&'a self, path: &'a str) -> PassFuture<'a, String> {
        Box::pin(async move {
            if let Some(CacheEntry {
                remote_id: Some(id),
                ..
            }) = state::get(&self.pool, EntryKind::Folder, path).await?
            {
                return Ok(id);
            }

            let Some((parent, name)) = sync_path::split_parent(path) else {
                return Err(SyncError::Integrity(
                    "sync root is not in the cache, run a full refresh first".into(),
                ));
            };

            let parent_id = self.ensure_folder_locked(parent).await?;
            let created = self
                .client
                .create_folder(name, &parent_id)
                .await
                .map_err(|e| remote_failure(path, e))?;

            state::upsert(
                &self.pool,
                &CacheEntry::folder(path, &created.id, created.sequence_id, Some(parent_id)),
            )
            .await?;

            tracing::info!(path, id = %created.id, "created remote folder");
            Ok(created.id)
        })
    }
}

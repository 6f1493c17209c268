use std::path::PathBuf;

use thiserror::Error;

/// Failures of a reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote service could not be reached or answered with an error.
    #[error("remote API error: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// Paths changed locally whose remote side no longer matches the cache:
    /// a newer sequence ID, a trashed file, or a name taken remotely.
    /// Nothing was transferred for these paths.
    #[error("conflict: {} changed both locally and remotely", .paths.join(", "))]
    Conflict { paths: Vec<String> },

    /// Cache and remote disagree in a way the reconciler cannot repair on its own.
    #[error("inconsistent sync state: {0}")]
    Integrity(String),

    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether rerunning the same pass later may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Filesystem { .. })
    }
}

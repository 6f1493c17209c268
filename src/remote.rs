//! Contract between the reconciler and the remote storage service.
//!
//! Methods return `anyhow` errors. A failure caused by the remote tree not
//! matching what the caller expected carries a [`RemoteError`] somewhere in
//! its chain; every other failure is treated as a transport error.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Identifier of the remote root folder that contains the sync root.
pub const ROOT_FOLDER_ID: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    /// SHA-1 of the content, when the service reports one.
    pub content_hash: Option<String>,
    pub sequence_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
    pub sequence_id: Option<String>,
}

/// One level of a remote folder listing.
#[derive(Debug, Clone, Default)]
pub struct FolderContents {
    pub files: Vec<RemoteFile>,
    pub folders: Vec<RemoteFolder>,
}

/// The remote tree differs from what the request assumed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{0} not found remotely")]
    NotFound(String),

    #[error("{0} already exists remotely")]
    AlreadyExists(String),
}

impl RemoteError {
    /// Find a remote state error anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&RemoteError> {
        err.chain().find_map(|e| e.downcast_ref::<RemoteError>())
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_folder(&self, folder_id: &str) -> Result<FolderContents>;

    async fn get_file_metadata(&self, file_id: &str) -> Result<RemoteFile>;

    /// Write the file's content to `dest`, replacing any existing file.
    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()>;

    /// Fails with [`RemoteError::AlreadyExists`] if the parent already holds
    /// an item of that name.
    async fn upload_file(&self, src: &Path, parent_id: &str) -> Result<RemoteFile>;

    async fn upload_new_version(&self, file_id: &str, src: &Path) -> Result<RemoteFile>;

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteFolder>;
}

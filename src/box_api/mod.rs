//! Box Content API adapter behind [`RemoteApi`].

mod client;
mod files;
mod folders;
mod types;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::remote::{FolderContents, RemoteApi, RemoteFile, RemoteFolder};

pub use client::BoxClient;
pub use files::TEMP_SUFFIX;
use types::{BoxFile, BoxFolder, BoxItem};

impl From<BoxFile> for RemoteFile {
    fn from(f: BoxFile) -> Self {
        Self {
            id: f.id,
            name: f.name,
            content_hash: f.sha1.filter(|h| !h.is_empty()),
            sequence_id: f.sequence_id,
        }
    }
}

impl From<BoxFolder> for RemoteFolder {
    fn from(f: BoxFolder) -> Self {
        Self {
            id: f.id,
            name: f.name,
            sequence_id: f.sequence_id,
        }
    }
}

fn split_items(items: Vec<BoxItem>) -> FolderContents {
    let mut contents = FolderContents::default();
    for item in items {
        match item {
            BoxItem::File(f) => contents.files.push(f.into()),
            BoxItem::Folder(f) => contents.folders.push(f.into()),
            BoxItem::Other => {}
        }
    }
    contents
}

#[async_trait]
impl RemoteApi for BoxClient {
    async fn list_folder(&self, folder_id: &str) -> Result<FolderContents> {
        Ok(split_items(self.list_folder_items(folder_id).await?))
    }

    async fn get_file_metadata(&self, file_id: &str) -> Result<RemoteFile> {
        Ok(self.get_file(file_id).await?.into())
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        self.download_content(file_id, dest).await
    }

    async fn upload_file(&self, src: &Path, parent_id: &str) -> Result<RemoteFile> {
        Ok(self.upload_content(src, parent_id).await?.into())
    }

    async fn upload_new_version(&self, file_id: &str, src: &Path) -> Result<RemoteFile> {
        Ok(self.upload_version(file_id, src).await?.into())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteFolder> {
        Ok(self.post_folder(name, parent_id).await?.into())
    }
}

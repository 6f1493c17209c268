use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::Method;
use tokio::io::AsyncWriteExt;

use crate::remote::RemoteError;

use super::client::BoxClient;
use super::types::{BoxFile, ParentRef, UploadAttributes, UploadResponse};

/// Suffix of in-progress downloads. Excluded from sync by default.
pub const TEMP_SUFFIX: &str = ".boxsync.tmp";

const FILE_FIELDS: &str = "id,name,sha1,sequence_id";

impl BoxClient {
    pub async fn get_file(&self, file_id: &str) -> Result<BoxFile> {
        let resp = self
            .api_request(Method::GET, &format!("/files/{file_id}"))
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .with_context(|| format!("Failed to get file {file_id}"))?;

        resp.json().await.context("Failed to parse file response")
    }

    /// Stream the content into a temp sibling of `dest`, then rename it into place.
    pub async fn download_content(&self, file_id: &str, dest: &Path) -> Result<()> {
        let mut resp = self
            .api_request(Method::GET, &format!("/files/{file_id}/content"))
            .send()
            .await
            .with_context(|| format!("Failed to download file {file_id}"))?;

        let tmp_path = temp_path(dest);
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        let written: Result<()> = async {
            while let Some(chunk) = resp.chunk().await.context("Failed to read download body")? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, dest)
            .await
            .with_context(|| format!("Failed to rename temp file to {}", dest.display()))?;
        Ok(())
    }

    /// Upload a file that does not exist remotely yet.
    pub async fn upload_content(&self, local_path: &Path, parent_id: &str) -> Result<BoxFile> {
        let name = file_name(local_path)?;
        let attrs = UploadAttributes {
            name: name.clone(),
            parent: Some(ParentRef {
                id: parent_id.to_string(),
            }),
            content_modified_at: modified_at(local_path).await,
        };
        let form = upload_form(local_path, &name, &attrs).await?;

        let resp = self
            .upload_request(Method::POST, "/files/content")
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", local_path.display()))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(
                RemoteError::AlreadyExists(format!("file '{name}' in folder {parent_id}")).into(),
            );
        }
        first_entry(resp).await
    }

    /// Upload new content for an existing file.
    pub async fn upload_version(&self, file_id: &str, local_path: &Path) -> Result<BoxFile> {
        let name = file_name(local_path)?;
        let attrs = UploadAttributes {
            name: name.clone(),
            parent: None,
            content_modified_at: modified_at(local_path).await,
        };
        let form = upload_form(local_path, &name, &attrs).await?;

        let resp = self
            .upload_request(Method::POST, &format!("/files/{file_id}/content"))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Failed to upload new version of {}", local_path.display()))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(
                RemoteError::AlreadyExists(format!("new version of '{name}'")).into(),
            );
        }
        first_entry(resp).await
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .with_context(|| format!("Invalid file name: {}", path.display()))
}

async fn upload_form(
    local_path: &Path,
    name: &str,
    attrs: &UploadAttributes,
) -> Result<reqwest::multipart::Form> {
    let attrs_json = serde_json::to_string(attrs)?;
    let bytes = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read {}", local_path.display()))?;

    Ok(reqwest::multipart::Form::new()
        .text("attributes", attrs_json)
        .part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(name.to_string()),
        ))
}

async fn first_entry(resp: reqwest::Response) -> Result<BoxFile> {
    let upload: UploadResponse = resp
        .json()
        .await
        .context("Failed to parse upload response")?;
    upload
        .entries
        .into_iter()
        .next()
        .context("Upload response contained no file entries")
}

/// The file's mtime as RFC 3339 with whole seconds; Box rejects finer precision.
async fn modified_at(path: &Path) -> Option<String> {
    use chrono::SecondsFormat;
    use std::time::UNIX_EPOCH;

    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    let dt = chrono::DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)?;
    Some(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_an_excluded_sibling() {
        let tmp = temp_path(Path::new("/sync/docs/report.txt"));
        assert_eq!(tmp, PathBuf::from("/sync/docs/report.txt.boxsync.tmp"));
        let exclude = crate::sync::exclude::Exclude::new(&["*.boxsync.tmp".into()], &[]);
        assert!(exclude.is_match(&tmp));
    }

    #[tokio::test]
    async fn modified_at_has_whole_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();

        let stamp = modified_at(&path).await.unwrap();
        assert!(stamp.ends_with('Z'), "{stamp}");
        assert!(!stamp.contains('.'), "{stamp}");
        assert!(modified_at(&dir.path().join("missing")).await.is_none());
    }
}

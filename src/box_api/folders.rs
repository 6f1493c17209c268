use anyhow::{Context, Result};
use reqwest::Method;

use crate::remote::RemoteError;

use super::client::BoxClient;
use super::types::{BoxFolder, BoxItem, CreateFolderRequest, FolderItems, ParentRef};

/// Fields requested for folder listings.
const ITEM_FIELDS: &str = "type,id,name,sha1,sequence_id";
const PAGE_LIMIT: &str = "1000";

impl BoxClient {
    /// One level of a folder, following pagination markers to the end.
    pub async fn list_folder_items(&self, folder_id: &str) -> Result<Vec<BoxItem>> {
        let mut all_items = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![
                ("fields", ITEM_FIELDS),
                ("limit", PAGE_LIMIT),
                ("usemarker", "true"),
            ];
            if let Some(ref m) = marker {
                params.push(("marker", m.as_str()));
            }

            let resp = self
                .api_request(Method::GET, &format!("/folders/{folder_id}/items"))
                .query(&params)
                .send()
                .await
                .with_context(|| format!("Failed to list folder {folder_id}"))?;

            let page: FolderItems = resp
                .json()
                .await
                .context("Failed to parse folder items response")?;

            all_items.extend(page.entries);

            match page.next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }

        tracing::trace!(folder_id, count = all_items.len(), "listed folder");
        Ok(all_items)
    }

    pub async fn post_folder(&self, name: &str, parent_id: &str) -> Result<BoxFolder> {
        let body = CreateFolderRequest {
            name: name.to_string(),
            parent: ParentRef {
                id: parent_id.to_string(),
            },
        };

        let resp = self
            .api_request(Method::POST, "/folders")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to create folder {name} in {parent_id}"))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(
                RemoteError::AlreadyExists(format!("folder '{name}' in parent {parent_id}")).into(),
            );
        }

        resp.json()
            .await
            .context("Failed to parse create folder response")
    }
}

use serde::{Deserialize, Serialize};

/// An entry of a folder listing, decoded once by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoxItem {
    File(BoxFile),
    Folder(BoxFolder),
    /// Web links and anything else the sync does not handle.
    #[serde(other)]
    Other,
}

/// File metadata from listings, GET /files/{id} and upload responses.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sequence_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoxFolder {
    pub id: String,
    pub name: String,
    /// `null` for the account root.
    #[serde(default)]
    pub sequence_id: Option<String>,
}

/// Paginated response from GET /folders/{id}/items.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderItems {
    pub entries: Vec<BoxItem>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

/// Response from POST /files/content and POST /files/{id}/content.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub entries: Vec<BoxFile>,
}

/// Attributes JSON for file upload.
#[derive(Debug, Serialize)]
pub struct UploadAttributes {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_modified_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ParentRef {
    pub id: String,
}

/// Request body for creating a folder.
#[derive(Debug, Serialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent: ParentRef,
}

/// Box API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxApiError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

impl std::fmt::Display for BoxApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Box API error {}: {} (code: {}, request: {})",
            self.status.unwrap_or(0),
            self.message.as_deref().unwrap_or("unknown"),
            self.code.as_deref().unwrap_or("none"),
            self.request_id.as_deref().unwrap_or("none"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_decodes_by_type() {
        let json = r#"{
            "total_count": 3,
            "entries": [
                {"type": "file", "id": "11", "name": "report.txt", "sha1": "abc", "sequence_id": "3", "etag": "3"},
                {"type": "folder", "id": "22", "name": "docs", "sequence_id": "0"},
                {"type": "web_link", "id": "33", "name": "homepage"}
            ],
            "next_marker": null
        }"#;
        let page: FolderItems = serde_json::from_str(json).unwrap();
        assert_eq!(page.entries.len(), 3);
        assert!(page.next_marker.is_none());

        match &page.entries[0] {
            BoxItem::File(f) => {
                assert_eq!(f.id, "11");
                assert_eq!(f.sha1.as_deref(), Some("abc"));
                assert_eq!(f.sequence_id.as_deref(), Some("3"));
            }
            other => panic!("expected file, got {other:?}"),
        }
        assert!(matches!(&page.entries[1], BoxItem::Folder(f) if f.name == "docs"));
        assert!(matches!(page.entries[2], BoxItem::Other));
    }

    #[test]
    fn root_folder_has_no_sequence() {
        let folder: BoxFolder =
            serde_json::from_str(r#"{"type": "folder", "id": "0", "name": "All Files", "sequence_id": null}"#)
                .unwrap();
        assert!(folder.sequence_id.is_none());
    }

    #[test]
    fn upload_attributes_skip_empty_fields() {
        let attrs = UploadAttributes {
            name: "a.txt".into(),
            parent: None,
            content_modified_at: None,
        };
        assert_eq!(serde_json::to_string(&attrs).unwrap(), r#"{"name":"a.txt"}"#);
    }

    #[test]
    fn api_error_display() {
        let err: BoxApiError = serde_json::from_str(
            r#"{"type": "error", "status": 409, "code": "item_name_in_use", "message": "Item with the same name already exists", "request_id": "r1"}"#,
        )
        .unwrap();
        assert_eq!(
            err.to_string(),
            "Box API error 409: Item with the same name already exists (code: item_name_in_use, request: r1)"
        );
    }
}

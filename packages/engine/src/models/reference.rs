use chrono::{DateTime, Utc};
use common::storage::BoxReader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{content_object, user_reference};
use crate::permission::Effective;

/// Sort orders accepted by `list_references`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    NameAsc,
    NameDesc,
    #[default]
    CreatedDesc,
    CreatedAsc,
    SizeAsc,
    SizeDesc,
}

/// One row of a folder listing.
#[derive(Debug, Serialize)]
pub struct ReferenceSummary {
    pub id: Uuid,
    pub filename: String,
    pub folder: String,
    pub size_bytes: i64,
    pub mime: String,
    pub download_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub permissions: Effective,
    /// The object's mask as a three-digit octal string, e.g. "644".
    pub octal: String,
}

impl ReferenceSummary {
    pub fn from_parts(
        reference: &user_reference::Model,
        object: &content_object::Model,
        permissions: Effective,
        octal: String,
    ) -> Self {
        Self {
            id: reference.id,
            filename: reference.user_filename.clone(),
            folder: reference.folder_path.clone(),
            size_bytes: object.size_bytes,
            mime: object.detected_mime.clone(),
            download_count: reference.download_count,
            last_accessed: reference.last_accessed,
            created_at: reference.created_at,
            permissions,
            octal,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReferenceList {
    pub references: Vec<ReferenceSummary>,
    pub pagination: super::Pagination,
}

/// Another live reference to the same content object.
#[derive(Debug, Serialize)]
pub struct DedupSibling {
    pub reference_id: Uuid,
    pub username: String,
    pub user_filename: String,
    pub created_at: DateTime<Utc>,
}

/// Full metadata view of one reference.
#[derive(Debug, Serialize)]
pub struct ReferenceDetails {
    #[serde(flatten)]
    pub summary: ReferenceSummary,
    pub content_hash: String,
    pub declared_mime: Option<String>,
    pub reference_count: i64,
    /// Other live references to the same bytes, including other principals'.
    pub siblings: Vec<DedupSibling>,
}

/// What a download hands back to the transport adapter.
pub enum Download {
    /// Stream the bytes through the engine.
    Stream {
        reader: BoxReader,
        size_bytes: i64,
        mime: String,
        filename: String,
        etag: String,
    },
    /// Redirect the client to fetch directly from the object store.
    Url(String),
}

/// Organization storage accounting for display.
#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub allocated_bytes: i64,
    /// Physical bytes consumed by unique content.
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub usage_percent: f64,
    /// Summed sizes of all live references.
    pub logical_bytes: i64,
    /// logical - physical.
    pub savings_bytes: i64,
    pub savings_percent: f64,
    pub reference_count: u64,
    pub unique_object_count: u64,
}

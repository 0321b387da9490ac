use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-declared attributes of a single file ingest.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    /// Filename as the uploader named it.
    pub filename: String,
    /// Virtual folder for the new reference. Defaults to "/".
    #[serde(default = "default_folder")]
    pub folder: String,
    /// MIME type claimed by the client; reconciled against detection.
    pub declared_mime: Option<String>,
    /// Session token when this ingest belongs to a batch.
    pub session_token: Option<String>,
}

pub fn default_folder() -> String {
    "/".into()
}

/// Result of a successful ingest.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    /// The caller's new reference.
    pub reference_id: Uuid,
    /// The content object backing it.
    pub object_id: Uuid,
    /// Whether the bytes already existed.
    pub deduplicated: bool,
    /// Size of the ingested content.
    pub size_bytes: i64,
    /// Physical bytes not written thanks to deduplication.
    pub bytes_saved: i64,
    /// Non-fatal validator findings (MIME mismatch, archive warning, ...).
    pub warnings: Vec<String>,
}

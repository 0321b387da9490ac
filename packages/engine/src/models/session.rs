use serde::{Deserialize, Serialize};

use crate::entity::upload_session::SessionStatus;

/// One declared file in a session batch.
#[derive(Debug, Clone, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    pub declared_mime: Option<String>,
    pub size_bytes: i64,
    #[serde(default = "super::upload::default_folder")]
    pub folder: String,
    /// Client-side SHA-256, when the uploader computed one. Enables the
    /// duplicate pre-count before any bytes move.
    pub fingerprint: Option<String>,
}

/// Response to `create_session`.
#[derive(Debug, Serialize)]
pub struct CreatedSession {
    pub session_token: String,
    pub total_files: i32,
    pub total_bytes: i64,
    /// How many declared fingerprints already exist in the vault.
    pub duplicate_count: i32,
}

/// Owner-visible progress snapshot.
#[derive(Debug, Serialize)]
pub struct SessionProgress {
    pub session_token: String,
    pub total_files: i32,
    pub completed_files: i32,
    pub failed_files: i32,
    pub total_bytes: i64,
    pub uploaded_bytes: i64,
    pub status: SessionStatus,
    pub progress_percent: f64,
}

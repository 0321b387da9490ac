use common::storage::StorageError;
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Engine-level error taxonomy. Each kind has one meaning and one surface.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Admission denied by the rate limiter.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The validator rejected filename, extension, magic bytes or size.
    #[error("content rejected: {}", .0.join("; "))]
    InvalidContent(Vec<String>),

    /// The organization is over its allocation.
    #[error("quota exceeded: {used} of {allocated} bytes used")]
    QuotaExceeded { used: i64, allocated: i64 },

    /// The principal already has a live reference with this filename in
    /// this folder.
    #[error("a file with this name already exists in the folder")]
    NameConflict,

    /// The virus scanner returned a positive.
    #[error("threat detected: {0}")]
    Infected(String),

    /// Transient object-store failure. Retryable at the caller.
    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Transient metadata-store failure. Retryable at the caller.
    #[error("metadata store unavailable: {0}")]
    MetadataUnavailable(String),

    /// No such reference, session or entity.
    #[error("not found")]
    NotFound,

    /// A terminal session transition conflicting with the recorded outcome.
    #[error("session already reached a terminal status")]
    AlreadyTerminal,

    /// The permission resolver said no.
    #[error("forbidden")]
    Forbidden,

    /// The request was cancelled by the caller before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed input that is not file content (bad ids, empty batches).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unclassified failure. The correlation id links to the log line
    /// carrying the underlying detail.
    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: Uuid },
}

impl VaultError {
    /// Construct an `Internal` error, logging the detail under a fresh
    /// correlation id. The detail never reaches the caller.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, "internal error: {detail}");
        Self::Internal { correlation_id }
    }

    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate-limited",
            Self::InvalidContent(_) => "invalid-content",
            Self::QuotaExceeded { .. } => "quota-exceeded",
            Self::NameConflict => "name-conflict",
            Self::Infected(_) => "infected",
            Self::StorageUnavailable(_) => "storage-unavailable",
            Self::MetadataUnavailable(_) => "metadata-unavailable",
            Self::NotFound => "not-found",
            Self::AlreadyTerminal => "already-terminal",
            Self::Forbidden => "forbidden",
            Self::Cancelled => "cancelled",
            Self::InvalidInput(_) => "invalid-input",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether a caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::MetadataUnavailable(_)
        )
    }
}

impl From<DbErr> for VaultError {
    fn from(err: DbErr) -> Self {
        match &err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
                Self::MetadataUnavailable(err.to_string())
            }
            _ => Self::internal(err),
        }
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::NotFound,
            StorageError::PermissionDenied(detail) => {
                // Misconfigured credentials are an operator problem, not a
                // caller problem.
                Self::internal(format!("object store denied access: {detail}"))
            }
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

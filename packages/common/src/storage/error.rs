use std::fmt;

/// Errors that can occur during object storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// The requested object was not found.
    NotFound(String),
    /// The storage key is malformed (too long, bad characters, traversal).
    InvalidKey(String),
    /// An I/O error occurred.
    Io(std::io::Error),
    /// The backend rejected the write because the object changed underneath us.
    Conflict(String),
    /// The backend itself is out of capacity.
    QuotaExceededUpstream(String),
    /// The backend rejected our credentials.
    PermissionDenied(String),
    /// The backend is unreachable or returned a transient failure.
    Unavailable(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "object not found: {key}"),
            Self::InvalidKey(msg) => write!(f, "invalid storage key: {msg}"),
            Self::Io(err) => write!(f, "storage IO error: {err}"),
            Self::Conflict(msg) => write!(f, "storage conflict: {msg}"),
            Self::QuotaExceededUpstream(msg) => write!(f, "backend capacity exceeded: {msg}"),
            Self::PermissionDenied(msg) => write!(f, "storage access denied: {msg}"),
            Self::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

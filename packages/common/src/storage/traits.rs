use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::StorageError;

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Metadata for a stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub etag: String,
}

/// Maximum length of a storage key.
pub const MAX_KEY_LEN: usize = 256;

/// Validate a path-shaped storage key.
///
/// Keys are ASCII, at most 256 characters, slash-separated, with no empty
/// segments, no traversal components and no leading slash.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key is empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "key exceeds {MAX_KEY_LEN} characters"
        )));
    }
    if !key.is_ascii() {
        return Err(StorageError::InvalidKey(
            "key contains non-ASCII characters".into(),
        ));
    }
    if key.contains('\0') || key.contains('\\') {
        return Err(StorageError::InvalidKey(
            "key contains forbidden characters".into(),
        ));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(
            "key must not start or end with '/'".into(),
        ));
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return Err(StorageError::InvalidKey("key has empty segment".into()));
        }
        if segment == "." || segment == ".." {
            return Err(StorageError::InvalidKey(
                "key contains traversal segment".into(),
            ));
        }
    }
    Ok(())
}

/// Opaque byte storage keyed by path-shaped strings.
///
/// The engine is polymorphic over this trait; the local-filesystem backend
/// serves development, the Azure backend serves production.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `length` bytes from `reader` under `key`.
    ///
    /// Overwrites any existing object at the key. Content-addressed callers
    /// never observe a conflicting overwrite because identical keys imply
    /// identical bytes.
    async fn put(
        &self,
        key: &str,
        reader: BoxReader,
        length: u64,
        mime_hint: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Retrieve an object as a streaming async reader.
    async fn get(&self, key: &str) -> Result<BoxReader, StorageError>;

    /// Delete an object.
    ///
    /// Returns `true` if it existed, `false` if it was already gone.
    /// Idempotent: deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Fetch object metadata without reading the body.
    async fn stat(&self, key: &str) -> Result<ObjectInfo, StorageError>;

    /// Produce a time-limited URL granting read access to the object.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Enumerate keys under a prefix (for reconciliation sweeps).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Store an in-memory byte slice. Convenience wrapper over `put`.
    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let len = data.len() as u64;
        let reader: BoxReader = Box::new(Cursor::new(data.to_vec()));
        self.put(key, reader, len, None).await
    }

    /// Read an entire object into memory. Convenience wrapper over `get`.
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.get(key).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

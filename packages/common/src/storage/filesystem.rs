use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use super::error::StorageError;
use super::traits::{BoxReader, ObjectInfo, ObjectStore, validate_key};

/// Filesystem-backed object store for local development.
///
/// Objects live at `{root}/{key}`; writes go through a temp file in
/// `{root}/.tmp` followed by an atomic rename, so readers never observe a
/// partially written object.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join(".tmp")).await?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Recursively collect keys under `dir`, skipping the temp area.
    async fn collect_keys(
        &self,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let mut pending: Vec<PathBuf> = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if path.file_name().is_some_and(|n| n == ".tmp") {
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(key) = relative_key(&self.root, &path)
                        && key.starts_with(prefix)
                    {
                        out.push(key);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Convert an absolute object path back into its storage key.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let key = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(key)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        mut reader: BoxReader,
        _length: u64,
        _mime_hint: Option<&str>,
    ) -> Result<(), StorageError> {
        let object_path = self.object_path(key)?;
        let temp_path = self.temp_path();

        let mut temp_file = fs::File::create(&temp_path).await?;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    drop(temp_file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = temp_file.write_all(&buf[..n]).await {
                drop(temp_file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(e.into());
            }
        }

        temp_file.flush().await?;
        drop(temp_file);

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = fs::rename(&temp_path, &object_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<BoxReader, StorageError> {
        let object_path = self.object_path(key)?;
        match fs::File::open(&object_path).await {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let object_path = self.object_path(key)?;
        match fs::remove_file(&object_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let object_path = self.object_path(key)?;
        match fs::metadata(&object_path).await {
            Ok(meta) => {
                let modified: DateTime<Utc> = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(ObjectInfo {
                    size: meta.len(),
                    etag: format!("\"{}-{}\"", meta.len(), modified.timestamp()),
                    modified,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String, StorageError> {
        // No signing authority locally; hand back a file URL. The Azure
        // backend issues real SAS URLs.
        let object_path = self.object_path(key)?;
        if !fs::try_exists(&object_path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("file://{}", object_path.display()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        self.collect_keys(prefix, &mut keys).await?;
        keys.sort();
        Ok(keys)
    }
}

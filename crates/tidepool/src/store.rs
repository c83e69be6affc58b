//! External file store boundary.
//!
//! `stage_file` pulls objects out of a store into a sandbox and
//! `publish_file` pushes sandbox files back. The store is addressed by string
//! keys such as `files/f_3b1c...`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by a [`FileStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object under this key.
    #[error("file not found: {0}")]
    NotFound(String),
    /// The key cannot address an object.
    #[error("invalid file key: {0}")]
    InvalidKey(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other store failure.
    #[error("file store error: {0}")]
    Backend(String),
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// MIME type
    pub content_type: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Extra metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Upload time
    pub created_at: DateTime<Utc>,
}

/// Options for [`FileStore::put`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// MIME type, `application/octet-stream` when empty
    pub content_type: String,
    /// Free-form description
    pub description: String,
    /// Extra metadata
    pub metadata: BTreeMap<String, String>,
}

/// Key-addressed object store.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Fetch an object and its metadata.
    async fn get(&self, key: &str) -> Result<(Vec<u8>, FileInfo), StoreError>;

    /// Store an object, replacing any previous one under the same key.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> Result<FileInfo, StoreError>;
}

/// Generate a new file id.
pub fn generate_file_id() -> String {
    format!("f_{}", uuid::Uuid::new_v4().simple())
}

/// Key under which user-visible files are stored.
pub fn user_file_key(file_id: &str) -> String {
    format!("files/{file_id}")
}

/// MIME type inferred from a path's extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.trim().is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

fn file_info(key: &str, size: usize, options: PutOptions) -> FileInfo {
    FileInfo {
        key: key.to_string(),
        size_bytes: size as u64,
        content_type: if options.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            options.content_type
        },
        description: options.description,
        metadata: options.metadata,
        created_at: Utc::now(),
    }
}

/// Store keeping objects in memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    objects: RwLock<HashMap<String, (Vec<u8>, FileInfo)>>,
}

impl MemoryFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, FileInfo), StoreError> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> Result<FileInfo, StoreError> {
        validate_key(key)?;
        let info = file_info(key, data.len(), options);
        self.objects
            .write()
            .await
            .insert(key.to_string(), (data, info.clone()));
        Ok(info)
    }
}

/// Store keeping objects as files under a directory, with a JSON sidecar
/// holding each object's [`FileInfo`].
#[derive(Debug, Clone)]
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn info_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.info.json"))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, FileInfo), StoreError> {
        validate_key(key)?;
        let data = match tokio::fs::read(self.object_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let info = match tokio::fs::read(self.info_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Backend(format!("corrupt metadata for {key}: {e}")))?,
            // Objects dropped into the directory by hand have no sidecar.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileInfo {
                key: key.to_string(),
                size_bytes: data.len() as u64,
                content_type: content_type_for_path(key).to_string(),
                description: String::new(),
                metadata: BTreeMap::new(),
                created_at: Utc::now(),
            },
            Err(e) => return Err(e.into()),
        };
        Ok((data, info))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> Result<FileInfo, StoreError> {
        validate_key(key)?;
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let info = file_info(key, data.len(), options);
        let sidecar = serde_json::to_vec_pretty(&info)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tokio::fs::write(&path, data).await?;
        tokio::fs::write(self.info_path(key), sidecar).await?;
        tracing::debug!(key, path = %path.display(), size = info.size_bytes, "stored file");
        Ok(info)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for_path() {
        assert_eq!(content_type_for_path("out/report.CSV"), "text/csv");
        assert_eq!(content_type_for_path("data.json"), "application/json");
        assert_eq!(content_type_for_path("photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for_path("bundle.tar.gz"), "application/gzip");
        assert_eq!(content_type_for_path("Makefile"), "application/octet-stream");
    }

    #[test]
    fn test_generated_keys() {
        let id = generate_file_id();
        assert!(id.starts_with("f_"));
        assert_eq!(user_file_key(&id), format!("files/{id}"));
        assert_ne!(id, generate_file_id());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("files/f_1").is_ok());
        for bad in ["", "/etc/passwd", "files/../x", "a//b", "./a", "a\\b"] {
            assert!(validate_key(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryFileStore::new();
        let info = store
            .put(
                "files/f_1",
                b"a,b\n1,2\n".to_vec(),
                PutOptions {
                    content_type: "text/csv".into(),
                    ..PutOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 8);

        let (data, info) = store.get("files/f_1").await.unwrap();
        assert_eq!(data, b"a,b\n1,2\n");
        assert_eq!(info.content_type, "text/csv");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryFileStore::new();
        let err = store.get("files/nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(err.to_string(), "file not found: files/nope");
    }

    #[tokio::test]
    async fn test_dir_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirFileStore::new(dir.path());

        let mut metadata = BTreeMap::new();
        metadata.insert("sandbox_id".to_string(), "sbx_1".to_string());
        store
            .put(
                "files/f_2",
                vec![0, 159, 146, 150],
                PutOptions {
                    content_type: "application/octet-stream".into(),
                    description: "blob.bin".into(),
                    metadata,
                },
            )
            .await
            .unwrap();

        assert!(dir.path().join("files/f_2").exists());
        let (data, info) = store.get("files/f_2").await.unwrap();
        assert_eq!(data, vec![0, 159, 146, 150]);
        assert_eq!(info.description, "blob.bin");
        assert_eq!(info.metadata["sandbox_id"], "sbx_1");
    }

    #[tokio::test]
    async fn test_dir_store_without_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let store = DirFileStore::new(dir.path());

        let (data, info) = store.get("notes.txt").await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(info.content_type, "text/plain");
        assert_eq!(info.size_bytes, 5);

        assert!(matches!(
            store.get("missing.txt").await,
            Err(StoreError::NotFound(_))
        ));
    }
}

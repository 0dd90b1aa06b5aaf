//! Object storage: the document bytes and derived page images.

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Bucket/key addressed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError>;
}

/// [`ObjectStore`] on the local filesystem: `root/bucket/key`.
///
/// Metadata is kept beside the data under `root/.metadata/bucket/key.json`.
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written object.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(safe_segment(bucket, bucket)?).join(safe_relative(key)?))
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let mut p = self
            .root
            .join(".metadata")
            .join(safe_segment(bucket, bucket)?)
            .join(safe_relative(key)?)
            .into_os_string();
        p.push(".json");
        Ok(PathBuf::from(p))
    }
}

fn invalid(key: &str, reason: &str) -> StorageError {
    StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn safe_segment<'a>(segment: &'a str, key: &str) -> Result<&'a str, StorageError> {
    if segment.is_empty()
        || segment.contains('/')
        || segment.contains('\\')
        || segment.starts_with('.')
    {
        return Err(invalid(key, "bucket must be a single plain path segment"));
    }
    Ok(segment)
}

/// A relative path with only normal components.
fn safe_relative(key: &str) -> Result<PathBuf, StorageError> {
    let path = Path::new(key);
    if key.is_empty() {
        return Err(invalid(key, "empty key"));
    }
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(invalid(key, "key must be relative without '.' or '..' segments"));
    }
    Ok(path.to_path_buf())
}

fn io_error(operation: &str, location: String, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound { location },
        _ => StorageError::Io {
            operation: operation.to_string(),
            detail: format!("{location}: {e}"),
        },
    }
}

async fn write_atomically(path: &Path, bytes: &[u8], operation: &str) -> Result<(), StorageError> {
    let location = path.display().to_string();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(operation, location.clone(), e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| io_error(operation, location.clone(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(operation, location, e))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error("get_object", format!("s3://{bucket}/{key}"), e))?;
        debug!("get_object s3://{}/{} → {} bytes", bucket, key, bytes.len());
        Ok(bytes)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        write_atomically(&path, &bytes, "put_object").await?;
        if !metadata.is_empty() {
            let meta = serde_json::to_vec_pretty(metadata)?;
            write_atomically(&self.metadata_path(bucket, key)?, &meta, "put_object").await?;
        }
        debug!("put_object s3://{}/{} ({} bytes)", bucket, key, bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let meta = BTreeMap::from([("page_number".to_string(), "1".to_string())]);
        store
            .put_object("trade-docs", "inbox/a_page_001.png", vec![1, 2, 3], &meta)
            .await
            .unwrap();
        assert_eq!(
            store.get_object("trade-docs", "inbox/a_page_001.png").await.unwrap(),
            vec![1, 2, 3]
        );
        assert!(dir
            .path()
            .join(".metadata/trade-docs/inbox/a_page_001.png.json")
            .exists());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get_object("b", "nope.png").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for (bucket, key) in [
            ("b", "../escape.txt"),
            ("b", "/abs.txt"),
            ("..", "k.txt"),
            ("a/b", "k.txt"),
        ] {
            let err = store.get_object(bucket, key).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{bucket}/{key}");
        }
    }
}

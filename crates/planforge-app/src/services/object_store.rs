//! Keyed blob persistence for report artifacts, serialized retrieval
//! indices, and fingerprint markers.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::paths::AppPaths;

/// Errors emitted by object storage operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        ObjectStoreError::Io(e.to_string())
    }
}

/// Trait abstracting over object storage backends. Uploads overwrite any
/// existing object under the same key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;

    /// Return the object's bytes or `ObjectStoreError::NotFound`.
    async fn download(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Reject empty keys, absolute paths, and traversal segments before any
/// filesystem access.
pub fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Object key for the corpus artifact gathered while preparing a paid report.
#[must_use]
pub fn corpus_artifact_key(user_id: &str, idea_id: &str) -> String {
    format!("user_cache/{user_id}/{user_id}-{idea_id}.json")
}

/// Object key for the persisted content of one generated report.
#[must_use]
pub fn report_artifact_key(user_id: &str, report_id: &str) -> String {
    format!("user_cache/{user_id}/{user_id}-{report_id}.json")
}

/// Object key of the fingerprint marker validating the serialized index
/// derived from `artifact_key`.
#[must_use]
pub fn fingerprint_marker_key(user_id: &str, artifact_key: &str) -> String {
    format!("user_cache/{user_id}/{}_data_hash.txt", artifact_base(artifact_key))
}

/// Object key of the serialized retrieval index derived from `artifact_key`.
#[must_use]
pub fn index_blob_key(user_id: &str, artifact_key: &str) -> String {
    format!(
        "user_cache/{user_id}/retrieval_index_{}.bin",
        artifact_base(artifact_key)
    )
}

fn artifact_base(artifact_key: &str) -> &str {
    let name = artifact_key.rsplit('/').next().unwrap_or(artifact_key);
    name.strip_suffix(".json").unwrap_or(name)
}

/// Filesystem object store rooted under the application's objects directory.
///
/// Writes go to a temp file first and are finalized with an atomic
/// rename-over, so readers never observe a partially written object.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsObjectStore {
    paths: AppPaths,
}

impl FsObjectStore {
    fn object_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        let root = self
            .paths
            .objects_dir()
            .map_err(|e| ObjectStoreError::Io(e.to_string()))?;
        Ok(root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ObjectStoreError::Io(format!("stat object: {e}"))),
        }
    }

    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let final_path = self.object_path(key)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("create parent dir: {e}")))?;

        let temp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| ObjectStoreError::Io(format!("create temp file: {e}")))?;
        let mut file = fs::File::from_std(
            temp.reopen()
                .map_err(|e| ObjectStoreError::Io(format!("reopen temp file: {e}")))?,
        );
        file.write_all(bytes)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("write object: {e}")))?;
        file.flush()
            .await
            .map_err(|e| ObjectStoreError::Io(format!("flush object: {e}")))?;
        drop(file);

        tokio::task::spawn_blocking(move || temp.persist(&final_path).map(|_| ()))
            .await
            .map_err(|e| ObjectStoreError::Io(format!("persist task failed: {e}")))?
            .map_err(|e| ObjectStoreError::Io(format!("persist object: {e}")))?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(ObjectStoreError::Io(format!("read object: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> FsObjectStore {
        let paths = AppPaths::new(temp.path()).expect("app paths");
        FsObjectStore::builder().paths(paths).build()
    }

    #[tokio::test]
    async fn upload_download_exists_roundtrip() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let key = "user_cache/u1/u1-idea.json";

        assert!(!store.exists(key).await.expect("exists"));
        store.upload(key, b"{\"a\":1}").await.expect("upload");
        assert!(store.exists(key).await.expect("exists"));
        let bytes = store.download(key).await.expect("download");
        assert_eq!(bytes, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn upload_overwrites_existing_object() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);
        let key = "user_cache/u1/report.json";

        store.upload(key, b"first").await.expect("upload");
        store.upload(key, b"second").await.expect("overwrite");
        let bytes = store.download(key).await.expect("download");
        assert_eq!(bytes, b"second");
    }

    #[tokio::test]
    async fn missing_object_is_a_typed_not_found() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        let err = store
            .download("user_cache/u1/absent.json")
            .await
            .expect_err("missing object");
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        for bad in ["", "/abs", "a//b", "../escape", "a/./b"] {
            let err = store.download(bad).await.expect_err("invalid key");
            assert!(matches!(err, ObjectStoreError::InvalidKey(_)), "key {bad:?}");
        }
    }

    #[test]
    fn artifact_keys_are_deterministic() {
        let corpus = corpus_artifact_key("u1", "idea7");
        assert_eq!(corpus, "user_cache/u1/u1-idea7.json");
        assert_eq!(
            fingerprint_marker_key("u1", &corpus),
            "user_cache/u1/u1-idea7_data_hash.txt"
        );
        assert_eq!(
            index_blob_key("u1", &corpus),
            "user_cache/u1/retrieval_index_u1-idea7.bin"
        );
        assert_eq!(
            report_artifact_key("u1", "r9"),
            "user_cache/u1/u1-r9.json"
        );
    }
}

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::R2Settings;
use crate::models::job::ImageFormat;

/// The two key namespaces of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Originals,
    Processed,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::Originals => "originals",
            Namespace::Processed => "processed",
        }
    }
}

/// Storage key `<namespace>/<id>.<ext>`.
pub fn object_key(namespace: Namespace, id: &str, format: ImageFormat) -> String {
    format!("{}/{}.{}", namespace.prefix(), id, format.extension())
}

/// Raw key/value byte storage underneath the image store.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Fetch an object; a missing key is `StorageError::NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete an object. Returns whether it existed; a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Originals and processed outputs, keyed by image id and format.
#[derive(Clone)]
pub struct ImageStore {
    backend: Arc<dyn BlobBackend>,
}

impl ImageStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self { backend }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalBackend::new(root)))
    }

    pub async fn put_original(
        &self,
        id: &str,
        format: ImageFormat,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.put(Namespace::Originals, id, format, data).await
    }

    pub async fn put_processed(
        &self,
        id: &str,
        format: ImageFormat,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.put(Namespace::Processed, id, format, data).await
    }

    pub async fn get_original(&self, id: &str, format: ImageFormat) -> Result<Vec<u8>, StorageError> {
        self.backend
            .get(&object_key(Namespace::Originals, id, format))
            .await
    }

    pub async fn get_processed(&self, id: &str, format: ImageFormat) -> Result<Vec<u8>, StorageError> {
        self.backend
            .get(&object_key(Namespace::Processed, id, format))
            .await
    }

    pub async fn exists(
        &self,
        namespace: Namespace,
        id: &str,
        format: ImageFormat,
    ) -> Result<bool, StorageError> {
        self.backend.exists(&object_key(namespace, id, format)).await
    }

    /// Delete one namespace's file. Missing files are fine.
    pub async fn delete_in(
        &self,
        namespace: Namespace,
        id: &str,
        format: ImageFormat,
    ) -> Result<bool, StorageError> {
        self.backend.delete(&object_key(namespace, id, format)).await
    }

    /// Delete both files of an image. Both deletions are attempted; the first
    /// error, if any, is returned afterwards.
    pub async fn delete(&self, id: &str, format: ImageFormat) -> Result<(), StorageError> {
        let processed = self.delete_in(Namespace::Processed, id, format).await;
        let original = self.delete_in(Namespace::Originals, id, format).await;
        processed.and(original).map(|_| ())
    }

    async fn put(
        &self,
        namespace: Namespace,
        id: &str,
        format: ImageFormat,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.backend
            .put(&object_key(namespace, id, format), data, format.mime_type())
            .await
    }
}

/// Flat directories under a root on the local filesystem.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobBackend for LocalBackend {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never observe a half-written file.
        let tmp = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Backend {
    bucket: Box<Bucket>,
}

impl R2Backend {
    pub fn new(settings: &R2Settings) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: settings.endpoint.clone(),
        };

        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

fn is_not_found(error: &S3Error) -> bool {
    matches!(error, S3Error::HttpFailWithBody(404, _))
}

#[async_trait]
impl BlobBackend for R2Backend {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        match response.status_code() {
            200..=299 => Ok(()),
            code => Err(StorageError::Status { key: key.to_string(), code }),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = match self.bucket.get_object(key).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound(key.to_string())),
            code => Err(StorageError::Status { key: key.to_string(), code }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        // S3 deletes are idempotent and do not report whether the key existed.
        let existed = self.exists(key).await?;
        match self.bucket.delete_object(key).await {
            Ok(_) => Ok(existed),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, 200..=299)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, code)) => Err(StorageError::Status { key: key.to_string(), code }),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("S3 returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key(Namespace::Originals, "abc", ImageFormat::Jpeg),
            "originals/abc.jpg"
        );
        assert_eq!(
            object_key(Namespace::Processed, "abc", ImageFormat::Png),
            "processed/abc.png"
        );
    }

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::local(dir.path());

        store.put_original("abc", ImageFormat::Png, b"png bytes").await.unwrap();
        assert!(dir.path().join("originals/abc.png").exists());
        assert_eq!(
            store.get_original("abc", ImageFormat::Png).await.unwrap(),
            b"png bytes"
        );

        let missing = store.get_processed("abc", ImageFormat::Png).await.unwrap_err();
        assert!(missing.is_not_found());

        store.delete("abc", ImageFormat::Png).await.unwrap();
        assert!(!dir.path().join("originals/abc.png").exists());
        // Deleting again is still fine.
        store.delete("abc", ImageFormat::Png).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_put_overwrites_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::local(dir.path());

        store.put_processed("abc", ImageFormat::Jpeg, b"first").await.unwrap();
        store.put_processed("abc", ImageFormat::Jpeg, b"second").await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("processed"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            store.get_processed("abc", ImageFormat::Jpeg).await.unwrap(),
            b"second"
        );
    }

    #[test]
    fn test_local_rejects_traversal() {
        let backend = LocalBackend::new("/tmp/store");
        assert!(backend.path_for("originals/../secret").is_err());
        assert!(backend.path_for("originals//x.png").is_err());
        assert!(backend.path_for("originals/x.png").is_ok());
    }
}

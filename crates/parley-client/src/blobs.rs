//! Local blob storage for image payloads awaiting upload.
//!
//! Image bytes are written here at enqueue time and released once the image
//! message is delivered, cancelled or discarded.  Queue entries only carry the
//! returned reference.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(Uuid),

    #[error("Blob too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Empty blob")]
    Empty,

    #[error("Blob storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-local blob repository.
#[async_trait]
pub trait LocalBlobStore: Send + Sync + 'static {
    async fn save(&self, bytes: Bytes) -> Result<Uuid, BlobError>;

    async fn load(&self, local_ref: Uuid) -> Result<Bytes, BlobError>;

    /// Deleting a blob that is already gone is not an error.
    async fn delete(&self, local_ref: Uuid) -> Result<(), BlobError>;
}

/// One file per blob, named by its UUID, under a single directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FsBlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, BlobError> {
        fs::create_dir_all(&base_path).await?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Every blob currently on disk.
    pub async fn list(&self) -> Result<Vec<Uuid>, BlobError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    fn blob_path(&self, id: &Uuid) -> PathBuf {
        self.base_path.join(id.to_string())
    }
}

#[async_trait]
impl LocalBlobStore for FsBlobStore {
    async fn save(&self, bytes: Bytes) -> Result<Uuid, BlobError> {
        if bytes.is_empty() {
            return Err(BlobError::Empty);
        }
        if bytes.len() > self.max_size {
            return Err(BlobError::TooLarge {
                size: bytes.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let path = self.blob_path(&id);

        // A reference is only ever handed out for a fully written file.
        let tmp = self.base_path.join(format!(".{id}.part"));
        fs::write(&tmp, &bytes).await?;
        let file = fs::File::open(&tmp).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &path).await?;

        debug!(id = %id, size = bytes.len(), "Stored blob");
        Ok(id)
    }

    async fn load(&self, local_ref: Uuid) -> Result<Bytes, BlobError> {
        let path = self.blob_path(&local_ref);

        match fs::read(&path).await {
            Ok(data) => {
                debug!(id = %local_ref, size = data.len(), "Loaded blob");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(local_ref))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn delete(&self, local_ref: Uuid) -> Result<(), BlobError> {
        let path = self.blob_path(&local_ref);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id = %local_ref, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FsBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _dir) = test_store().await;
        let data = Bytes::from_static(b"jpeg-bytes");

        let id = store.save(data.clone()).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _dir) = test_store().await;
        let id = store.save(Bytes::from_static(b"delete-me")).await.unwrap();

        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(matches!(store.load(id).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_ignores_partial_writes() {
        let (store, dir) = test_store().await;
        let id = store.save(Bytes::from_static(b"blob")).await.unwrap();
        std::fs::write(dir.path().join(".leftover.part"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_size_limits() {
        let (store, _dir) = test_store().await;
        assert!(matches!(store.save(Bytes::new()).await, Err(BlobError::Empty)));
        assert!(matches!(
            store.save(Bytes::from(vec![0u8; 2048])).await,
            Err(BlobError::TooLarge { size: 2048, max: 1024 })
        ));
    }
}

//! Blob storage for uploaded images.
//!
//! Blobs are written chunk by chunk into a `.part` file and renamed into
//! place by [`BlobStore::finalize`]. A download address exists only for
//! finalized blobs, so a partially transferred or aborted upload never has
//! one.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

const PART_SUFFIX: &str = ".part";

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` at `offset` of the pending blob `key`. Offsets must be
    /// contiguous: a chunk may start anywhere up to the bytes already held,
    /// which lets an interrupted transfer resume from its last offset.
    async fn write_chunk(&self, key: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Bytes already held for the pending blob `key`.
    async fn pending_len(&self, key: &str) -> Result<u64>;

    /// Seal the pending blob and return its download address.
    async fn finalize(&self, key: &str) -> Result<String>;

    /// Discard the pending blob, if any.
    async fn abort(&self, key: &str) -> Result<()>;

    /// Download address of a finalized blob.
    async fn download_address(&self, key: &str) -> Result<String>;
}

/// Reject keys that could escape the base directory.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.ends_with(PART_SUFFIX)
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(StoreError::InvalidKey(target.display().to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(base) {
        return Err(StoreError::InvalidKey(target.display().to_string()));
    }
    Ok(resolved)
}

/// [`BlobStore`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
    max_size: u64,
}

impl FsBlobStore {
    pub async fn new(base_path: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            StoreError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;
        let base_path = base_path.canonicalize()?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Read a finalized blob back.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::BlobNotFound(key.to_string()));
        }
        Ok(fs::read(&path).await?)
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        ensure_within(&self.base_path, &self.base_path.join(key))
    }

    fn part_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        ensure_within(
            &self.base_path,
            &self.base_path.join(format!("{key}{PART_SUFFIX}")),
        )
    }

    fn address_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write_chunk(&self, key: &str, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.max_size {
            return Err(StoreError::BlobTooLarge {
                size: end,
                max: self.max_size,
            });
        }

        let path = self.part_path(key)?;
        let held = self.pending_len(key).await?;
        if offset > held {
            return Err(StoreError::BlobStorage(format!(
                "non-contiguous write to {key}: offset {offset}, held {held}"
            )));
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| StoreError::BlobStorage(format!("Failed to open {key}: {e}")))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::BlobStorage(format!("Failed to write {key}: {e}")))?;
        file.flush().await?;

        debug!(key, offset, len = data.len(), "Wrote blob chunk");
        Ok(())
    }

    async fn pending_len(&self, key: &str) -> Result<u64> {
        let path = self.part_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize(&self, key: &str) -> Result<String> {
        let part = self.part_path(key)?;
        let path = self.blob_path(key)?;

        if !fs::try_exists(&part).await? {
            // Zero-length sources never write a chunk.
            fs::File::create(&part).await?;
        }
        fs::rename(&part, &path)
            .await
            .map_err(|e| StoreError::BlobStorage(format!("Failed to seal {key}: {e}")))?;

        info!(key, "Blob finalized");
        Ok(Self::address_for(&path))
    }

    async fn abort(&self, key: &str) -> Result<()> {
        let part = self.part_path(key)?;
        match fs::remove_file(&part).await {
            Ok(()) => {
                debug!(key, "Discarded pending blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn download_address(&self, key: &str) -> Result<String> {
        let path = self.blob_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::BlobNotFound(key.to_string()));
        }
        Ok(Self::address_for(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FsBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_chunked_write_and_finalize() {
        let (store, _dir) = test_store().await;

        store.write_chunk("a.jpg", 0, b"hello ").await.unwrap();
        store.write_chunk("a.jpg", 6, b"world").await.unwrap();
        assert_eq!(store.pending_len("a.jpg").await.unwrap(), 11);
        assert!(store.download_address("a.jpg").await.is_err());

        let address = store.finalize("a.jpg").await.unwrap();
        assert!(address.starts_with("file://"));
        assert!(address.ends_with("a.jpg"));
        assert_eq!(store.download_address("a.jpg").await.unwrap(), address);
        assert_eq!(store.read("a.jpg").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_resume_rewrites_from_offset() {
        let (store, _dir) = test_store().await;
        store.write_chunk("b", 0, b"abcd").await.unwrap();
        store.write_chunk("b", 2, b"CDEF").await.unwrap();
        store.finalize("b").await.unwrap();
        assert_eq!(store.read("b").await.unwrap(), b"abCDEF");
    }

    #[tokio::test]
    async fn test_gap_rejected() {
        let (store, _dir) = test_store().await;
        assert!(store.write_chunk("c", 4, b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_abort_discards_pending() {
        let (store, _dir) = test_store().await;
        store.write_chunk("d", 0, b"xyz").await.unwrap();
        store.abort("d").await.unwrap();
        assert_eq!(store.pending_len("d").await.unwrap(), 0);
        store.abort("d").await.unwrap();
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let (store, _dir) = test_store().await;
        let data = vec![0u8; 1025];
        assert!(matches!(
            store.write_chunk("e", 0, &data).await,
            Err(StoreError::BlobTooLarge { size: 1025, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (store, _dir) = test_store().await;
        assert!(store.write_chunk("../escape", 0, b"x").await.is_err());
        assert!(store.write_chunk("sub/dir", 0, b"x").await.is_err());
        assert!(store.download_address("").await.is_err());
    }
}

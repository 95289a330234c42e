//! Content-addressed blob storage.
//!
//! Each blob is one file named by the sha256 hex digest of its bytes.
//! Writes go to a temp file and are renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::StoreError;
use crate::models::content_hash;

const TEMP_SUFFIX: &str = ".tmp";

/// Blob storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Creates the store, creating its directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rejects anything that is not a lowercase sha256 hex digest, so a key
    /// can never escape the blob directory.
    pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
        let valid = key.len() == 64
            && key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(StoreError::InvalidBlobKey(key.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        Self::validate_key(key).is_ok() && tokio::fs::metadata(self.blob_path(key)).await.is_ok()
    }

    /// Stores `bytes` under `key`.
    ///
    /// The content must hash to `key`. Returns `false` if the blob was
    /// already present.
    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<bool, StoreError> {
        Self::validate_key(key)?;
        if content_hash(bytes) != key {
            return Err(StoreError::HashMismatch(key.to_string()));
        }

        let path = self.blob_path(key);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(false);
        }

        let temp_path = self
            .dir
            .join(format!("{}.{}{}", key, uuid::Uuid::new_v4(), TEMP_SUFFIX));
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::io(path, e));
        }

        Ok(true)
    }

    /// Hashes and stores `bytes`, returning the key.
    pub async fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let key = content_hash(bytes);
        self.write(&key, bytes).await?;
        Ok(key)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        Self::validate_key(key)?;
        let path = self.blob_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Reads a blob that may still be arriving from a peer.
    ///
    /// Metadata rows can reference blobs that have not landed yet; a missing
    /// blob is retried `attempts` times, `delay` apart.
    pub async fn read_with_retry(
        &self,
        key: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Vec<u8>, StoreError> {
        let mut remaining = attempts.max(1);
        loop {
            match self.read(key).await {
                Err(StoreError::BlobNotFound(_)) if remaining > 1 => {
                    remaining -= 1;
                    tracing::debug!("Blob {} not present yet, retrying", key);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Keys of every stored blob, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if Self::validate_key(name).is_ok() {
                    keys.push(name.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (BlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().join("blobs")).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_read_list() {
        let (store, _temp) = test_store();

        let key = store.put(b"pixels").await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), b"pixels");
        assert!(store.contains(&key).await);
        assert_eq!(store.list().await.unwrap(), vec![key.clone()]);

        // Second write of the same content is a no-op.
        assert!(!store.write(&key, b"pixels").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_rejects_mismatched_content() {
        let (store, _temp) = test_store();
        let key = content_hash(b"one");

        let result = store.write(&key, b"two").await;
        assert!(matches!(result, Err(StoreError::HashMismatch(_))));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (store, _temp) = test_store();
        assert!(matches!(
            store.read("../metadata.db").await,
            Err(StoreError::InvalidBlobKey(_))
        ));
    }

    #[tokio::test]
    async fn test_read_with_retry_sees_late_blob() {
        let (store, _temp) = test_store();
        let key = content_hash(b"late");

        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.put(b"late").await.unwrap();
        });

        let bytes = store
            .read_with_retry(&key, 50, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(bytes, b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_with_retry_gives_up() {
        let (store, _temp) = test_store();
        let key = content_hash(b"never");
        let result = store
            .read_with_retry(&key, 2, Duration::from_millis(1))
            .await;
        assert!(matches!(result, Err(StoreError::BlobNotFound(_))));
    }
}

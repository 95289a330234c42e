//! The local dataset of a node: metadata database, blobs and device identity.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use super::{BlobStore, MetadataStore, StoreError};
use crate::models::{content_hash, Device, DeviceCode, Image};

const METADATA_FILE: &str = "metadata.db";
const BLOB_DIR: &str = "blobs";
const INCOMING_DIR: &str = "incoming";
const BACKUP_DIR: &str = "backups";

/// Owns the stores of one node.
///
/// The metadata store sits behind a single async mutex: uploads, merges and
/// snapshot exports all take it, so only one write sequence runs at a time.
#[derive(Debug)]
pub struct Library {
    data_dir: PathBuf,
    metadata: Mutex<MetadataStore>,
    blobs: BlobStore,
    device: Device,
}

impl Library {
    /// Opens (or creates) the library in `data_dir`.
    ///
    /// Registers a new current device on first use.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        for dir in [INCOMING_DIR, BACKUP_DIR] {
            let path = data_dir.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
        }

        let metadata = MetadataStore::open_or_create(data_dir.join(METADATA_FILE)).await?;
        let blobs = BlobStore::new(data_dir.join(BLOB_DIR))?;

        let device = match metadata.current_device().await? {
            Some(device) => device,
            None => {
                let device = metadata.insert_device(&Device::generate()).await?;
                tracing::info!(
                    "Registered new device {} (code {})",
                    device.device_id,
                    device.device_code
                );
                device
            }
        };

        Ok(Self {
            data_dir,
            metadata: Mutex::new(metadata),
            blobs,
            device,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_code(&self) -> DeviceCode {
        self.device.code()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Directory where snapshots received from peers are staged.
    pub fn incoming_dir(&self) -> PathBuf {
        self.data_dir.join(INCOMING_DIR)
    }

    /// Directory holding pre-merge backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUP_DIR)
    }

    /// Takes exclusive access to the metadata store.
    pub async fn lock(&self) -> MutexGuard<'_, MetadataStore> {
        self.metadata.lock().await
    }

    pub async fn images(&self) -> Result<Vec<Image>, StoreError> {
        self.lock().await.images().await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, StoreError> {
        self.lock().await.devices().await
    }

    /// Bytes of the metadata database, ready to send to a peer.
    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, StoreError> {
        self.lock().await.snapshot_bytes().await
    }

    /// Stores a new image owned by this device.
    ///
    /// Callers should go through [`super::UploadQueue`] so uploads are ordered.
    pub async fn import_image(
        &self,
        bytes: &[u8],
        description: &str,
    ) -> Result<Image, StoreError> {
        let hash = content_hash(bytes);
        self.blobs.write(&hash, bytes).await?;

        let image = Image::new(
            self.device.device_id.clone(),
            Utc::now().timestamp(),
            hash,
            description,
        );

        let store = self.lock().await;
        let image = store.insert_image(&image).await?;
        store.flush().await?;
        Ok(image)
    }

    /// Removes an image row; the blob is kept.
    pub async fn delete_image(&self, id: i64) -> Result<bool, StoreError> {
        let store = self.lock().await;
        let deleted = store.delete_image(id).await?;
        store.flush().await?;
        Ok(deleted)
    }

    /// Loads the bytes behind an image row, waiting briefly for blobs still in flight.
    pub async fn image_bytes(&self, image: &Image) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read_with_retry(&image.blob_key, 5, Duration::from_millis(200))
            .await
    }
}

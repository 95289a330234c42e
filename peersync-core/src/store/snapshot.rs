//! In-memory copy of a metadata database file.

use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;

use super::metadata::{connect, ensure_tables};
use super::StoreError;
use crate::models::{Device, Image};

/// The `devices` and `images` tables of one database file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub images: Vec<Image>,
}

impl Snapshot {
    /// Reads both tables from a database file without modifying it.
    ///
    /// A table that does not exist is read as empty.
    pub async fn read(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "snapshot file missing"),
            ));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let result = Self::read_tables(&pool).await;
        pool.close().await;
        result
    }

    async fn read_tables(pool: &SqlitePool) -> Result<Self, StoreError> {
        let mut snapshot = Snapshot::default();

        if table_exists(pool, "devices").await? {
            snapshot.devices = sqlx::query_as::<_, Device>(
                "SELECT id, device_id, device_code, created_at, is_current FROM devices ORDER BY id",
            )
            .fetch_all(pool)
            .await?;
        }

        if table_exists(pool, "images").await? {
            snapshot.images = sqlx::query_as::<_, Image>(
                "SELECT id, device_id, created_at, hash, blob_key, description FROM images \
                 ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(pool)
            .await?;
        }

        Ok(snapshot)
    }

    /// Writes the snapshot as a fresh database file at `path`, keeping row ids.
    pub async fn write(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(path, e)),
        }

        let pool = connect(path, true).await?;
        let result = self.write_tables(&pool).await;
        pool.close().await;
        result
    }

    async fn write_tables(&self, pool: &SqlitePool) -> Result<(), StoreError> {
        ensure_tables(pool).await?;
        let mut tx = pool.begin().await?;

        for device in &self.devices {
            sqlx::query(
                "INSERT INTO devices (id, device_id, device_code, created_at, is_current) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(device.id)
            .bind(&device.device_id)
            .bind(&device.device_code)
            .bind(device.created_at)
            .bind(device.is_current)
            .execute(&mut *tx)
            .await?;
        }

        for image in &self.images {
            sqlx::query(
                "INSERT INTO images (id, device_id, created_at, hash, blob_key, description) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(image.id)
            .bind(&image.device_id)
            .bind(image.created_at)
            .bind(&image.hash)
            .bind(&image.blob_key)
            .bind(&image.description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool, StoreError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_keeps_ids() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snap.db");

        let mut image = Image::new("dev", 5, "h1", "sunset");
        image.id = 42;
        let snapshot = Snapshot {
            devices: vec![],
            images: vec![image.clone()],
        };
        snapshot.write(&path).await.unwrap();

        let loaded = Snapshot::read(&path).await.unwrap();
        assert_eq!(loaded.images, vec![image]);
        assert!(loaded.devices.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tables_read_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bare.db");

        let pool = connect(&path, true).await.unwrap();
        sqlx::query("CREATE TABLE unrelated (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let snapshot = Snapshot::read(&path).await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[tokio::test]
    async fn test_garbage_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42; 4096]).unwrap();

        assert!(Snapshot::read(&path).await.is_err());
    }
}

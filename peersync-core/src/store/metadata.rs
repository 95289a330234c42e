//! SQLite-backed record store holding the `devices` and `images` tables.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::models::{Device, Image};

pub(crate) const DEVICES_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL UNIQUE,
        device_code TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        is_current INTEGER NOT NULL DEFAULT 0
    )
"#;

pub(crate) const IMAGES_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS images (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        hash TEXT NOT NULL,
        blob_key TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT ''
    )
"#;

/// Opens a pool on a SQLite file.
///
/// Journal mode is DELETE so the database is always a single self-contained
/// file that can be shipped to a peer as-is.
pub(crate) async fn connect(path: &Path, create: bool) -> Result<SqlitePool, StoreError> {
    if create {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub(crate) async fn ensure_tables(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(DEVICES_SCHEMA).execute(pool).await?;
    sqlx::query(IMAGES_SCHEMA).execute(pool).await?;
    Ok(())
}

/// The canonical metadata database of this node.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl MetadataStore {
    /// Opens the database at `path`, creating it and its tables if needed.
    pub async fn open_or_create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let pool = connect(&path, true).await?;
        let store = Self { path, pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_tables(&self) -> Result<(), StoreError> {
        ensure_tables(&self.pool).await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query_as::<_, Device>(
            "SELECT id, device_id, device_code, created_at, is_current FROM devices ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All images, newest first.
    pub async fn images(&self) -> Result<Vec<Image>, StoreError> {
        let rows = sqlx::query_as::<_, Image>(
            "SELECT id, device_id, created_at, hash, blob_key, description FROM images \
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn current_device(&self) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, Device>(
            "SELECT id, device_id, device_code, created_at, is_current FROM devices \
             WHERE is_current = 1 LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Inserts a device and returns it with its assigned local id.
    ///
    /// Inserting a current device clears the flag on every other row.
    pub async fn insert_device(&self, device: &Device) -> Result<Device, StoreError> {
        let mut tx = self.pool.begin().await?;

        if device.is_current {
            sqlx::query("UPDATE devices SET is_current = 0 WHERE is_current = 1")
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query(
            "INSERT INTO devices (device_id, device_code, created_at, is_current) VALUES (?, ?, ?, ?)",
        )
        .bind(&device.device_id)
        .bind(&device.device_code)
        .bind(device.created_at)
        .bind(device.is_current)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Device {
            id: result.last_insert_rowid(),
            ..device.clone()
        })
    }

    /// Inserts an image row and returns it with its assigned local id.
    pub async fn insert_image(&self, image: &Image) -> Result<Image, StoreError> {
        let result = sqlx::query(
            "INSERT INTO images (device_id, created_at, hash, blob_key, description) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&image.device_id)
        .bind(image.created_at)
        .bind(&image.hash)
        .bind(&image.blob_key)
        .bind(&image.description)
        .execute(&self.pool)
        .await?;

        Ok(Image {
            id: result.last_insert_rowid(),
            ..image.clone()
        })
    }

    /// Deletes an image row. The blob is left in place.
    ///
    /// Returns `false` if no row had that id.
    pub async fn delete_image(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Makes sure every committed write is in the main database file.
    pub async fn flush(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes a consistent copy of the database to `dest`.
    pub async fn export_snapshot(&self, dest: &Path) -> Result<(), StoreError> {
        self.flush().await?;

        match tokio::fs::remove_file(dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(dest, e)),
        }

        let target = dest.to_string_lossy().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{}'", target))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns the bytes of a consistent copy of the database.
    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let temp_path = self
            .path
            .with_extension(format!("export-{}.db", uuid::Uuid::new_v4()));
        self.export_snapshot(&temp_path).await?;

        let bytes = tokio::fs::read(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e));
        let _ = tokio::fs::remove_file(&temp_path).await;
        bytes
    }

    /// Swaps `replacement` in as the canonical database file.
    ///
    /// The pool is closed for the rename and reopened afterwards. If the
    /// rename fails the previous file stays in place and is reopened.
    pub(crate) async fn replace_with(&mut self, replacement: &Path) -> Result<(), StoreError> {
        // The current file may be the unreadable one being replaced.
        if let Err(e) = self.flush().await {
            tracing::warn!("Flush before replacing {} failed: {}", self.path.display(), e);
        }
        self.pool.close().await;

        let renamed = tokio::fs::rename(replacement, &self.path)
            .await
            .map_err(|e| StoreError::io(replacement, e));

        self.pool = connect(&self.path, true).await?;
        renamed?;
        self.ensure_tables().await
    }

    /// Closes the pool and reopens it, e.g. after the file was restored externally.
    pub(crate) async fn reopen(&mut self) -> Result<(), StoreError> {
        self.pool.close().await;
        self.pool = connect(&self.path, true).await?;
        self.ensure_tables().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

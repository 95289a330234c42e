//! Merge of two metadata snapshots.
//!
//! Images are identified across stores by `(hash, created_at)` and devices by
//! `device_id`. Rows already known locally are kept untouched; unknown
//! incoming rows are appended with fresh local ids continuing from the local
//! maximum. Incoming images whose hash is not a valid blob key are skipped.
//! Nothing is ever deleted by a merge.

use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{Device, Image};
use crate::store::{BlobStore, Library, Snapshot, StoreError};

/// Counters reported by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub images_added: usize,
    pub devices_added: usize,
    pub duplicates_skipped: usize,
    /// Incoming rows dropped because their hash is not a valid blob key.
    pub invalid_skipped: usize,
}

/// Result of applying a merge to a library.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub stats: MergeStats,
    /// Copy of the database taken before the merge.
    pub backup: PathBuf,
    /// The local database was unreadable and was rebuilt from the incoming one.
    pub replaced_local: bool,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Snapshot {path} is unreadable: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Produces the union of `local` and `incoming`.
pub fn merge(local: &Snapshot, incoming: &Snapshot) -> (Snapshot, MergeStats) {
    let mut stats = MergeStats::default();

    let mut images = local.images.clone();
    let mut seen: HashSet<(&str, i64)> = local.images.iter().map(Image::dedup_key).collect();
    let mut next_id = images.iter().map(|i| i.id).max().unwrap_or(0);

    let mut candidates: Vec<&Image> = incoming.images.iter().collect();
    candidates.sort_by_key(|i| (i.created_at, i.id));

    for image in candidates {
        if BlobStore::validate_key(&image.hash).is_err() || image.blob_key != image.hash {
            tracing::warn!(
                "Skipping incoming image {} with invalid hash {:?}",
                image.id,
                image.hash
            );
            stats.invalid_skipped += 1;
            continue;
        }
        if !seen.insert(image.dedup_key()) {
            stats.duplicates_skipped += 1;
            continue;
        }
        next_id += 1;
        images.push(Image {
            id: next_id,
            ..image.clone()
        });
        stats.images_added += 1;
    }
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    let mut devices = local.devices.clone();
    let mut known: HashSet<String> = devices.iter().map(|d| d.device_id.clone()).collect();
    let mut next_device_id = devices.iter().map(|d| d.id).max().unwrap_or(0);

    for device in &incoming.devices {
        if !known.insert(device.device_id.clone()) {
            continue;
        }
        next_device_id += 1;
        devices.push(Device {
            id: next_device_id,
            is_current: false,
            ..device.clone()
        });
        stats.devices_added += 1;
    }

    (Snapshot { devices, images }, stats)
}

/// Applies incoming snapshots to a library as one unit.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    backups_kept: usize,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self { backups_kept: 5 }
    }
}

impl MergeEngine {
    pub fn new(backups_kept: usize) -> Self {
        Self {
            backups_kept: backups_kept.max(1),
        }
    }

    /// Merges the database file at `incoming_path` into the library.
    ///
    /// Sequence: back up the canonical file, write the merged result to a
    /// temp file, rename it over the canonical file, remove the incoming file.
    /// A failure after the backup restores the backup. If the incoming file
    /// cannot be read the library is left untouched.
    pub async fn apply(
        &self,
        library: &Library,
        incoming_path: &Path,
    ) -> Result<MergeReport, MergeError> {
        let incoming =
            Snapshot::read(incoming_path)
                .await
                .map_err(|e| MergeError::CorruptSnapshot {
                    path: incoming_path.to_path_buf(),
                    reason: e.to_string(),
                })?;

        let mut store = library.lock().await;
        let canonical = store.path().to_path_buf();

        if let Err(e) = store.flush().await {
            tracing::warn!("Flush before merge failed: {}", e);
        }
        let backup = backup_path(&library.backups_dir());
        tokio::fs::copy(&canonical, &backup)
            .await
            .map_err(|e| StoreError::io(&backup, e))?;

        let (local, replaced_local) = match Snapshot::read(&canonical).await {
            Ok(local) => (local, false),
            Err(e) => {
                tracing::warn!(
                    "Local snapshot unreadable ({}), replacing it with incoming data; backup at {}",
                    e,
                    backup.display()
                );
                let local = Snapshot {
                    devices: vec![library.device().clone()],
                    images: Vec::new(),
                };
                (local, true)
            }
        };

        let (merged, stats) = merge(&local, &incoming);

        let temp_path = canonical.with_extension("merge.tmp");
        if let Err(e) = merged.write(&temp_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = store.replace_with(&temp_path).await {
            tracing::error!("Swapping merged snapshot failed, restoring backup: {}", e);
            let _ = tokio::fs::remove_file(&temp_path).await;
            tokio::fs::copy(&backup, &canonical)
                .await
                .map_err(|e| StoreError::io(&canonical, e))?;
            store.reopen().await?;
            return Err(e.into());
        }
        drop(store);

        if let Err(e) = tokio::fs::remove_file(incoming_path).await {
            tracing::debug!("Could not remove {}: {}", incoming_path.display(), e);
        }
        self.prune_backups(&library.backups_dir()).await;

        tracing::info!(
            "Merged snapshot: {} images added, {} devices added, {} duplicates skipped, {} invalid rows skipped",
            stats.images_added,
            stats.devices_added,
            stats.duplicates_skipped,
            stats.invalid_skipped
        );

        Ok(MergeReport {
            stats,
            backup,
            replaced_local,
        })
    }

    async fn prune_backups(&self, dir: &Path) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut backups = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("metadata-") && name.ends_with(".db") {
                backups.push(entry.path());
            }
        }

        backups.sort();
        let excess = backups.len().saturating_sub(self.backups_kept);
        for path in backups.into_iter().take(excess) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!("Could not prune backup {}: {}", path.display(), e);
            }
        }
    }
}

fn backup_path(dir: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
    dir.join(format!("metadata-{}.db", stamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// An image whose content is the bytes of `name`.
    fn image(id: i64, name: &str, created_at: i64) -> Image {
        Image {
            id,
            ..Image::new("dev", created_at, hash(name), "")
        }
    }

    fn hash(name: &str) -> String {
        crate::models::content_hash(name.as_bytes())
    }

    fn device(id: i64, device_id: &str, is_current: bool) -> Device {
        Device {
            id,
            device_id: device_id.to_string(),
            device_code: crate::models::DeviceCode::derive(device_id).to_string(),
            created_at: 1,
            is_current,
        }
    }

    fn snapshot(images: Vec<Image>) -> Snapshot {
        let mut snapshot = Snapshot {
            devices: Vec::new(),
            images,
        };
        snapshot
            .images
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        snapshot
    }

    #[test]
    fn test_merge_unions_and_counts_duplicates() {
        let local = snapshot(vec![image(1, "h1", 10), image(2, "h2", 20)]);
        let incoming = snapshot(vec![image(1, "h2", 20), image(2, "h3", 30)]);

        let (merged, stats) = merge(&local, &incoming);

        assert_eq!(merged.images.len(), 3);
        assert_eq!(stats.images_added, 1);
        assert_eq!(stats.duplicates_skipped, 1);

        let hashes: Vec<&str> = merged.images.iter().map(|i| i.hash.as_str()).collect();
        assert_eq!(hashes, vec![hash("h3"), hash("h2"), hash("h1")]);

        // New row continues from the local maximum id.
        assert_eq!(merged.images[0].id, 3);
    }

    #[test]
    fn test_same_hash_different_time_is_not_duplicate() {
        let local = snapshot(vec![image(1, "h1", 10)]);
        let incoming = snapshot(vec![image(7, "h1", 11)]);

        let (merged, stats) = merge(&local, &incoming);
        assert_eq!(merged.images.len(), 2);
        assert_eq!(stats.duplicates_skipped, 0);
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let a = snapshot(vec![image(1, "h1", 10), image(2, "h2", 20), image(3, "h3", 5)]);

        let (merged, stats) = merge(&a, &a);
        assert_eq!(merged, a);
        assert_eq!(stats.duplicates_skipped, 3);
        assert_eq!(stats.images_added, 0);
    }

    #[test]
    fn test_merge_size_and_uniqueness() {
        let a = snapshot((1..=6).map(|i| image(i, &format!("a{}", i), i * 10)).collect());
        let mut b_images: Vec<Image> = (1..=4)
            .map(|i| image(i, &format!("b{}", i), i * 10))
            .collect();
        b_images.push(image(5, "a2", 20));
        b_images.push(image(6, "a5", 50));
        let b = snapshot(b_images);

        let (merged, stats) = merge(&a, &b);
        assert_eq!(
            merged.images.len(),
            a.images.len() + b.images.len() - stats.duplicates_skipped
        );

        let keys: HashSet<(String, i64)> = merged
            .images
            .iter()
            .map(|i| (i.hash.clone(), i.created_at))
            .collect();
        assert_eq!(keys.len(), merged.images.len());

        let ids: HashSet<i64> = merged.images.iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), merged.images.len());
    }

    #[test]
    fn test_merge_skips_rows_with_invalid_hash() {
        let local = snapshot(vec![image(1, "h1", 10)]);
        let mut short = image(1, "h2", 20);
        short.hash = "h2".to_string();
        short.blob_key = "h2".to_string();
        let mut mismatched = image(2, "h3", 30);
        mismatched.blob_key = hash("other");
        let mut non_ascii = image(3, "h4", 40);
        non_ascii.hash = "é".repeat(32);
        non_ascii.blob_key = non_ascii.hash.clone();
        let incoming = snapshot(vec![short, mismatched, non_ascii, image(4, "h5", 50)]);

        let (merged, stats) = merge(&local, &incoming);
        assert_eq!(stats.invalid_skipped, 3);
        assert_eq!(stats.images_added, 1);
        assert_eq!(merged.images.len(), 2);
        assert!(merged
            .images
            .iter()
            .all(|i| BlobStore::validate_key(&i.hash).is_ok()));
    }

    #[test]
    fn test_merge_devices_never_imports_current_flag() {
        let local = Snapshot {
            devices: vec![device(1, "me", true)],
            images: vec![],
        };
        let incoming = Snapshot {
            devices: vec![device(1, "peer", true), device(2, "me", false)],
            images: vec![],
        };

        let (merged, stats) = merge(&local, &incoming);
        assert_eq!(stats.devices_added, 1);
        assert_eq!(merged.devices.len(), 2);
        assert_eq!(merged.devices.iter().filter(|d| d.is_current).count(), 1);

        let peer = merged.devices.iter().find(|d| d.device_id == "peer").unwrap();
        assert_eq!(peer.id, 2);
        assert!(!peer.is_current);
    }

    #[tokio::test]
    async fn test_apply_merges_and_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let library = Library::open(temp_dir.path().join("node")).await.unwrap();
        library.import_image(b"one", "first").await.unwrap();

        let incoming_path = library.incoming_dir().join("peer.db");
        let mut remote = image(1, "two", 99);
        remote.device_id = "peer".to_string();
        Snapshot {
            devices: vec![device(1, "peer", true)],
            images: vec![remote],
        }
        .write(&incoming_path)
        .await
        .unwrap();

        let report = MergeEngine::default()
            .apply(&library, &incoming_path)
            .await
            .unwrap();

        assert_eq!(report.stats.images_added, 1);
        assert_eq!(report.stats.devices_added, 1);
        assert!(!report.replaced_local);
        assert!(report.backup.exists());
        assert!(!incoming_path.exists());

        assert_eq!(library.images().await.unwrap().len(), 2);
        let backup = Snapshot::read(&report.backup).await.unwrap();
        assert_eq!(backup.images.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_rejects_corrupt_incoming() {
        let temp_dir = TempDir::new().unwrap();
        let library = Library::open(temp_dir.path()).await.unwrap();
        library.import_image(b"one", "first").await.unwrap();

        let incoming_path = library.incoming_dir().join("bad.db");
        std::fs::write(&incoming_path, b"definitely not sqlite").unwrap();

        let result = MergeEngine::default().apply(&library, &incoming_path).await;
        assert!(matches!(result, Err(MergeError::CorruptSnapshot { .. })));
        assert_eq!(library.images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_replaces_unreadable_local_database() {
        let temp_dir = TempDir::new().unwrap();
        let library = Library::open(temp_dir.path()).await.unwrap();
        library.import_image(b"one", "first").await.unwrap();
        let canonical = library.lock().await.path().to_path_buf();

        let incoming_path = library.incoming_dir().join("peer.db");
        let mut remote = image(1, "two", 99);
        remote.device_id = "peer".to_string();
        Snapshot {
            devices: vec![device(1, "peer", true)],
            images: vec![remote.clone()],
        }
        .write(&incoming_path)
        .await
        .unwrap();

        std::fs::write(&canonical, b"garbage where the database was").unwrap();

        let report = MergeEngine::default()
            .apply(&library, &incoming_path)
            .await
            .unwrap();

        assert!(report.replaced_local);
        assert_eq!(report.stats.images_added, 1);
        assert!(report.backup.exists());

        // The swapped-in database is queryable and keeps this device current.
        let images = library.images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].hash, remote.hash);
        let devices = library.devices().await.unwrap();
        assert!(devices
            .iter()
            .any(|d| d.is_current && d.device_id == library.device().device_id));
        assert!(devices.iter().any(|d| d.device_id == "peer"));
    }

    #[tokio::test]
    async fn test_backups_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let library = Library::open(temp_dir.path()).await.unwrap();
        let engine = MergeEngine::new(2);

        for round in 0..4 {
            let incoming_path = library.incoming_dir().join(format!("round{}.db", round));
            Snapshot {
                devices: vec![],
                images: vec![image(1, &format!("r{}", round), round)],
            }
            .write(&incoming_path)
            .await
            .unwrap();
            engine.apply(&library, &incoming_path).await.unwrap();
        }

        let count = std::fs::read_dir(library.backups_dir()).unwrap().count();
        assert_eq!(count, 2);
        assert_eq!(library.images().await.unwrap().len(), 4);
    }
}

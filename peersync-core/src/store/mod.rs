//! Local persistence: the SQLite metadata store, snapshot files and the
//! content-addressed blob store.
//!
//! # Storage Layout
//!
//! ```text
//! <data_dir>/
//! ├── metadata.db                 # devices + images tables
//! ├── blobs/<sha256>              # image bytes, keyed by content hash
//! ├── incoming/<peer>-<uuid>.db   # snapshots received from peers, awaiting merge
//! └── backups/metadata-<ts>.db    # pre-merge copies
//! ```

mod blob;
mod library;
mod metadata;
mod snapshot;
mod upload;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use blob::BlobStore;
pub use library::Library;
pub use metadata::MetadataStore;
pub use snapshot::Snapshot;
pub use upload::UploadQueue;

/// Errors from the metadata and blob stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Invalid blob key: {0}")]
    InvalidBlobKey(String),

    #[error("Blob content does not match key {0}")]
    HashMismatch(String),

    #[error("Upload queue closed")]
    QueueClosed,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

//! Chunked file transfer over a peer session.
//!
//! ## Protocol
//!
//! 1. Sender announces the file with `file_info` (size, chunk count, hints)
//! 2. Sender emits `file_chunk` messages in increasing index order, paced
//! 3. Sender finishes with `file_complete`, even for an empty file
//! 4. Receiver stores chunks by index and concatenates them on completion

mod chunk;
mod receiver;
mod sender;

use thiserror::Error;

use crate::protocol::FileType;
use crate::session::SessionError;

pub use chunk::{chunk_count, split, Pacing, BATCH_LEN, DEFAULT_CHUNK_SIZE};
pub use receiver::{CompletedFile, FileInfo, Progress, Reassembler};
pub use sender::{clean_meta, send_file, OutgoingFile};

/// File id used for the database snapshot, and for transfers announced without one.
pub const MAIN_FILE_ID: &str = "main";

/// Largest file a peer may announce, unless configured otherwise.
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 1 << 30;

/// Sender-side settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub pacing: Pacing,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing: Pacing::default(),
        }
    }
}

/// Errors that abort a single file transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to send {file_type} {file_id}: {source}")]
    Send {
        file_type: FileType,
        file_id: String,
        #[source]
        source: SessionError,
    },

    #[error("Transfer {file_type} {file_id} is missing chunk {index} of {total}")]
    MissingChunk {
        file_type: FileType,
        file_id: String,
        index: u32,
        total: u32,
    },

    #[error("No transfer in progress for {file_type} {file_id}")]
    UnknownTransfer { file_type: FileType, file_id: String },

    #[error("Rejected announcement of {file_type} {file_id}: {reason}")]
    InvalidAnnouncement {
        file_type: FileType,
        file_id: String,
        reason: String,
    },

    #[error("Transfer {file_type} {file_id} produced {actual} bytes, expected {expected}")]
    SizeMismatch {
        file_type: FileType,
        file_id: String,
        expected: u64,
        actual: u64,
    },
}

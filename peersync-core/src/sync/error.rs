use thiserror::Error;

use crate::merge::MergeError;
use crate::models::DeviceCode;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Why a sync did not complete.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("A sync with {0} is already in progress")]
    AlreadySyncing(DeviceCode),

    #[error("Peer reported an error: {0}")]
    Remote(String),

    #[error("Sync with {0} timed out")]
    Timeout(DeviceCode),

    #[error("No snapshot was received from {0}")]
    NoSnapshot(DeviceCode),

    #[error("Session with {0} closed before the sync finished")]
    Disconnected(DeviceCode),
}

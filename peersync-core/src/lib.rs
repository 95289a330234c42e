//! PeerSync Core Library
//!
//! Device-to-device sync of an image library: chunked file transfer, peer
//! sessions, the two-phase sync protocol and the snapshot merge.

pub mod merge;
pub mod models;
pub mod node;
pub mod protocol;
pub mod session;
pub mod store;
pub mod sync;
pub mod transfer;

pub use merge::{merge, MergeEngine, MergeError, MergeReport, MergeStats};
pub use models::{content_hash, Device, DeviceCode, DeviceCodeError, Image};
pub use node::{Node, NodeConfig};
pub use protocol::{CodecError, FileType, PeerMessage, SyncId};
pub use session::{
    check_peer, ConnectionEvent, MemoryNetwork, PeerDirectory, PeerLink, SessionError,
    SessionManager, WsLink,
};
pub use store::{BlobStore, Library, MetadataStore, Snapshot, StoreError, UploadQueue};
pub use sync::{SyncError, SyncEvent, SyncMode, SyncOrchestrator, SyncSummary};
pub use transfer::{Pacing, TransferConfig, TransferError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! Two-phase bidirectional sync.
//!
//! ## Flow (A initiates with B)
//!
//! 1. A → `sync_request_phase1`; B pushes its database and blobs, then `phase1_complete`
//! 2. A merges, settles, then → `sync_request_phase2`
//! 3. B settles, then → `sync_request { isPhase2 }`
//! 4. A pushes its merged database and blobs, then `sync_complete`
//! 5. B merges, then → `phase2_complete`
//! 6. A → `bidirectional_sync_complete`; both sides drop the attempt

mod attempt;
mod error;
mod orchestrator;

use std::time::Duration;

use crate::merge::MergeStats;
use crate::models::DeviceCode;
use crate::protocol::SyncId;
use crate::transfer::Progress;

pub use attempt::{Attempt, InvalidStep, Ledger, Role, Stage, Step};
pub use error::SyncError;
pub use orchestrator::{SyncOrchestrator, DEFAULT_SETTLE_DELAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Bidirectional,
    /// A single snapshot push, no attempt state.
    OneWay,
}

/// Notifications published while syncs run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started {
        sync_id: SyncId,
        peer: DeviceCode,
        role: Role,
    },
    PhaseChanged {
        sync_id: SyncId,
        peer: DeviceCode,
        stage: Stage,
        phase: u8,
    },
    TransferProgress(Progress),
    Merged {
        sync_id: Option<SyncId>,
        peer: DeviceCode,
        stats: MergeStats,
    },
    Completed {
        sync_id: Option<SyncId>,
        peer: DeviceCode,
        mode: SyncMode,
    },
    Failed {
        sync_id: Option<SyncId>,
        peer: DeviceCode,
        error: String,
    },
    /// The session dropped while the attempt was live.
    Abandoned { sync_id: SyncId, peer: DeviceCode },
}

/// Result of a finished sync.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub sync_id: Option<SyncId>,
    pub peer: DeviceCode,
    pub mode: SyncMode,
    /// Stats of the merge this device performed, if it merged.
    pub merged: Option<MergeStats>,
    pub blobs_sent: usize,
    pub elapsed: Duration,
}

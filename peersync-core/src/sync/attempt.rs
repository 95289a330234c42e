//! Per-attempt state machine for the two-phase sync.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

use thiserror::Error;

use crate::merge::MergeStats;
use crate::models::DeviceCode;
use crate::protocol::SyncId;

/// Which side of a bidirectional sync this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Where an attempt currently is.
///
/// Initiator: `Requested → Merging → AwaitingPull → Pushing →
/// AwaitingConfirmation → Completed`.
/// Responder: `Pushing → AwaitingPhase2 → Pulling → Merging →
/// AwaitingFinish → Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Requested,
    Pushing,
    AwaitingPhase2,
    Pulling,
    Merging,
    AwaitingPull,
    AwaitingConfirmation,
    AwaitingFinish,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Requested => "requested",
            Stage::Pushing => "pushing",
            Stage::AwaitingPhase2 => "awaiting-phase2",
            Stage::Pulling => "pulling",
            Stage::Merging => "merging",
            Stage::AwaitingPull => "awaiting-pull",
            Stage::AwaitingConfirmation => "awaiting-confirmation",
            Stage::AwaitingFinish => "awaiting-finish",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs driving an attempt forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `phase1_complete` arrived: the peer's snapshot is staged.
    PeerPushed,
    /// The staged snapshot has been merged locally.
    Merged,
    /// `sync_request` with `isPhase2` arrived.
    PullRequested,
    /// Our snapshot and blobs are sent.
    Pushed,
    /// `phase2_complete` arrived.
    PeerMerged,
    /// `sync_request_phase2` arrived.
    Phase2Requested,
    /// `sync_complete` arrived for this attempt.
    SnapshotDelivered,
    /// `bidirectional_sync_complete` arrived.
    Finished,
    Fail,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{step:?} does not apply to a {role} attempt in stage {stage}")]
pub struct InvalidStep {
    pub role: Role,
    pub stage: Stage,
    pub step: Step,
}

/// One bidirectional sync, seen from this device.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub sync_id: SyncId,
    pub peer: DeviceCode,
    pub role: Role,
    pub stage: Stage,
    pub started: Instant,
    pub merged: Option<MergeStats>,
}

impl Attempt {
    pub fn initiator(sync_id: SyncId, peer: DeviceCode) -> Self {
        Self::new(sync_id, peer, Role::Initiator, Stage::Requested)
    }

    /// A responder starts out pushing its snapshot.
    pub fn responder(sync_id: SyncId, peer: DeviceCode) -> Self {
        Self::new(sync_id, peer, Role::Responder, Stage::Pushing)
    }

    fn new(sync_id: SyncId, peer: DeviceCode, role: Role, stage: Stage) -> Self {
        Self {
            sync_id,
            peer,
            role,
            stage,
            started: Instant::now(),
            merged: None,
        }
    }

    /// 1 while the responder's data flows to the initiator, 2 afterwards.
    pub fn phase(&self) -> u8 {
        match (self.role, self.stage) {
            (Role::Initiator, Stage::Requested | Stage::Merging) => 1,
            (Role::Responder, Stage::Pushing | Stage::AwaitingPhase2) => 1,
            _ => 2,
        }
    }

    /// Applies `step`, returning the new stage. Invalid steps leave the attempt unchanged.
    pub fn apply(&mut self, step: Step) -> Result<Stage, InvalidStep> {
        use Stage::*;

        let next = match (self.role, self.stage, step) {
            (_, stage, Step::Fail) if !stage.is_terminal() => Failed,

            (Role::Initiator, Requested, Step::PeerPushed) => Merging,
            (Role::Initiator, Merging, Step::Merged) => AwaitingPull,
            (Role::Initiator, AwaitingPull, Step::PullRequested) => Pushing,
            (Role::Initiator, Pushing, Step::Pushed) => AwaitingConfirmation,
            (Role::Initiator, AwaitingConfirmation, Step::PeerMerged) => Completed,

            (Role::Responder, Pushing, Step::Pushed) => AwaitingPhase2,
            (Role::Responder, AwaitingPhase2, Step::Phase2Requested) => Pulling,
            (Role::Responder, Pulling, Step::SnapshotDelivered) => Merging,
            (Role::Responder, Merging, Step::Merged) => AwaitingFinish,
            (Role::Responder, AwaitingFinish, Step::Finished) => Completed,

            (role, stage, step) => return Err(InvalidStep { role, stage, step }),
        };

        self.stage = next;
        Ok(next)
    }
}

/// Recently finished sync ids, so late or repeated messages are recognised.
#[derive(Debug)]
pub struct Ledger {
    order: VecDeque<SyncId>,
    ids: HashSet<SyncId>,
    capacity: usize,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, sync_id: SyncId) {
        if !self.ids.insert(sync_id.clone()) {
            return;
        }
        self.order.push_back(sync_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, sync_id: &SyncId) -> bool {
        self.ids.contains(sync_id)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(256)
    }
}

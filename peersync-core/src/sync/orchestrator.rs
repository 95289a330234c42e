//! Drives sync attempts from inbound protocol messages.
//!
//! Handlers run on the router task, one message at a time. Anything slow
//! (pushing a snapshot, merging, settling) runs in a spawned task that ends by
//! sending the next protocol message. Every handler applies its step to the
//! attempt first, so duplicates and out-of-order messages fall out as
//! rejected transitions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, oneshot, Mutex};

use super::{Attempt, Ledger, Role, Stage, Step, SyncError, SyncEvent, SyncMode, SyncSummary};
use crate::merge::{MergeEngine, MergeStats};
use crate::models::DeviceCode;
use crate::protocol::{PeerMessage, SyncId};
use crate::session::{SessionError, SessionManager};
use crate::store::{Library, StoreError};
use crate::transfer::{send_file, OutgoingFile, Progress, TransferConfig, TransferError};

/// Pause between a merge and asking the peer for the next phase.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 256;

type Waiter = oneshot::Sender<Result<SyncSummary, SyncError>>;

struct Live {
    attempt: Attempt,
    blobs_sent: usize,
    waiter: Option<Waiter>,
}

#[derive(Default)]
struct State {
    attempts: HashMap<SyncId, Live>,
    ledger: Ledger,
    /// Last database snapshot received from each peer, waiting to be merged.
    staged: HashMap<DeviceCode, PathBuf>,
}

impl State {
    fn live_with(&self, peer: &DeviceCode) -> Option<&Attempt> {
        self.attempts
            .values()
            .map(|live| &live.attempt)
            .find(|attempt| &attempt.peer == peer)
    }
}

struct Inner {
    library: Arc<Library>,
    sessions: SessionManager,
    engine: MergeEngine,
    transfer: TransferConfig,
    settle_delay: Duration,
    state: Mutex<State>,
    events: broadcast::Sender<SyncEvent>,
}

/// Runs syncs for one device. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        library: Arc<Library>,
        sessions: SessionManager,
        engine: MergeEngine,
        transfer: TransferConfig,
        settle_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                library,
                sessions,
                engine,
                transfer,
                settle_delay,
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Attempts currently in flight.
    pub async fn live_attempts(&self) -> Vec<Attempt> {
        let state = self.inner.state.lock().await;
        state.attempts.values().map(|live| live.attempt.clone()).collect()
    }

    pub async fn is_syncing(&self, peer: &DeviceCode) -> bool {
        self.inner.state.lock().await.live_with(peer).is_some()
    }

    /// Runs a bidirectional sync with `peer` and waits until it ends.
    pub async fn run_bidirectional(
        &self,
        peer: &DeviceCode,
        timeout: Duration,
    ) -> Result<SyncSummary, SyncError> {
        let (sync_id, waiter) = self.start_bidirectional(peer).await?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected(peer.clone())),
            Err(_) => {
                self.inner
                    .fail(&sync_id, SyncError::Timeout(peer.clone()))
                    .await;
                Err(SyncError::Timeout(peer.clone()))
            }
        }
    }

    /// Starts a bidirectional sync without waiting for it.
    ///
    /// The receiver resolves when the attempt completes, fails or is abandoned.
    pub async fn start_bidirectional(
        &self,
        peer: &DeviceCode,
    ) -> Result<(SyncId, oneshot::Receiver<Result<SyncSummary, SyncError>>), SyncError> {
        let inner = &self.inner;
        if !inner.sessions.is_connected(peer).await {
            return Err(SessionError::NotConnected(peer.clone()).into());
        }

        let sync_id = SyncId::new();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = inner.state.lock().await;
            if state.live_with(peer).is_some() {
                return Err(SyncError::AlreadySyncing(peer.clone()));
            }
            state.attempts.insert(
                sync_id.clone(),
                Live {
                    attempt: Attempt::initiator(sync_id.clone(), peer.clone()),
                    blobs_sent: 0,
                    waiter: Some(tx),
                },
            );
        }

        tracing::info!("Starting sync {} with {}", sync_id, peer);
        inner.emit(SyncEvent::Started {
            sync_id: sync_id.clone(),
            peer: peer.clone(),
            role: Role::Initiator,
        });

        let request = PeerMessage::SyncRequestPhase1 {
            sync_id: sync_id.clone(),
            initiator_device: inner.sessions.local().clone(),
        };
        if let Err(e) = inner.sessions.send(peer, request).await {
            inner.fail(&sync_id, SyncError::Session(e.clone())).await;
            return Err(e.into());
        }

        Ok((sync_id, rx))
    }

    /// One-way sync: pushes this device's snapshot and blobs to `peer`.
    pub async fn push(&self, peer: &DeviceCode) -> Result<SyncSummary, SyncError> {
        let inner = &self.inner;
        if !inner.sessions.is_connected(peer).await {
            return Err(SessionError::NotConnected(peer.clone()).into());
        }
        if self.is_syncing(peer).await {
            return Err(SyncError::AlreadySyncing(peer.clone()));
        }

        let started = Instant::now();
        tracing::info!("Pushing snapshot to {}", peer);

        let pushed = async {
            let blobs_sent = inner.push_snapshot(peer, None).await?;
            inner
                .sessions
                .send(
                    peer,
                    PeerMessage::SyncComplete {
                        timestamp: Utc::now().timestamp_millis(),
                        sync_id: None,
                    },
                )
                .await?;
            Ok::<usize, SyncError>(blobs_sent)
        }
        .await;

        match pushed {
            Ok(blobs_sent) => {
                tracing::info!("Pushed snapshot and {} blob(s) to {}", blobs_sent, peer);
                inner.emit(SyncEvent::Completed {
                    sync_id: None,
                    peer: peer.clone(),
                    mode: SyncMode::OneWay,
                });
                Ok(SyncSummary {
                    sync_id: None,
                    peer: peer.clone(),
                    mode: SyncMode::OneWay,
                    merged: None,
                    blobs_sent,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                tracing::error!("Push to {} failed: {}", peer, e);
                inner.emit(SyncEvent::Failed {
                    sync_id: None,
                    peer: peer.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Asks `peer` to push its snapshot here. The merge happens when its
    /// `sync_complete` arrives.
    pub async fn request_pull(&self, peer: &DeviceCode) -> Result<(), SyncError> {
        self.inner
            .sessions
            .send(
                peer,
                PeerMessage::SyncRequest {
                    sync_id: None,
                    phase: None,
                    is_phase2: false,
                },
            )
            .await?;
        Ok(())
    }

    /// Handles one sync-related message from `from`.
    pub async fn handle(&self, from: DeviceCode, message: PeerMessage) {
        match message {
            PeerMessage::SyncRequestPhase1 {
                sync_id,
                initiator_device,
            } => self.on_phase1_request(from, sync_id, initiator_device).await,
            PeerMessage::Phase1Complete { sync_id } => self.on_phase1_complete(from, sync_id).await,
            PeerMessage::SyncRequestPhase2 { sync_id, .. } => {
                self.on_phase2_request(from, sync_id).await
            }
            PeerMessage::SyncRequest {
                sync_id: Some(sync_id),
                is_phase2: true,
                ..
            } => self.on_pull_request(from, sync_id).await,
            PeerMessage::SyncRequest { sync_id, .. } => self.on_one_way_request(from, sync_id),
            PeerMessage::SyncComplete { sync_id, .. } => self.on_sync_complete(from, sync_id).await,
            PeerMessage::Phase2Complete { sync_id } => self.on_phase2_complete(from, sync_id).await,
            PeerMessage::BidirectionalSyncComplete { sync_id } => {
                self.inner.advance(&from, &sync_id, Step::Finished).await;
            }
            PeerMessage::SyncError { error, sync_id } => {
                self.on_remote_error(from, sync_id, error).await
            }
            other => tracing::warn!("Ignoring {} from {}", other.kind(), from),
        }
    }

    /// Records a database snapshot received from `peer`, replacing any older one.
    pub async fn stage_snapshot(&self, peer: DeviceCode, path: PathBuf) {
        let replaced = self.inner.state.lock().await.staged.insert(peer, path);
        if let Some(old) = replaced {
            let _ = tokio::fs::remove_file(old).await;
        }
    }

    pub fn report_progress(&self, progress: Progress) {
        self.inner.emit(SyncEvent::TransferProgress(progress));
    }

    /// A transfer from `peer` could not be reassembled; its live attempt fails.
    pub async fn transfer_failed(&self, peer: &DeviceCode, error: TransferError) {
        let sync_id = {
            let state = self.inner.state.lock().await;
            state.live_with(peer).map(|attempt| attempt.sync_id.clone())
        };
        match sync_id {
            Some(sync_id) => self.inner.fail(&sync_id, error.into()).await,
            None => tracing::warn!("Discarded transfer from {}: {}", peer, error),
        }
    }

    /// Abandons everything in flight with `peer`.
    pub async fn on_session_closed(&self, peer: &DeviceCode) {
        let (abandoned, staged) = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<SyncId> = state
                .attempts
                .values()
                .filter(|live| &live.attempt.peer == peer)
                .map(|live| live.attempt.sync_id.clone())
                .collect();
            let mut abandoned = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(live) = state.attempts.remove(&id) {
                    state.ledger.record(id);
                    abandoned.push(live);
                }
            }
            (abandoned, state.staged.remove(peer))
        };

        for mut live in abandoned {
            tracing::warn!(
                "Abandoning sync {} with {} in stage {}",
                live.attempt.sync_id,
                peer,
                live.attempt.stage
            );
            self.inner.emit(SyncEvent::Abandoned {
                sync_id: live.attempt.sync_id.clone(),
                peer: peer.clone(),
            });
            if let Some(waiter) = live.waiter.take() {
                let _ = waiter.send(Err(SyncError::Disconnected(peer.clone())));
            }
        }

        if let Some(path) = staged {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    async fn on_phase1_request(&self, from: DeviceCode, sync_id: SyncId, initiator: DeviceCode) {
        let inner = &self.inner;
        if initiator != from {
            tracing::warn!(
                "sync_request_phase1 {} names initiator {} but came from {}",
                sync_id,
                initiator,
                from
            );
        }

        let mut state = inner.state.lock().await;
        if state.attempts.contains_key(&sync_id) || state.ledger.contains(&sync_id) {
            tracing::debug!("Ignoring repeated sync_request_phase1 {}", sync_id);
            return;
        }

        let mut yielded = None;
        if let Some(existing) = state.live_with(&from) {
            // On simultaneous starts the lower device code keeps its attempt.
            let keep_ours =
                existing.role == Role::Responder || inner.sessions.local() < &from;
            if keep_ours {
                let existing_id = existing.sync_id.clone();
                drop(state);
                tracing::warn!(
                    "Rejecting sync {} from {}: sync {} already running",
                    sync_id,
                    from,
                    existing_id
                );
                let _ = inner
                    .sessions
                    .send(
                        &from,
                        PeerMessage::SyncError {
                            error: SyncError::AlreadySyncing(inner.sessions.local().clone())
                                .to_string(),
                            sync_id: Some(sync_id),
                        },
                    )
                    .await;
                return;
            }

            let existing_id = existing.sync_id.clone();
            yielded = state.attempts.remove(&existing_id);
            state.ledger.record(existing_id);
        }

        state.attempts.insert(
            sync_id.clone(),
            Live {
                attempt: Attempt::responder(sync_id.clone(), from.clone()),
                blobs_sent: 0,
                waiter: None,
            },
        );
        drop(state);

        if let Some(mut live) = yielded {
            tracing::info!(
                "Yielding sync {} to {}'s sync {}",
                live.attempt.sync_id,
                from,
                sync_id
            );
            inner.emit(SyncEvent::Failed {
                sync_id: Some(live.attempt.sync_id.clone()),
                peer: from.clone(),
                error: SyncError::AlreadySyncing(from.clone()).to_string(),
            });
            if let Some(waiter) = live.waiter.take() {
                let _ = waiter.send(Err(SyncError::AlreadySyncing(from.clone())));
            }
        }

        tracing::info!("Sync {} requested by {}", sync_id, from);
        inner.emit(SyncEvent::Started {
            sync_id: sync_id.clone(),
            peer: from.clone(),
            role: Role::Responder,
        });

        let task = inner.clone();
        inner.spawn_step(sync_id.clone(), async move {
            let blobs = task.push_snapshot(&from, Some(&sync_id)).await?;
            task.note_blobs(&sync_id, blobs).await;
            if task.advance(&from, &sync_id, Step::Pushed).await.is_none() {
                return Ok(());
            }
            task.sessions
                .send(&from, PeerMessage::Phase1Complete { sync_id })
                .await?;
            Ok(())
        });
    }

    async fn on_phase1_complete(&self, from: DeviceCode, sync_id: SyncId) {
        let inner = &self.inner;
        if inner.advance(&from, &sync_id, Step::PeerPushed).await.is_none() {
            return;
        }

        let task = inner.clone();
        inner.spawn_step(sync_id.clone(), async move {
            let stats = task.merge_staged(&from, Some(&sync_id)).await?;
            task.note_merge(&sync_id, stats).await;
            if task.advance(&from, &sync_id, Step::Merged).await.is_none() {
                return Ok(());
            }

            tokio::time::sleep(task.settle_delay).await;
            if !task.is_live(&sync_id).await {
                return Ok(());
            }
            task.sessions
                .send(
                    &from,
                    PeerMessage::SyncRequestPhase2 {
                        sync_id,
                        initiator_device: task.sessions.local().clone(),
                    },
                )
                .await?;
            Ok(())
        });
    }

    async fn on_phase2_request(&self, from: DeviceCode, sync_id: SyncId) {
        let inner = &self.inner;
        if inner
            .advance(&from, &sync_id, Step::Phase2Requested)
            .await
            .is_none()
        {
            return;
        }

        let task = inner.clone();
        inner.spawn_step(sync_id.clone(), async move {
            tokio::time::sleep(task.settle_delay).await;
            if !task.is_live(&sync_id).await {
                return Ok(());
            }
            task.sessions
                .send(
                    &from,
                    PeerMessage::SyncRequest {
                        sync_id: Some(sync_id),
                        phase: Some(2),
                        is_phase2: true,
                    },
                )
                .await?;
            Ok(())
        });
    }

    async fn on_pull_request(&self, from: DeviceCode, sync_id: SyncId) {
        let inner = &self.inner;
        if inner
            .advance(&from, &sync_id, Step::PullRequested)
            .await
            .is_none()
        {
            return;
        }

        let task = inner.clone();
        inner.spawn_step(sync_id.clone(), async move {
            let blobs = task.push_snapshot(&from, Some(&sync_id)).await?;
            task.note_blobs(&sync_id, blobs).await;
            if task.advance(&from, &sync_id, Step::Pushed).await.is_none() {
                return Ok(());
            }
            task.sessions
                .send(
                    &from,
                    PeerMessage::SyncComplete {
                        timestamp: Utc::now().timestamp_millis(),
                        sync_id: Some(sync_id),
                    },
                )
                .await?;
            Ok(())
        });
    }

    async fn on_phase2_complete(&self, from: DeviceCode, sync_id: SyncId) {
        let inner = &self.inner;
        if !inner.accepts(&from, &sync_id, Step::PeerMerged).await {
            tracing::debug!("Ignoring phase2_complete for sync {}", sync_id);
            return;
        }

        // Queue the confirmation before completing, so it leaves ahead of any teardown.
        if let Err(e) = inner
            .sessions
            .send(
                &from,
                PeerMessage::BidirectionalSyncComplete {
                    sync_id: sync_id.clone(),
                },
            )
            .await
        {
            tracing::warn!("Could not confirm sync completion to {}: {}", from, e);
        }
        inner.advance(&from, &sync_id, Step::PeerMerged).await;
    }

    async fn on_sync_complete(&self, from: DeviceCode, sync_id: Option<SyncId>) {
        let inner = &self.inner;

        if let Some(id) = &sync_id {
            let (live, finished) = {
                let state = inner.state.lock().await;
                (state.attempts.contains_key(id), state.ledger.contains(id))
            };
            if finished {
                tracing::debug!("Ignoring sync_complete for finished sync {}", id);
                return;
            }
            if live {
                self.on_phase2_delivered(from, id.clone()).await;
                return;
            }
        }

        if let Some(attempt) = inner.state.lock().await.live_with(&from) {
            tracing::warn!(
                "Ignoring one-way push from {} during sync {}",
                from,
                attempt.sync_id
            );
            return;
        }

        let task = inner.clone();
        tokio::spawn(async move {
            match task.merge_staged(&from, sync_id.as_ref()).await {
                Ok(stats) => {
                    tracing::info!(
                        "Merged one-way push from {}: {} image(s) added",
                        from,
                        stats.images_added
                    );
                    task.emit(SyncEvent::Completed {
                        sync_id,
                        peer: from,
                        mode: SyncMode::OneWay,
                    });
                }
                Err(e) => {
                    tracing::error!("Merging one-way push from {} failed: {}", from, e);
                    task.emit(SyncEvent::Failed {
                        sync_id,
                        peer: from,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    async fn on_phase2_delivered(&self, from: DeviceCode, sync_id: SyncId) {
        let inner = &self.inner;
        if inner
            .advance(&from, &sync_id, Step::SnapshotDelivered)
            .await
            .is_none()
        {
            return;
        }

        let task = inner.clone();
        inner.spawn_step(sync_id.clone(), async move {
            let stats = task.merge_staged(&from, Some(&sync_id)).await?;
            task.note_merge(&sync_id, stats).await;
            if task.advance(&from, &sync_id, Step::Merged).await.is_none() {
                return Ok(());
            }
            task.sessions
                .send(&from, PeerMessage::Phase2Complete { sync_id })
                .await?;
            Ok(())
        });
    }

    /// Serves a one-way pull: push everything, then `sync_complete`.
    fn on_one_way_request(&self, from: DeviceCode, sync_id: Option<SyncId>) {
        let task = self.inner.clone();
        tokio::spawn(async move {
            let pushed = async {
                let blobs = task.push_snapshot(&from, None).await?;
                task.sessions
                    .send(
                        &from,
                        PeerMessage::SyncComplete {
                            timestamp: Utc::now().timestamp_millis(),
                            sync_id: sync_id.clone(),
                        },
                    )
                    .await?;
                Ok::<usize, SyncError>(blobs)
            }
            .await;

            match pushed {
                Ok(blobs) => tracing::info!("Served pull from {} with {} blob(s)", from, blobs),
                Err(e) => {
                    tracing::error!("Serving pull from {} failed: {}", from, e);
                    let _ = task
                        .sessions
                        .send(
                            &from,
                            PeerMessage::SyncError {
                                error: e.to_string(),
                                sync_id,
                            },
                        )
                        .await;
                }
            }
        });
    }

    async fn on_remote_error(&self, from: DeviceCode, sync_id: Option<SyncId>, error: String) {
        let inner = &self.inner;
        let target = {
            let state = inner.state.lock().await;
            match &sync_id {
                Some(id) => state
                    .attempts
                    .get(id)
                    .filter(|live| live.attempt.peer == from)
                    .map(|_| id.clone()),
                None => state.live_with(&from).map(|attempt| attempt.sync_id.clone()),
            }
        };

        match target {
            Some(id) => inner.fail(&id, SyncError::Remote(error)).await,
            None => tracing::warn!("Peer {} reported an error: {}", from, error),
        }
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn is_live(&self, sync_id: &SyncId) -> bool {
        self.state.lock().await.attempts.contains_key(sync_id)
    }

    /// Whether `step` would currently apply, without applying it.
    async fn accepts(&self, from: &DeviceCode, sync_id: &SyncId, step: Step) -> bool {
        let state = self.state.lock().await;
        state.attempts.get(sync_id).is_some_and(|live| {
            &live.attempt.peer == from && live.attempt.clone().apply(step).is_ok()
        })
    }

    /// Applies `step` to the attempt `sync_id` owned by `from`.
    ///
    /// Returns `None` when the step does not apply; the caller then does nothing.
    async fn advance(&self, from: &DeviceCode, sync_id: &SyncId, step: Step) -> Option<DeviceCode> {
        let mut state = self.state.lock().await;
        let Some(live) = state.attempts.get_mut(sync_id) else {
            tracing::debug!("Ignoring {:?} for inactive sync {}", step, sync_id);
            return None;
        };
        if &live.attempt.peer != from {
            tracing::warn!(
                "Ignoring {:?} for sync {} from {}, it belongs to {}",
                step,
                sync_id,
                from,
                live.attempt.peer
            );
            return None;
        }

        let stage = match live.attempt.apply(step) {
            Ok(stage) => stage,
            Err(e) => {
                tracing::warn!("Ignoring message for sync {}: {}", sync_id, e);
                return None;
            }
        };

        tracing::debug!("Sync {} now {}", sync_id, stage);
        self.emit(SyncEvent::PhaseChanged {
            sync_id: sync_id.clone(),
            peer: from.clone(),
            stage,
            phase: live.attempt.phase(),
        });

        if stage == Stage::Completed {
            if let Some(live) = state.attempts.remove(sync_id) {
                state.ledger.record(sync_id.clone());
                drop(state);
                self.complete(live);
            }
        }
        Some(from.clone())
    }

    fn complete(&self, mut live: Live) {
        let attempt = &live.attempt;
        tracing::info!(
            "Sync {} with {} completed as {} in {:?}",
            attempt.sync_id,
            attempt.peer,
            attempt.role,
            attempt.started.elapsed()
        );
        self.emit(SyncEvent::Completed {
            sync_id: Some(attempt.sync_id.clone()),
            peer: attempt.peer.clone(),
            mode: SyncMode::Bidirectional,
        });

        let summary = SyncSummary {
            sync_id: Some(attempt.sync_id.clone()),
            peer: attempt.peer.clone(),
            mode: SyncMode::Bidirectional,
            merged: attempt.merged,
            blobs_sent: live.blobs_sent,
            elapsed: attempt.started.elapsed(),
        };
        if let Some(waiter) = live.waiter.take() {
            let _ = waiter.send(Ok(summary));
        }
    }

    /// Fails and forgets an attempt, telling the peer unless the error came from it.
    async fn fail(&self, sync_id: &SyncId, error: SyncError) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.attempts.remove(sync_id);
            if removed.is_some() {
                state.ledger.record(sync_id.clone());
            }
            removed
        };
        let Some(mut live) = removed else {
            return;
        };

        let stage = live.attempt.stage;
        let _ = live.attempt.apply(Step::Fail);
        let peer = live.attempt.peer.clone();
        let message = error.to_string();
        tracing::error!(
            "Sync {} with {} failed in stage {}: {}",
            sync_id,
            peer,
            stage,
            message
        );

        let from_peer = matches!(error, SyncError::Remote(_) | SyncError::Disconnected(_));
        if !from_peer && self.sessions.is_connected(&peer).await {
            let _ = self
                .sessions
                .send(
                    &peer,
                    PeerMessage::SyncError {
                        error: message.clone(),
                        sync_id: Some(sync_id.clone()),
                    },
                )
                .await;
        }

        self.emit(SyncEvent::Failed {
            sync_id: Some(sync_id.clone()),
            peer,
            error: message,
        });
        if let Some(waiter) = live.waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }

    fn spawn_step<F>(self: &Arc<Self>, sync_id: SyncId, work: F)
    where
        F: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = work.await {
                inner.fail(&sync_id, e).await;
            }
        });
    }

    async fn note_blobs(&self, sync_id: &SyncId, blobs: usize) {
        if let Some(live) = self.state.lock().await.attempts.get_mut(sync_id) {
            live.blobs_sent += blobs;
        }
    }

    async fn note_merge(&self, sync_id: &SyncId, stats: MergeStats) {
        if let Some(live) = self.state.lock().await.attempts.get_mut(sync_id) {
            live.attempt.merged = Some(stats);
        }
    }

    /// Sends the database snapshot, then every distinct blob.
    ///
    /// With a `sync_id`, stops early once that attempt is no longer live.
    async fn push_snapshot(
        &self,
        peer: &DeviceCode,
        sync_id: Option<&SyncId>,
    ) -> Result<usize, SyncError> {
        let bytes = self.library.snapshot_bytes().await?;
        send_file(&self.sessions, peer, &OutgoingFile::database(bytes), &self.transfer).await?;

        let images = self.library.images().await?;
        let mut seen = HashSet::new();
        let mut sent = 0;

        for image in images {
            if !seen.insert(image.blob_key.clone()) {
                continue;
            }
            if let Some(id) = sync_id {
                if !self.is_live(id).await {
                    tracing::debug!("Sync {} ended, stopping push to {}", id, peer);
                    break;
                }
            }

            let bytes = match self.library.image_bytes(&image).await {
                Ok(bytes) => bytes,
                Err(StoreError::BlobNotFound(key)) => {
                    tracing::warn!("Skipping image {}: blob {} missing", image.id, key);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let meta = json!({
                "id": image.id,
                "deviceId": image.device_id,
                "createdAt": image.created_at,
                "description": image.description,
            });
            let file = OutgoingFile::image(image.hash.clone(), bytes, Some(&meta));
            send_file(&self.sessions, peer, &file, &self.transfer).await?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Merges the snapshot staged from `peer` into the library.
    async fn merge_staged(
        &self,
        peer: &DeviceCode,
        sync_id: Option<&SyncId>,
    ) -> Result<MergeStats, SyncError> {
        let path = self
            .state
            .lock()
            .await
            .staged
            .remove(peer)
            .ok_or_else(|| SyncError::NoSnapshot(peer.clone()))?;

        let report = match self.engine.apply(&self.library, &path).await {
            Ok(report) => report,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e.into());
            }
        };

        if report.replaced_local {
            tracing::warn!(
                "Local database was unreadable; rebuilt from {}'s snapshot (backup at {})",
                peer,
                report.backup.display()
            );
        }
        tracing::info!(
            "Merged snapshot from {}: {} image(s) added, {} device(s) added, {} duplicate(s)",
            peer,
            report.stats.images_added,
            report.stats.devices_added,
            report.stats.duplicates_skipped
        );
        self.emit(SyncEvent::Merged {
            sync_id: sync_id.cloned(),
            peer: peer.clone(),
            stats: report.stats,
        });
        Ok(report.stats)
    }
}

//! A running sync node: library, sessions, orchestrator and the message router.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::merge::MergeEngine;
use crate::models::DeviceCode;
use crate::protocol::{FileType, PeerMessage};
use crate::session::{Inbound, PeerLink, SessionConfig, SessionManager, DEFAULT_CONNECT_TIMEOUT};
use crate::store::{Library, StoreError, UploadQueue};
use crate::sync::{SyncOrchestrator, DEFAULT_SETTLE_DELAY};
use crate::transfer::{
    CompletedFile, FileInfo, Reassembler, TransferConfig, DEFAULT_MAX_TRANSFER_BYTES,
};

/// Settings the core needs to run a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub transfer: TransferConfig,
    pub settle_delay: Duration,
    pub connect_timeout: Duration,
    pub backups_kept: usize,
    /// Largest file accepted from a peer.
    pub max_transfer_bytes: u64,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            transfer: TransferConfig::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backups_kept: 5,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
        }
    }
}

/// Owns every component of a node. Dropping it without [`Node::shutdown`]
/// leaves the background tasks running until the runtime stops.
pub struct Node {
    library: Arc<Library>,
    sessions: SessionManager,
    orchestrator: SyncOrchestrator,
    uploads: UploadQueue,
    router: JoinHandle<()>,
    upload_worker: JoinHandle<()>,
}

impl Node {
    /// Opens the library under `config.data_dir` and starts routing.
    pub async fn start(config: NodeConfig, link: Arc<dyn PeerLink>) -> Result<Self, StoreError> {
        let library = Arc::new(Library::open(&config.data_dir).await?);
        let device_code = library.device_code();

        let (sessions, inbound) = SessionManager::new(
            device_code.clone(),
            link,
            SessionConfig {
                connect_timeout: config.connect_timeout,
            },
        );
        let orchestrator = SyncOrchestrator::new(
            library.clone(),
            sessions.clone(),
            MergeEngine::new(config.backups_kept),
            config.transfer,
            config.settle_delay,
        );
        let (uploads, upload_worker) = UploadQueue::spawn(library.clone());

        let router = Router {
            library: library.clone(),
            orchestrator: orchestrator.clone(),
            reassembler: Reassembler::with_limit(config.max_transfer_bytes),
        };
        let router = tokio::spawn(router.run(inbound));

        tracing::info!(
            "Node {} started with data dir {}",
            device_code,
            config.data_dir.display()
        );

        Ok(Self {
            library,
            sessions,
            orchestrator,
            uploads,
            router,
            upload_worker,
        })
    }

    pub fn device_code(&self) -> DeviceCode {
        self.library.device_code()
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn uploads(&self) -> &UploadQueue {
        &self.uploads
    }

    /// Closes all sessions, stops the router and the upload worker.
    pub async fn shutdown(self) {
        self.sessions.shutdown().await;
        self.router.abort();
        drop(self.uploads);
        let _ = self.upload_worker.await;
        self.library.lock().await.close().await;
        tracing::info!("Node {} stopped", self.library.device_code());
    }
}

/// Consumes the inbound queue: file transfers are reassembled here, sync
/// messages go to the orchestrator.
struct Router {
    library: Arc<Library>,
    orchestrator: SyncOrchestrator,
    reassembler: Reassembler,
}

impl Router {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(item) = inbound.recv().await {
            match item {
                Inbound::Message { from, message } => self.dispatch(from, message).await,
                Inbound::Closed { peer } => {
                    self.reassembler.abandon_peer(&peer);
                    self.orchestrator.on_session_closed(&peer).await;
                }
            }
        }
        tracing::debug!("Router stopped");
    }

    async fn dispatch(&mut self, from: DeviceCode, message: PeerMessage) {
        match message {
            PeerMessage::Hello { device_code } => {
                tracing::warn!("Unexpected hello from {} announcing {}", from, device_code)
            }
            PeerMessage::FileInfo {
                file_type,
                file_id,
                file_name,
                file_size,
                total_chunks,
                mime_type,
                meta,
            } => {
                let info = FileInfo {
                    file_type,
                    file_id,
                    file_name,
                    file_size,
                    total_chunks,
                    mime_type,
                    meta,
                };
                if let Err(e) = self.reassembler.begin(&from, info) {
                    tracing::warn!("Ignoring file_info from {}: {}", from, e);
                }
            }
            PeerMessage::FileChunk {
                file_type,
                file_id,
                chunk_index,
                total_chunks,
                data,
            } => {
                if let Some(progress) = self.reassembler.accept_chunk(
                    &from,
                    file_type,
                    &file_id,
                    chunk_index,
                    total_chunks,
                    data,
                ) {
                    tracing::debug!(
                        "{} {} from {}: {}%",
                        progress.file_type,
                        progress.file_id,
                        from,
                        progress.percent()
                    );
                    self.orchestrator.report_progress(progress);
                }
            }
            PeerMessage::FileComplete { file_type, file_id } => {
                match self.reassembler.finish(&from, file_type, &file_id) {
                    Ok(file) => self.deliver(file).await,
                    Err(e) => self.orchestrator.transfer_failed(&from, e).await,
                }
            }
            other => self.orchestrator.handle(from, other).await,
        }
    }

    async fn deliver(&self, file: CompletedFile) {
        match file.info.file_type {
            FileType::Database => {
                let path = self
                    .library
                    .incoming_dir()
                    .join(format!("{}-{}.db", file.peer, uuid::Uuid::new_v4()));
                if let Err(e) = tokio::fs::write(&path, &file.bytes).await {
                    tracing::error!("Could not stage snapshot from {}: {}", file.peer, e);
                    return;
                }
                tracing::debug!(
                    "Staged {} byte snapshot from {} at {}",
                    file.bytes.len(),
                    file.peer,
                    path.display()
                );
                self.orchestrator.stage_snapshot(file.peer, path).await;
            }
            FileType::Image => {
                match self
                    .library
                    .blobs()
                    .write(&file.info.file_id, &file.bytes)
                    .await
                {
                    Ok(true) => tracing::debug!("Stored blob {}", file.info.file_id),
                    Ok(false) => tracing::debug!("Blob {} already present", file.info.file_id),
                    Err(e) => tracing::warn!(
                        "Rejected blob {} from {}: {}",
                        file.info.file_id,
                        file.peer,
                        e
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryNetwork;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_node_start_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();

        let node = Node::start(NodeConfig::new(temp_dir.path()), network.clone())
            .await
            .unwrap();
        let code = node.device_code();
        assert_eq!(code.as_str().len(), 6);
        assert!(temp_dir.path().join("metadata.db").exists());

        let image = node.uploads().upload(b"pixels".to_vec(), "first").await.unwrap();
        assert_eq!(node.library().images().await.unwrap(), vec![image]);

        node.shutdown().await;

        // Reopening keeps the same identity.
        let node = Node::start(NodeConfig::new(temp_dir.path()), network)
            .await
            .unwrap();
        assert_eq!(node.device_code(), code);
        node.shutdown().await;
    }

    fn router(library: Arc<Library>) -> Router {
        let network = MemoryNetwork::new();
        let (sessions, _inbound) =
            SessionManager::new(library.device_code(), network, SessionConfig::default());
        let orchestrator = SyncOrchestrator::new(
            library.clone(),
            sessions,
            MergeEngine::default(),
            TransferConfig::default(),
            Duration::ZERO,
        );
        Router {
            library,
            orchestrator,
            reassembler: Reassembler::new(),
        }
    }

    async fn send_blob(router: &mut Router, peer: &DeviceCode, blob: &[u8]) -> String {
        let key = crate::models::content_hash(blob);
        router
            .dispatch(
                peer.clone(),
                PeerMessage::FileInfo {
                    file_type: FileType::Image,
                    file_id: key.clone(),
                    file_name: key.clone(),
                    file_size: blob.len() as u64,
                    total_chunks: 1,
                    mime_type: None,
                    meta: None,
                },
            )
            .await;
        router
            .dispatch(
                peer.clone(),
                PeerMessage::FileChunk {
                    file_type: FileType::Image,
                    file_id: key.clone(),
                    chunk_index: 0,
                    total_chunks: 1,
                    data: blob.to_vec(),
                },
            )
            .await;
        router
            .dispatch(
                peer.clone(),
                PeerMessage::FileComplete {
                    file_type: FileType::Image,
                    file_id: key.clone(),
                },
            )
            .await;
        key
    }

    #[tokio::test]
    async fn test_router_stores_blobs() {
        let temp_dir = TempDir::new().unwrap();
        let library = Arc::new(Library::open(temp_dir.path()).await.unwrap());
        let mut router = router(library.clone());
        let peer: DeviceCode = "555555".parse().unwrap();

        let blob = b"not really a png".to_vec();
        let key = send_blob(&mut router, &peer, &blob).await;

        assert_eq!(library.blobs().read(&key).await.unwrap(), blob);
        assert_eq!(router.reassembler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_router_survives_bogus_file_info() {
        let temp_dir = TempDir::new().unwrap();
        let library = Arc::new(Library::open(temp_dir.path()).await.unwrap());
        let mut router = router(library.clone());
        let peer: DeviceCode = "555555".parse().unwrap();

        for (file_size, total_chunks) in [(u64::MAX, 0), (10, u32::MAX)] {
            router
                .dispatch(
                    peer.clone(),
                    PeerMessage::FileInfo {
                        file_type: FileType::Image,
                        file_id: "bogus".to_string(),
                        file_name: "bogus".to_string(),
                        file_size,
                        total_chunks,
                        mime_type: None,
                        meta: None,
                    },
                )
                .await;
            router
                .dispatch(
                    peer.clone(),
                    PeerMessage::FileComplete {
                        file_type: FileType::Image,
                        file_id: "bogus".to_string(),
                    },
                )
                .await;
        }
        assert_eq!(router.reassembler.in_flight(), 0);

        // A well-formed transfer afterwards still lands.
        let blob = b"after the bogus ones".to_vec();
        let key = send_blob(&mut router, &peer, &blob).await;
        assert_eq!(library.blobs().read(&key).await.unwrap(), blob);
    }
}

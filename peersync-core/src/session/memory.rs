//! In-process link for tests and local simulation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::manager::WeakSessionManager;
use super::{PeerChannel, PeerLink, SessionError, SessionManager};
use crate::models::DeviceCode;

/// A switchboard of session managers that dial each other directly.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<DeviceCode, WeakSessionManager>>,
    unresponsive: RwLock<HashSet<DeviceCode>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `manager` reachable under its device code.
    pub async fn attach(&self, manager: &SessionManager) {
        self.nodes
            .write()
            .await
            .insert(manager.local().clone(), manager.downgrade());
    }

    /// Makes `code` unreachable; existing sessions are unaffected.
    pub async fn detach(&self, code: &DeviceCode) {
        self.nodes.write().await.remove(code);
    }

    /// An unresponsive node never answers a dial.
    pub async fn set_unresponsive(&self, code: &DeviceCode, unresponsive: bool) {
        let mut set = self.unresponsive.write().await;
        if unresponsive {
            set.insert(code.clone());
        } else {
            set.remove(code);
        }
    }
}

impl PeerLink for MemoryNetwork {
    fn connect<'a>(
        &'a self,
        local: &'a DeviceCode,
        remote: &'a DeviceCode,
    ) -> BoxFuture<'a, Result<PeerChannel, SessionError>> {
        Box::pin(async move {
            if self.unresponsive.read().await.contains(remote) {
                std::future::pending::<()>().await;
            }

            let target = self
                .nodes
                .read()
                .await
                .get(remote)
                .and_then(|weak| weak.upgrade())
                .ok_or_else(|| SessionError::PeerUnavailable {
                    peer: remote.clone(),
                    reason: "not on this network".to_string(),
                })?;

            let (ours, theirs) = PeerChannel::pair();
            target.accept(local.clone(), theirs).await?;
            Ok(ours)
        })
    }
}

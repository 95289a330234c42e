//! Session bookkeeping: connect, accept, send, and a single teardown path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{PeerChannel, PeerLink, SessionError};
use crate::models::DeviceCode;
use crate::protocol::PeerMessage;

/// Default bound on how long `connect` may take, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(DeviceCode),
    Disconnected(DeviceCode),
}

/// Everything the router consumes, from all sessions, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Message {
        from: DeviceCode,
        message: PeerMessage,
    },
    /// The session with `peer` is gone; fires once per session.
    Closed { peer: DeviceCode },
}

/// Outcome of [`SessionManager::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub success_count: usize,
    pub error_count: usize,
}

struct Session {
    generation: u64,
    outbound: mpsc::Sender<PeerMessage>,
    reader: JoinHandle<()>,
}

struct Inner {
    local: DeviceCode,
    link: Arc<dyn PeerLink>,
    config: SessionConfig,
    sessions: Mutex<HashMap<DeviceCode, Session>>,
    dialing: Mutex<HashSet<DeviceCode>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

/// Owns every live session of one device.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by links that need to call back into a manager.
#[derive(Clone)]
pub struct WeakSessionManager {
    inner: Weak<Inner>,
}

impl WeakSessionManager {
    pub fn upgrade(&self) -> Option<SessionManager> {
        self.inner.upgrade().map(|inner| SessionManager { inner })
    }
}

impl SessionManager {
    /// Creates a manager for `local` and returns the receiving end of its inbound queue.
    pub fn new(
        local: DeviceCode,
        link: Arc<dyn PeerLink>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let manager = Self {
            inner: Arc::new(Inner {
                local,
                link,
                config,
                sessions: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                next_generation: AtomicU64::new(1),
                events,
                inbound: inbound_tx,
            }),
        };
        (manager, inbound_rx)
    }

    pub fn local(&self) -> &DeviceCode {
        &self.inner.local
    }

    pub fn downgrade(&self) -> WeakSessionManager {
        WeakSessionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Dials `address` through the link and registers the session.
    pub async fn connect(&self, address: &DeviceCode) -> Result<(), SessionError> {
        if address == &self.inner.local {
            return Err(SessionError::SelfConnect(address.clone()));
        }
        if self.is_connected(address).await {
            return Err(SessionError::AlreadyConnected(address.clone()));
        }
        if !self.inner.dialing.lock().await.insert(address.clone()) {
            return Err(SessionError::AlreadyConnected(address.clone()));
        }

        tracing::debug!("Connecting to {}", address);
        let dialed = tokio::time::timeout(
            self.inner.config.connect_timeout,
            self.inner.link.connect(&self.inner.local, address),
        )
        .await;

        self.inner.dialing.lock().await.remove(address);

        let channel = match dialed {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                tracing::warn!("Connecting to {} failed: {}", address, e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("Connecting to {} timed out", address);
                return Err(SessionError::Timeout(address.clone()));
            }
        };

        self.register(address.clone(), channel).await
    }

    /// Registers a session opened by the remote side.
    pub async fn accept(&self, remote: DeviceCode, channel: PeerChannel) -> Result<(), SessionError> {
        if remote == self.inner.local {
            return Err(SessionError::SelfConnect(remote));
        }
        self.register(remote, channel).await
    }

    async fn register(&self, remote: DeviceCode, channel: PeerChannel) -> Result<(), SessionError> {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(&remote) {
            return Err(SessionError::AlreadyConnected(remote));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let reader = tokio::spawn(forward_inbound(
            Arc::downgrade(&self.inner),
            remote.clone(),
            generation,
            channel.inbound,
        ));
        sessions.insert(
            remote.clone(),
            Session {
                generation,
                outbound: channel.outbound,
                reader,
            },
        );
        drop(sessions);

        tracing::info!("Session with {} established", remote);
        let _ = self.inner.events.send(ConnectionEvent::Connected(remote));
        Ok(())
    }

    /// Queues `message` for `address`. Messages to one peer keep their order.
    pub async fn send(&self, address: &DeviceCode, message: PeerMessage) -> Result<(), SessionError> {
        let outbound = {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(address) {
                Some(session) => session.outbound.clone(),
                None => return Err(SessionError::NotConnected(address.clone())),
            }
        };

        outbound
            .send(message)
            .await
            .map_err(|_| SessionError::ConnectionClosed(address.clone()))
    }

    /// Sends `message` to every connected peer.
    pub async fn broadcast(&self, message: PeerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.connected_peers().await {
            match self.send(&peer, message.clone()).await {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    tracing::warn!("Broadcast to {} failed: {}", peer, e);
                    report.error_count += 1;
                }
            }
        }
        report
    }

    /// Waits until every message queued for `address` has been taken by its
    /// link. Returns at once when there is no session.
    pub async fn flush(&self, address: &DeviceCode) {
        loop {
            let idle = match self.inner.sessions.lock().await.get(address) {
                Some(session) => session.outbound.capacity() == session.outbound.max_capacity(),
                None => true,
            };
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Closes the session with `address`, if any.
    pub async fn disconnect(&self, address: &DeviceCode) {
        self.inner.close(address, None).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Connected peers, sorted by code.
    pub async fn connected_peers(&self) -> Vec<DeviceCode> {
        let mut peers: Vec<DeviceCode> = self.inner.sessions.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn is_connected(&self, address: &DeviceCode) -> bool {
        self.inner.sessions.lock().await.contains_key(address)
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        for peer in self.connected_peers().await {
            self.inner.close(&peer, None).await;
        }
    }
}

impl Inner {
    /// The one teardown path. With a generation, only that exact session is
    /// closed, so a late reader exit cannot tear down a newer session.
    async fn close(&self, peer: &DeviceCode, generation: Option<u64>) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match (sessions.get(peer), generation) {
                (Some(session), Some(generation)) if session.generation != generation => None,
                (Some(_), _) => sessions.remove(peer),
                (None, _) => None,
            }
        };

        let Some(session) = removed else {
            return;
        };

        // The reader calls in here itself when it finishes; only stop it on explicit closes.
        if generation.is_none() {
            session.reader.abort();
        }
        drop(session.outbound);

        tracing::info!("Session with {} closed", peer);
        let _ = self.events.send(ConnectionEvent::Disconnected(peer.clone()));
        let _ = self.inbound.send(Inbound::Closed { peer: peer.clone() });
    }
}

async fn forward_inbound(
    inner: Weak<Inner>,
    peer: DeviceCode,
    generation: u64,
    mut inbound: mpsc::Receiver<PeerMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tracing::debug!("Received {} from {}", message.kind(), peer);
        if inner
            .inbound
            .send(Inbound::Message {
                from: peer.clone(),
                message,
            })
            .is_err()
        {
            break;
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.close(&peer, Some(generation)).await;
    }
}

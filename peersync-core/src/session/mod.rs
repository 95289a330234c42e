//! Peer sessions: one live channel per remote device.
//!
//! A [`SessionManager`] owns every open session. Links are pluggable through
//! [`PeerLink`]: [`WsLink`] dials peers over WebSocket and [`MemoryNetwork`]
//! connects managers inside one process.

mod frame;
mod link;
mod manager;
mod memory;
mod ws;

use thiserror::Error;

use crate::models::DeviceCode;

pub use frame::{bridge_frames, Frame};
pub use link::{PeerChannel, PeerLink, CHANNEL_DEPTH};
pub use manager::{
    BroadcastReport, ConnectionEvent, Inbound, SessionConfig, SessionManager, WeakSessionManager,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use memory::MemoryNetwork;
pub use ws::{bridge_socket, check_peer, http_url, ws_url, PeerDirectory, WsLink, HANDSHAKE_TIMEOUT};

/// Errors opening or using a peer session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Peer {peer} is unavailable: {reason}")]
    PeerUnavailable { peer: DeviceCode, reason: String },

    #[error("Timed out connecting to {0}")]
    Timeout(DeviceCode),

    #[error("Already connected to {0}")]
    AlreadyConnected(DeviceCode),

    #[error("Refusing to connect to own device {0}")]
    SelfConnect(DeviceCode),

    #[error("Not connected to {0}")]
    NotConnected(DeviceCode),

    #[error("Connection to {0} closed")]
    ConnectionClosed(DeviceCode),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

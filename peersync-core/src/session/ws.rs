//! WebSocket link to peer nodes.
//!
//! Each session is one WebSocket on the peer's `/peer` endpoint:
//! 1. The dialing side sends `hello` with its device code
//! 2. The accepting side answers with its own `hello`
//! 3. Afterwards every frame carries one message, CBOR on binary frames
//!    (JSON text frames are accepted too)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;

use super::frame::{bridge_frames, Frame};
use super::{PeerChannel, PeerLink, SessionError};
use crate::models::DeviceCode;
use crate::protocol::PeerMessage;

/// Timeout for the `hello` exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps device codes to the base URL of their node.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    entries: Arc<RwLock<HashMap<DeviceCode, String>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, code: DeviceCode, url: impl Into<String>) {
        self.entries.write().await.insert(code, url.into());
    }

    pub async fn get(&self, code: &DeviceCode) -> Option<String> {
        self.entries.read().await.get(code).cloned()
    }

    /// All entries, sorted by code.
    pub async fn entries(&self) -> Vec<(DeviceCode, String)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(code, url)| (code.clone(), url.clone()))
            .collect();
        entries.sort();
        entries
    }
}

impl FromIterator<(DeviceCode, String)> for PeerDirectory {
    fn from_iter<I: IntoIterator<Item = (DeviceCode, String)>>(entries: I) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries.into_iter().collect())),
        }
    }
}

/// Dials peers listed in a [`PeerDirectory`].
#[derive(Debug, Clone)]
pub struct WsLink {
    directory: PeerDirectory,
}

impl WsLink {
    pub fn new(directory: PeerDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }
}

impl PeerLink for WsLink {
    fn connect<'a>(
        &'a self,
        local: &'a DeviceCode,
        remote: &'a DeviceCode,
    ) -> BoxFuture<'a, Result<PeerChannel, SessionError>> {
        Box::pin(async move {
            let base = self
                .directory
                .get(remote)
                .await
                .ok_or_else(|| SessionError::PeerUnavailable {
                    peer: remote.clone(),
                    reason: "no address known".to_string(),
                })?;

            let url = ws_url(&base);
            let (mut socket, _) =
                connect_async(&url)
                    .await
                    .map_err(|e| SessionError::PeerUnavailable {
                        peer: remote.clone(),
                        reason: e.to_string(),
                    })?;

            send_hello(&mut socket, local).await?;
            let announced = await_hello(&mut socket).await?;
            if &announced != remote {
                let _ = socket.close(None).await;
                return Err(SessionError::Handshake(format!(
                    "expected device {}, {} answered",
                    remote, announced
                )));
            }

            Ok(bridge_socket(socket, remote.clone()))
        })
    }
}

async fn send_hello<S>(socket: &mut S, local: &DeviceCode) -> Result<(), SessionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let hello = PeerMessage::Hello {
        device_code: local.clone(),
    };
    let encoded = hello
        .encode()
        .map_err(|e| SessionError::Handshake(e.to_string()))?;
    socket
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SessionError::Handshake(e.to_string()))
}

/// Waits for the remote `hello`, bounded by [`HANDSHAKE_TIMEOUT`].
async fn await_hello<S>(socket: &mut S) -> Result<DeviceCode, SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let answer = timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(frame) = socket.next().await {
            let frame = frame_of(frame.map_err(|e| SessionError::Handshake(e.to_string()))?);
            if frame == Frame::Close {
                return Err(SessionError::Handshake(
                    "peer closed connection during handshake".to_string(),
                ));
            }
            let Some(message) = frame.decode() else {
                continue;
            };

            return match message {
                Ok(PeerMessage::Hello { device_code }) => Ok(device_code),
                Ok(other) => Err(SessionError::Handshake(format!(
                    "unexpected {} during handshake",
                    other.kind()
                ))),
                Err(e) => Err(SessionError::Handshake(e.to_string())),
            };
        }
        Err(SessionError::Handshake(
            "connection closed before handshake completed".to_string(),
        ))
    })
    .await;

    answer.unwrap_or_else(|_| Err(SessionError::Handshake("timed out".to_string())))
}

/// Turns an established tungstenite socket into a [`PeerChannel`].
pub fn bridge_socket<S>(socket: S, peer: DeviceCode) -> PeerChannel
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
{
    bridge_frames(socket, peer, frame_of, message_of)
}

fn frame_of(message: Message) -> Frame {
    match message {
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Close(_) => Frame::Close,
        _ => Frame::Control,
    }
}

fn message_of(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close => Message::Close(None),
        Frame::Control => Message::Pong(Default::default()),
    }
}

/// WebSocket URL of a node's peer endpoint.
pub fn ws_url(base: &str) -> String {
    let base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !base.starts_with("ws://") && !base.starts_with("wss://") {
        format!("ws://{}", base)
    } else {
        base.to_string()
    };

    format!("{}/peer", base.trim_end_matches('/'))
}

/// HTTP URL for `path` on a node.
pub fn http_url(base: &str, path: &str) -> String {
    let base = if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !base.starts_with("http://") && !base.starts_with("https://") {
        format!("http://{}", base)
    } else {
        base.to_string()
    };

    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Checks a node's `/health` endpoint.
pub async fn check_peer(peer: &DeviceCode, base: &str) -> Result<(), SessionError> {
    let unavailable = |reason: String| SessionError::PeerUnavailable {
        peer: peer.clone(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| unavailable(e.to_string()))?;

    let response = client
        .get(http_url(base, "/health"))
        .send()
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(unavailable(format!("health check returned {}", response.status())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("http://localhost:8080"), "ws://localhost:8080/peer");
        assert_eq!(ws_url("https://node.lan/"), "wss://node.lan/peer");
        assert_eq!(ws_url("10.0.0.2:7070"), "ws://10.0.0.2:7070/peer");
        assert_eq!(ws_url("ws://10.0.0.2:7070"), "ws://10.0.0.2:7070/peer");
    }

    #[test]
    fn test_http_url() {
        assert_eq!(http_url("ws://localhost:8080", "/health"), "http://localhost:8080/health");
        assert_eq!(http_url("wss://node.lan", "/health"), "https://node.lan/health");
        assert_eq!(http_url("node.lan:1", "/health"), "http://node.lan:1/health");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unavailable() {
        let link = WsLink::new(PeerDirectory::new());
        let local: DeviceCode = "000001".parse().unwrap();
        let remote: DeviceCode = "000002".parse().unwrap();

        let err = link.connect(&local, &remote).await.unwrap_err();
        assert!(matches!(err, SessionError::PeerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_directory_entries_sorted() {
        let directory = PeerDirectory::new();
        directory.insert("222222".parse().unwrap(), "b:1").await;
        directory.insert("111111".parse().unwrap(), "a:1").await;

        let entries = directory.entries().await;
        assert_eq!(entries[0].1, "a:1");
        assert_eq!(entries[1].1, "b:1");
    }

    #[tokio::test]
    async fn test_check_peer_unreachable() {
        let peer: DeviceCode = "000003".parse().unwrap();
        let result = check_peer(&peer, "http://127.0.0.1:1").await;
        assert!(matches!(result, Err(SessionError::PeerUnavailable { .. })));
    }
}

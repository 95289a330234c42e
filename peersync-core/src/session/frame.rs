//! Frame pump shared by every WebSocket flavour.
//!
//! The dialing side runs on tokio-tungstenite and the accepting side on
//! axum; both map their message type onto [`Frame`] and hand the socket to
//! [`bridge_frames`].

use std::fmt::Display;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use super::{PeerChannel, CHANNEL_DEPTH};
use crate::models::DeviceCode;
use crate::protocol::{CodecError, PeerMessage};

/// A WebSocket frame as far as the peer protocol cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Close,
    /// Ping, pong and anything else without a payload for us.
    Control,
}

impl Frame {
    /// Decodes the message carried by a data frame; `None` for the rest.
    pub fn decode(&self) -> Option<Result<PeerMessage, CodecError>> {
        match self {
            Frame::Binary(data) => Some(PeerMessage::decode(data)),
            Frame::Text(text) => Some(PeerMessage::from_json(text)),
            Frame::Close | Frame::Control => None,
        }
    }
}

/// Turns a socket of `M` frames into a [`PeerChannel`].
///
/// `to_frame` and `from_frame` convert between the socket's message type and
/// [`Frame`]. Two tasks pump frames; the inbound side ends when the socket
/// closes or errors, and the socket is closed once the outbound sender is
/// dropped.
pub fn bridge_frames<S, M, E>(
    socket: S,
    peer: DeviceCode,
    to_frame: fn(M) -> Frame,
    from_frame: fn(Frame) -> M,
) -> PeerChannel
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<PeerMessage>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<PeerMessage>(CHANNEL_DEPTH);

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let encoded = match message.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!("Dropping unencodable {} for {}: {}", message.kind(), writer_peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(from_frame(Frame::Binary(encoded))).await {
                tracing::debug!("Write to {} failed: {}", writer_peer, e);
                return;
            }
        }
        let _ = sink.send(from_frame(Frame::Close)).await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(message) => to_frame(message),
                Err(e) => {
                    tracing::debug!("Read from {} failed: {}", peer, e);
                    break;
                }
            };
            if frame == Frame::Close {
                break;
            }

            match frame.decode() {
                Some(Ok(message)) => {
                    if in_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => tracing::warn!("Ignoring malformed frame from {}: {}", peer, e),
                None => continue,
            }
        }
    });

    PeerChannel {
        outbound: out_tx,
        inbound: in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// One end of an in-memory socket carrying [`Frame`]s.
    struct Pipe {
        tx: fmpsc::UnboundedSender<Frame>,
        rx: fmpsc::UnboundedReceiver<Frame>,
    }

    fn pipe() -> (Pipe, Pipe) {
        let (a_tx, b_rx) = fmpsc::unbounded();
        let (b_tx, a_rx) = fmpsc::unbounded();
        (Pipe { tx: a_tx, rx: a_rx }, Pipe { tx: b_tx, rx: b_rx })
    }

    impl Stream for Pipe {
        type Item = Result<Frame, fmpsc::SendError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.rx).poll_next(cx).map(|frame| frame.map(Ok))
        }
    }

    impl Sink<Frame> for Pipe {
        type Error = fmpsc::SendError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.tx).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
            Pin::new(&mut self.tx).start_send(item)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.tx).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.tx).poll_close(cx)
        }
    }

    fn same(frame: Frame) -> Frame {
        frame
    }

    fn complete(timestamp: i64) -> PeerMessage {
        PeerMessage::SyncComplete {
            timestamp,
            sync_id: None,
        }
    }

    #[tokio::test]
    async fn test_bridge_frames_both_directions() {
        let (local, mut remote) = pipe();
        let peer: DeviceCode = "000002".parse().unwrap();
        let mut channel = bridge_frames(local, peer, same, same);

        channel.outbound.send(complete(7)).await.unwrap();
        let sent = remote.next().await.unwrap().unwrap();
        assert_eq!(sent.decode().unwrap().unwrap(), complete(7));

        // Control frames and garbage are skipped; JSON text is accepted.
        remote.send(Frame::Control).await.unwrap();
        remote.send(Frame::Binary(vec![0xff, 0x00])).await.unwrap();
        let json = complete(9).to_json().unwrap();
        remote.send(Frame::Text(json)).await.unwrap();
        assert_eq!(channel.inbound.recv().await.unwrap(), complete(9));
    }

    #[tokio::test]
    async fn test_bridge_frames_closes_with_socket() {
        let (local, mut remote) = pipe();
        let peer: DeviceCode = "000002".parse().unwrap();
        let mut channel = bridge_frames(local, peer, same, same);

        remote.send(Frame::Close).await.unwrap();
        assert!(channel.inbound.recv().await.is_none());

        drop(channel.outbound);
        assert_eq!(remote.next().await.unwrap().unwrap(), Frame::Close);
    }
}

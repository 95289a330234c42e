use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::SessionError;
use crate::models::DeviceCode;
use crate::protocol::PeerMessage;

/// Buffered messages per direction of a channel.
pub const CHANNEL_DEPTH: usize = 256;

/// Both directions of an established session.
///
/// The inbound receiver yielding `None` means the remote side is gone.
#[derive(Debug)]
pub struct PeerChannel {
    pub outbound: mpsc::Sender<PeerMessage>,
    pub inbound: mpsc::Receiver<PeerMessage>,
}

impl PeerChannel {
    /// Two channels wired back to back: what one sends, the other receives.
    pub fn pair() -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            PeerChannel {
                outbound: a_tx,
                inbound: b_rx,
            },
            PeerChannel {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Transport able to open a session to a device by code.
pub trait PeerLink: Send + Sync {
    /// Opens a channel from `local` to `remote`, including any handshake.
    fn connect<'a>(
        &'a self,
        local: &'a DeviceCode,
        remote: &'a DeviceCode,
    ) -> BoxFuture<'a, Result<PeerChannel, SessionError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_cross_wired() {
        let (mut left, mut right) = PeerChannel::pair();

        left.outbound
            .send(PeerMessage::Phase1Complete {
                sync_id: "a".into(),
            })
            .await
            .unwrap();
        assert_eq!(right.inbound.recv().await.unwrap().kind(), "phase1_complete");

        drop(right);
        assert!(left.inbound.recv().await.is_none());
    }
}

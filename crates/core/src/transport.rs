//! The seam between the session engine and a concrete streaming provider.

use crate::error::EngineError;
use crate::events::{ClientEvent, ServerEvent, SessionSetup};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// An open, confirmed connection seen as a pair of event channels.
#[derive(Debug)]
pub struct LiveLink {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// The provider side of a [`LiveLink`].
#[derive(Debug)]
pub struct LinkPeer {
    pub outbound: mpsc::Receiver<ClientEvent>,
    pub inbound: mpsc::Sender<ServerEvent>,
}

impl LiveLink {
    /// Creates a connected link and the peer a provider drives.
    pub fn pair(capacity: usize) -> (LiveLink, LinkPeer) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            LiveLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            LinkPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// Best-effort close: ends the audio stream, then asks the peer to close.
    pub fn close(self) {
        for event in [ClientEvent::AudioStreamEnd, ClientEvent::Close] {
            if let Err(e) = self.outbound.try_send(event) {
                debug!(error = %e, "Could not deliver close event; link already gone");
            }
        }
    }
}

/// Opens connections to a live conversational model.
///
/// `connect` resolves once the remote confirmed the handshake. Implementations
/// must keep delivering inbound events in arrival order.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveLink, EngineError>;
}

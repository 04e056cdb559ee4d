//! Overlay collaborator primitives.
//!
//! The [`Overlay`] trait is the send side; [`OverlayEvent`]s arrive on a
//! channel owned by whoever drives the node. Delivery is fire-and-forget:
//! a successful `send` means the message left this node, nothing more.

use libp2p::PeerId;

use crate::NetworkError;

/// Overlay message id of a gossiped record envelope.
pub const GOSSIP_RECORD_MESSAGE_ID: u8 = 13;

#[async_trait::async_trait]
pub trait Overlay: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Peers with a live connection.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Send an application message.
    async fn send(&self, peer: &PeerId, message_id: u8, payload: Vec<u8>)
        -> Result<(), NetworkError>;

    /// Send an introduction handshake carrying `extra` extension bytes.
    async fn send_handshake(&self, peer: &PeerId, extra: Vec<u8>) -> Result<(), NetworkError>;
}

/// Inbound overlay events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Connection to a peer was established.
    PeerConnected(PeerId),
    /// Connection to a peer was closed.
    PeerDisconnected(PeerId),
    /// A peer introduced itself; `extra` holds extension bytes (possibly empty).
    Handshake { from: PeerId, extra: Vec<u8> },
    /// An application message.
    Message {
        from: PeerId,
        message_id: u8,
        payload: Vec<u8>,
    },
}

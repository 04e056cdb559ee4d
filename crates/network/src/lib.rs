//! Encore Network
//!
//! The overlay as payout coordination sees it. Provides:
//! - [`Overlay`] collaborator trait and inbound [`OverlayEvent`]s
//! - Handshake extension codec and [`PayoutNodeDiscovery`]
//! - [`RecordLog`], the shared append-only log gossip reads from
//! - [`LocalNetwork`], an in-process overlay for tests and local runs

pub mod discovery;
pub mod error;
pub mod handshake;
pub mod local;
pub mod overlay;
pub mod records;

pub use discovery::{PayoutNode, PayoutNodeDiscovery};
pub use error::NetworkError;
pub use handshake::DiscoveryTag;
pub use local::{LocalNetwork, LocalOverlay};
pub use overlay::{Overlay, OverlayEvent, GOSSIP_RECORD_MESSAGE_ID};
pub use records::{publish_record, read_records, MemoryRecordLog, RecordLog};

/// Re-export libp2p identity types used across Encore crates
pub use libp2p::{Multiaddr, PeerId};

/// Fresh random peer identity.
pub fn random_peer_id() -> PeerId {
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    PeerId::from(keypair.public())
}

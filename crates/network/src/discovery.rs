//! Payout-node discovery piggybacked on the introduction handshake.
//!
//! A payout node tags every outgoing handshake with its identity and
//! settlement address. A node that has not found one tags its handshakes as
//! looking. A node that knows the payout node (or is it) answers a looking
//! peer once with a relayed [`DiscoveryTag::IsPayoutNode`], so the payout node
//! spreads hop by hop without a directory.
//!
//! The first payout node learned wins for the lifetime of the session.

use std::collections::HashSet;
use std::sync::Mutex;

use libp2p::PeerId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::handshake::DiscoveryTag;
use crate::overlay::{Overlay, OverlayEvent};
use crate::NetworkError;

/// A resolved payout node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutNode {
    pub peer_id: PeerId,
    pub settlement_address: String,
}

impl PayoutNode {
    fn tag(&self) -> DiscoveryTag {
        DiscoveryTag::IsPayoutNode {
            node: self.peer_id,
            settlement_address: self.settlement_address.clone(),
        }
    }
}

pub struct PayoutNodeDiscovery {
    local_peer: PeerId,
    is_payout_node: bool,
    /// Peers we already answered with a relayed tag.
    relayed: Mutex<HashSet<PeerId>>,
    known: watch::Sender<Option<PayoutNode>>,
}

impl PayoutNodeDiscovery {
    /// Discovery for a node that is searching.
    pub fn new(local_peer: PeerId) -> Self {
        let (known, _) = watch::channel(None);
        Self {
            local_peer,
            is_payout_node: false,
            relayed: Mutex::new(HashSet::new()),
            known,
        }
    }

    /// Discovery for the payout node itself; resolved from the start.
    /// Fails when the settlement address cannot be advertised.
    pub fn for_payout_node(local_peer: PeerId, settlement_address: &str) -> Result<Self, NetworkError> {
        let node = PayoutNode {
            peer_id: local_peer,
            settlement_address: settlement_address.to_string(),
        };
        node.tag().to_bytes()?;
        let (known, _) = watch::channel(Some(node));
        Ok(Self {
            local_peer,
            is_payout_node: true,
            relayed: Mutex::new(HashSet::new()),
            known,
        })
    }

    pub fn is_payout_node(&self) -> bool {
        self.is_payout_node
    }

    pub fn payout_node(&self) -> Option<PayoutNode> {
        self.known.borrow().clone()
    }

    /// Watch the resolution; it changes at most once, from `None` to `Some`.
    pub fn subscribe(&self) -> watch::Receiver<Option<PayoutNode>> {
        self.known.subscribe()
    }

    pub async fn wait_for_payout_node(&self) -> Result<PayoutNode, NetworkError> {
        let mut rx = self.known.subscribe();
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NetworkError::DiscoveryStopped)?;
        resolved.clone().ok_or(NetworkError::DiscoveryStopped)
    }

    /// Extension bytes for an outgoing handshake; empty when there is nothing to say.
    pub fn outgoing_extension(&self) -> Vec<u8> {
        if self.is_payout_node {
            return self
                .payout_node()
                .map(|node| tag_bytes(&node.tag()))
                .unwrap_or_default();
        }
        match self.payout_node() {
            None => tag_bytes(&DiscoveryTag::LookingForPayoutNode),
            Some(_) => Vec::new(),
        }
    }

    /// Process a peer's handshake extension. Returns extension bytes to send
    /// back to `from` when it asked for the payout node and we can answer.
    pub fn on_handshake(&self, from: PeerId, extra: &[u8]) -> Option<Vec<u8>> {
        let tag = match DiscoveryTag::from_bytes(extra) {
            Ok(Some(tag)) => tag,
            Ok(None) => return None,
            Err(e) => {
                warn!("Ignoring handshake from {}: {}", from, e);
                return None;
            }
        };

        match tag {
            DiscoveryTag::IsPayoutNode {
                node,
                settlement_address,
            } => {
                self.learn(PayoutNode {
                    peer_id: node,
                    settlement_address,
                });
                None
            }
            DiscoveryTag::LookingForPayoutNode => {
                let known = self.payout_node()?;
                if known.peer_id == from {
                    return None;
                }
                let first_ask = self
                    .relayed
                    .lock()
                    .map(|mut relayed| relayed.insert(from))
                    .unwrap_or(false);
                if !first_ask {
                    debug!("Already told {} about the payout node", from);
                    return None;
                }
                debug!("Relaying payout node {} to {}", known.peer_id, from);
                let reply = tag_bytes(&known.tag());
                (!reply.is_empty()).then_some(reply)
            }
        }
    }

    fn learn(&self, node: PayoutNode) {
        if node.peer_id == self.local_peer && !self.is_payout_node {
            warn!("Peer claims we are the payout node; ignoring");
            return;
        }
        let changed = self.known.send_if_modified(|known| match known {
            Some(existing) => {
                if existing.peer_id != node.peer_id {
                    debug!(
                        "Ignoring payout node {}; already using {}",
                        node.peer_id, existing.peer_id
                    );
                }
                false
            }
            None => {
                *known = Some(node.clone());
                true
            }
        });
        if changed {
            info!(
                "Discovered payout node {} (settlement address {})",
                node.peer_id, node.settlement_address
            );
        }
    }

    /// Drive discovery from an overlay event: tag handshakes to new peers and
    /// answer peers that are looking.
    pub async fn handle_event(&self, overlay: &dyn Overlay, event: &OverlayEvent) {
        let (peer, extra) = match event {
            OverlayEvent::PeerConnected(peer) => (*peer, self.outgoing_extension()),
            OverlayEvent::Handshake { from, extra } => match self.on_handshake(*from, extra) {
                Some(reply) => (*from, reply),
                None => return,
            },
            _ => return,
        };
        if extra.is_empty() {
            return;
        }
        if let Err(e) = overlay.send_handshake(&peer, extra).await {
            warn!("Failed to send handshake to {}: {}", peer, e);
        }
    }
}

/// Encoded tag, or no extension when it does not fit the wire format.
fn tag_bytes(tag: &DiscoveryTag) -> Vec<u8> {
    tag.to_bytes().unwrap_or_else(|e| {
        warn!("Cannot encode discovery tag: {}", e);
        Vec::new()
    })
}

//! In-process overlay.
//!
//! A [`LocalNetwork`] hub connects any number of [`LocalOverlay`] nodes with
//! explicit links. Each node receives its [`OverlayEvent`]s on an unbounded
//! channel, exactly as a real transport's event loop would hand them out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::overlay::{Overlay, OverlayEvent};
use crate::{random_peer_id, NetworkError};

#[derive(Default)]
struct Hub {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<OverlayEvent>>,
    links: HashSet<(PeerId, PeerId)>,
}

impl Hub {
    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&link(a, b))
    }

    fn deliver(&self, to: &PeerId, event: OverlayEvent) -> Result<(), NetworkError> {
        let inbox = self
            .inboxes
            .get(to)
            .ok_or(NetworkError::PeerNotConnected(*to))?;
        inbox
            .send(event)
            .map_err(|_| NetworkError::InboxClosed(*to))
    }
}

fn link(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

/// Hub shared by every node of an in-process overlay.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with a fresh identity.
    pub fn join(&self) -> (LocalOverlay, mpsc::UnboundedReceiver<OverlayEvent>) {
        self.join_as(random_peer_id())
    }

    pub fn join_as(&self, peer: PeerId) -> (LocalOverlay, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(peer, tx);
        debug!("Local node {} joined", peer);
        (
            LocalOverlay {
                local: peer,
                hub: self.hub.clone(),
            },
            rx,
        )
    }

    /// Link two nodes; both see [`OverlayEvent::PeerConnected`].
    pub fn connect(&self, a: &PeerId, b: &PeerId) -> Result<(), NetworkError> {
        let mut hub = self.lock();
        if !hub.links.insert(link(a, b)) {
            return Ok(());
        }
        hub.deliver(a, OverlayEvent::PeerConnected(*b))?;
        hub.deliver(b, OverlayEvent::PeerConnected(*a))?;
        Ok(())
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut hub = self.lock();
        if hub.links.remove(&link(a, b)) {
            let _ = hub.deliver(a, OverlayEvent::PeerDisconnected(*b));
            let _ = hub.deliver(b, OverlayEvent::PeerDisconnected(*a));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalOverlay {
    local: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl LocalOverlay {
    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_event(&self, peer: &PeerId, event: OverlayEvent) -> Result<(), NetworkError> {
        let hub = self.hub();
        if !hub.linked(&self.local, peer) {
            return Err(NetworkError::PeerNotConnected(*peer));
        }
        hub.deliver(peer, event)
    }
}

#[async_trait::async_trait]
impl Overlay for LocalOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let hub = self.hub();
        hub.links
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.local {
                    Some(*b)
                } else if *b == self.local {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn send(
        &self,
        peer: &PeerId,
        message_id: u8,
        payload: Vec<u8>,
    ) -> Result<(), NetworkError> {
        trace!("{} -> {}: message {} ({} bytes)", self.local, peer, message_id, payload.len());
        self.send_event(
            peer,
            OverlayEvent::Message {
                from: self.local,
                message_id,
                payload,
            },
        )
    }

    async fn send_handshake(&self, peer: &PeerId, extra: Vec<u8>) -> Result<(), NetworkError> {
        trace!("{} -> {}: handshake ({} extension bytes)", self.local, peer, extra.len());
        self.send_event(
            peer,
            OverlayEvent::Handshake {
                from: self.local,
                extra,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PayoutNodeDiscovery;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_and_send() {
        let net = LocalNetwork::new();
        let (a, mut a_rx) = net.join();
        let (b, mut b_rx) = net.join();
        let (c, _c_rx) = net.join();

        net.connect(&a.local_peer_id(), &b.local_peer_id()).unwrap();
        assert_eq!(a_rx.recv().await, Some(OverlayEvent::PeerConnected(b.local_peer_id())));
        assert_eq!(b_rx.recv().await, Some(OverlayEvent::PeerConnected(a.local_peer_id())));
        assert_eq!(a.connected_peers(), vec![b.local_peer_id()]);

        a.send(&b.local_peer_id(), 12, vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(OverlayEvent::Message {
                from: a.local_peer_id(),
                message_id: 12,
                payload: vec![1, 2, 3]
            })
        );

        let err = a.send(&c.local_peer_id(), 12, vec![]).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotConnected(_)));

        net.disconnect(&a.local_peer_id(), &b.local_peer_id());
        assert!(a.connected_peers().is_empty());
        assert_eq!(
            a_rx.recv().await,
            Some(OverlayEvent::PeerDisconnected(b.local_peer_id()))
        );
    }

    /// Drive a node's discovery from its inbox until the inbox closes.
    fn spawn_discovery(
        overlay: LocalOverlay,
        mut rx: mpsc::UnboundedReceiver<OverlayEvent>,
        discovery: Arc<PayoutNodeDiscovery>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                discovery.handle_event(&overlay, &event).await;
            }
        });
    }

    #[tokio::test]
    async fn test_discovery_relay_x_y_z() {
        let net = LocalNetwork::new();
        let (x, x_rx) = net.join();
        let (y, y_rx) = net.join();
        let (z, z_rx) = net.join();
        let x_id = x.local_peer_id();
        let (y_id, z_id) = (y.local_peer_id(), z.local_peer_id());

        let xd = Arc::new(PayoutNodeDiscovery::for_payout_node(x_id, "addr-x").unwrap());
        let yd = Arc::new(PayoutNodeDiscovery::new(y_id));
        let zd = Arc::new(PayoutNodeDiscovery::new(z_id));
        spawn_discovery(x, x_rx, xd);
        spawn_discovery(y, y_rx, yd.clone());
        spawn_discovery(z, z_rx, zd.clone());

        net.connect(&x_id, &y_id).unwrap();
        let found = tokio::time::timeout(Duration::from_secs(5), yd.wait_for_payout_node())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.peer_id, x_id);

        // Z never talks to X directly.
        net.connect(&y_id, &z_id).unwrap();
        let found = tokio::time::timeout(Duration::from_secs(5), zd.wait_for_payout_node())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.peer_id, x_id);
        assert_eq!(found.settlement_address, "addr-x");
    }
}

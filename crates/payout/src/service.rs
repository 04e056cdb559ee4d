//! Node event loop.
//!
//! Feeds overlay events to discovery, gossip ingestion and (on the payout
//! node) the coordinator, together with the wallet's funding and confirmation
//! streams, until shutdown.

use std::sync::Arc;

use encore_claim::CLAIM_MESSAGE_ID;
use encore_core::{ListenActivity, PayoutStatusUpdate};
use encore_gossip::{accept_gossip, GossipHandle, GossipScheduler};
use encore_network::{
    Overlay, OverlayEvent, PayoutNodeDiscovery, PeerId, RecordLog, GOSSIP_RECORD_MESSAGE_ID,
};
use encore_wallet::FundsReceived;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::coordinator::{ClaimOutcome, PayoutCoordinator};

pub struct PayoutNodeService {
    overlay: Arc<dyn Overlay>,
    discovery: Arc<PayoutNodeDiscovery>,
    records: Arc<dyn RecordLog>,
    config: NodeConfig,
    /// Present only on the payout node.
    coordinator: Option<Arc<PayoutCoordinator>>,
}

impl PayoutNodeService {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        discovery: Arc<PayoutNodeDiscovery>,
        records: Arc<dyn RecordLog>,
        config: NodeConfig,
    ) -> Self {
        Self {
            overlay,
            discovery,
            records,
            config,
            coordinator: None,
        }
    }

    /// Run as the payout node, settling claims through `coordinator`.
    pub fn with_coordinator(mut self, coordinator: Arc<PayoutCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn coordinator(&self) -> Option<&Arc<PayoutCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Process events until `shutdown` flips to `true` or the overlay closes.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<OverlayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Some(coordinator) = &self.coordinator {
            match coordinator.recover() {
                Ok(reverted) if !reverted.is_empty() => {
                    warn!("Reverted {} interrupted submission(s)", reverted.len())
                }
                Ok(_) => {}
                Err(e) => error!("Startup recovery failed: {}", e),
            }
        }

        let gossip = self.start_gossip();
        let (mut funds, mut confirmations) = match &self.coordinator {
            Some(c) => (
                Some(c.wallet().subscribe_funds_received()),
                Some(c.wallet().subscribe_confirmations()),
            ),
            None => (None, None),
        };
        let mut reconciling = JoinSet::new();

        info!(
            peer = %self.overlay.local_peer_id(),
            payout_node = self.coordinator.is_some(),
            "node service started"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Overlay closed");
                        break;
                    }
                },
                received = next_event(&mut funds) => {
                    if let (Some(funds), Some(coordinator)) = (received, &self.coordinator) {
                        reconciling.spawn(reconcile(coordinator.clone(), funds));
                    }
                }
                confirmed = next_event(&mut confirmations) => {
                    if let (Some(txid), Some(coordinator)) = (confirmed, &self.coordinator) {
                        reconciling.spawn(confirm(coordinator.clone(), txid));
                    }
                }
                Some(_) = reconciling.join_next(), if !reconciling.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        reconciling.abort_all();
        futures::future::join_all(gossip.into_iter().map(GossipHandle::shutdown)).await;
        info!("node service stopped");
    }

    fn start_gossip(&self) -> Vec<GossipHandle> {
        vec![
            GossipScheduler::<ListenActivity>::new(
                self.config.listen_gossip(),
                self.overlay.clone(),
                self.records.clone(),
            )
            .spawn(),
            GossipScheduler::<PayoutStatusUpdate>::new(
                self.config.payout_gossip(),
                self.overlay.clone(),
                self.records.clone(),
            )
            .spawn(),
        ]
    }

    async fn handle_event(&self, event: OverlayEvent) {
        self.discovery.handle_event(self.overlay.as_ref(), &event).await;

        match event {
            OverlayEvent::PeerConnected(peer) => debug!("Peer connected: {}", peer),
            OverlayEvent::PeerDisconnected(peer) => debug!("Peer disconnected: {}", peer),
            OverlayEvent::Handshake { .. } => {}
            OverlayEvent::Message {
                from,
                message_id,
                payload,
            } => match message_id {
                CLAIM_MESSAGE_ID => self.on_claim(from, &payload).await,
                GOSSIP_RECORD_MESSAGE_ID => {
                    if let Err(e) = accept_gossip(self.records.as_ref(), &payload) {
                        debug!("Dropped gossip from {}: {}", from, e);
                    }
                }
                other => debug!("Ignoring message id {} from {}", other, from),
            },
        }
    }

    async fn on_claim(&self, from: PeerId, payload: &[u8]) {
        let Some(coordinator) = &self.coordinator else {
            debug!("Not the payout node, dropping claim from {}", from);
            return;
        };
        let message = match encore_claim::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed claim from {}: {}", from, e);
                return;
            }
        };
        match coordinator.register_claim(&message, None).await {
            Ok(outcome) => debug!(tx = %message.tx_hash, ?outcome, "claim registered"),
            Err(e) => warn!(tx = %message.tx_hash, "Failed to register claim from {}: {}", from, e),
        }
    }
}

async fn reconcile(coordinator: Arc<PayoutCoordinator>, funds: FundsReceived) {
    match coordinator.on_funds_received(&funds).await {
        Ok(ClaimOutcome::Verified(verified)) => debug!(
            tx = %verified.tx_hash,
            payout = %verified.payout_id,
            "funds reconciled"
        ),
        Ok(outcome) => debug!(tx = %funds.tx_hash, ?outcome, "funds reconciled"),
        Err(e) => warn!(tx = %funds.tx_hash, "Failed to reconcile funds: {}", e),
    }
}

async fn confirm(coordinator: Arc<PayoutCoordinator>, txid: String) {
    if let Err(e) = coordinator.on_disbursement_confirmed(&txid).await {
        error!(txid = %txid, "Failed to complete payout: {}", e);
    }
}

/// Next value from an optional broadcast stream. Never resolves for `None`
/// or a closed channel; yields `None` after a lag so the caller loops again.
async fn next_event<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match inner.recv().await {
        Ok(value) => Some(value),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("Wallet event stream lagged, skipped {} events", n);
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            std::future::pending().await
        }
    }
}

//! Listener side of a contribution: fund the payout node, then tell it how to
//! split the money.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use encore_claim::{ClaimMessage, CodecError, CLAIM_MESSAGE_ID};
use encore_core::{ArtistSplits, GossipRecord, ListenActivity, Satoshis};
use encore_network::{publish_record, NetworkError, Overlay, PayoutNode, PayoutNodeDiscovery, RecordLog};
use encore_wallet::{Wallet, WalletError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ContributeError {
    #[error("no payout node discovered yet")]
    DiscoveryUnresolved,
    #[error("no listening activity to split")]
    NoActivity,
    #[error("invalid amount {0}")]
    InvalidAmount(Satoshis),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("wallet produced no transaction")]
    NoTransaction,
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("claim encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// A sent contribution.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub tx_hash: String,
    pub amount: Satoshis,
    pub claim: ClaimMessage,
    pub payout_node: PayoutNode,
}

/// Per-artist share of total listening time. Artists with no positive time
/// are left out; an empty result means nothing was listened to.
pub fn shares_from_listening<'a, I>(activity: I) -> ArtistSplits
where
    I: IntoIterator<Item = &'a ListenActivity>,
{
    let mut per_artist: BTreeMap<&str, i64> = BTreeMap::new();
    for entry in activity {
        if entry.listened_millis > 0 {
            *per_artist.entry(entry.artist_id.as_str()).or_default() += entry.listened_millis;
        }
    }
    let total: i64 = per_artist.values().sum();
    if total <= 0 {
        return ArtistSplits::new();
    }
    per_artist
        .into_iter()
        .map(|(artist, millis)| (artist.to_string(), (millis as f64 / total as f64) as f32))
        .collect()
}

pub struct Contributor {
    overlay: Arc<dyn Overlay>,
    wallet: Arc<dyn Wallet>,
    discovery: Arc<PayoutNodeDiscovery>,
    records: Arc<dyn RecordLog>,
    /// Activity since the last contribution.
    listened: Mutex<Vec<ListenActivity>>,
}

impl Contributor {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        wallet: Arc<dyn Wallet>,
        discovery: Arc<PayoutNodeDiscovery>,
        records: Arc<dyn RecordLog>,
    ) -> Self {
        Self {
            overlay,
            wallet,
            discovery,
            records,
            listened: Mutex::new(Vec::new()),
        }
    }

    /// Remember a listen and publish it to the record log for gossip.
    pub fn record_listen(&self, activity: ListenActivity) {
        if !activity.is_valid() {
            debug!(artist = %activity.artist_id, "ignoring invalid listen");
            return;
        }
        if let Err(e) = publish_record(self.records.as_ref(), &activity) {
            warn!("Failed to publish listening activity: {}", e);
        }
        self.listened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(activity);
    }

    /// Shares the next contribution would be split by.
    pub fn current_shares(&self) -> ArtistSplits {
        shares_from_listening(self.listened.lock().unwrap_or_else(|e| e.into_inner()).iter())
    }

    /// Pay `amount` to the payout node and send it the signed claim splitting
    /// that amount by recent listening.
    ///
    /// The listening the claim is built from is consumed; listens recorded
    /// while the payment is in flight count toward the next contribution. If
    /// no funding transaction is sent the consumed listening is restored.
    pub async fn contribute(&self, amount: Satoshis) -> Result<Contribution, ContributeError> {
        if amount <= 0 {
            return Err(ContributeError::InvalidAmount(amount));
        }
        let node = self
            .discovery
            .payout_node()
            .ok_or(ContributeError::DiscoveryUnresolved)?;

        let consumed = std::mem::take(&mut *self.listened.lock().unwrap_or_else(|e| e.into_inner()));
        let splits = shares_from_listening(&consumed);
        if splits.is_empty() {
            self.restore_listened(consumed);
            return Err(ContributeError::NoActivity);
        }
        // Artist ids must fit the wire format before any money moves.
        if let Err(e) = encore_claim::encode(&ClaimMessage::new("", splits.clone())) {
            self.restore_listened(consumed);
            return Err(e.into());
        }

        let tx_hash = match self.wallet.send(&node.settlement_address, amount).await {
            Ok(Some(tx_hash)) => tx_hash,
            Ok(None) => {
                self.restore_listened(consumed);
                return Err(ContributeError::NoTransaction);
            }
            Err(e) => {
                self.restore_listened(consumed);
                return Err(e.into());
            }
        };

        let mut claim = ClaimMessage::new(&tx_hash, splits);
        claim.signature = self.wallet.sign(&claim.signable_string()).await?;
        self.overlay
            .send(&node.peer_id, CLAIM_MESSAGE_ID, encore_claim::encode(&claim)?)
            .await?;

        info!(
            tx = %tx_hash,
            amount,
            artists = claim.artist_splits.len(),
            payout_node = %node.peer_id,
            "contribution sent"
        );
        Ok(Contribution {
            tx_hash,
            amount,
            claim,
            payout_node: node,
        })
    }

    /// Put consumed listening back ahead of anything recorded since.
    fn restore_listened(&self, consumed: Vec<ListenActivity>) {
        let mut listened = self.listened.lock().unwrap_or_else(|e| e.into_inner());
        let newer = std::mem::replace(&mut *listened, consumed);
        listened.extend(newer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gated::GatedWallet;
    use encore_network::{random_peer_id, LocalNetwork, MemoryRecordLog, OverlayEvent, PeerId};
    use encore_wallet::{DryRunWallet, SendFailure};

    #[test]
    fn test_shares_from_listening() {
        let activity = vec![
            ListenActivity::new("a", "t1", 30_000),
            ListenActivity::new("b", "t2", 40_000),
            ListenActivity::new("a", "t3", 30_000),
        ];
        let shares = shares_from_listening(&activity);
        assert_eq!(shares.len(), 2);
        assert!((shares["a"] - 0.6).abs() < 1e-6);
        assert!((shares["b"] - 0.4).abs() < 1e-6);
        assert!(shares_from_listening(std::iter::empty()).is_empty());
    }

    #[tokio::test]
    async fn test_contribute_without_payout_node() {
        let network = LocalNetwork::new();
        let (overlay, _events) = network.join();
        let discovery = Arc::new(PayoutNodeDiscovery::new(overlay.local_peer_id()));
        let wallet = Arc::new(DryRunWallet::with_balance("listener", 10_000));
        let contributor = Contributor::new(
            Arc::new(overlay),
            wallet.clone(),
            discovery,
            Arc::new(MemoryRecordLog::new()),
        );
        contributor.record_listen(ListenActivity::new("a", "t1", 1_000));

        let result = contributor.contribute(1_000).await;
        assert!(matches!(result, Err(ContributeError::DiscoveryUnresolved)));
        assert_eq!(wallet.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_contribute_sends_funds_then_claim() {
        let network = LocalNetwork::new();
        let (overlay, _events) = network.join();
        let payout_peer = random_peer_id();
        let (_payout, mut payout_events) = network.join_as(payout_peer);
        network.connect(&overlay.local_peer_id(), &payout_peer).unwrap();

        let discovery = resolved_discovery(overlay.local_peer_id(), payout_peer);

        let wallet = Arc::new(DryRunWallet::with_balance("listener", 10_000));
        let records = Arc::new(MemoryRecordLog::new());
        let contributor = Contributor::new(
            Arc::new(overlay),
            wallet.clone(),
            discovery,
            records.clone(),
        );
        assert!(matches!(
            contributor.contribute(1_000).await,
            Err(ContributeError::NoActivity)
        ));

        contributor.record_listen(ListenActivity::new("a", "t1", 60_000));
        contributor.record_listen(ListenActivity::new("b", "t2", 40_000));
        assert_eq!(records.len(), 2);

        let contribution = contributor.contribute(1_000).await.unwrap();
        let sent = wallet.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].txid, contribution.tx_hash);
        assert_eq!(sent[0].outputs.get("payout-addr"), Some(&1_000));
        assert!(contribution.claim.signature.starts_with("dryrun:"));
        assert!(contributor.current_shares().is_empty());

        let mut claim = None;
        while let Ok(event) = payout_events.try_recv() {
            if let OverlayEvent::Message {
                message_id: CLAIM_MESSAGE_ID,
                payload,
                ..
            } = event
            {
                claim = Some(encore_claim::decode(&payload).unwrap());
            }
        }
        let claim = claim.unwrap();
        assert_eq!(claim, contribution.claim);
        assert!((claim.artist_splits["a"] - 0.6).abs() < 1e-6);
    }

    fn resolved_discovery(local: PeerId, payout_peer: PeerId) -> Arc<PayoutNodeDiscovery> {
        let discovery = Arc::new(PayoutNodeDiscovery::new(local));
        let tag = encore_network::DiscoveryTag::IsPayoutNode {
            node: payout_peer,
            settlement_address: "payout-addr".into(),
        };
        discovery.on_handshake(payout_peer, &tag.to_bytes().unwrap());
        discovery
    }

    #[tokio::test]
    async fn test_listen_during_funding_is_kept() {
        let network = LocalNetwork::new();
        let (overlay, _events) = network.join();
        let payout_peer = random_peer_id();
        let (_payout, _payout_events) = network.join_as(payout_peer);
        network.connect(&overlay.local_peer_id(), &payout_peer).unwrap();

        let discovery = resolved_discovery(overlay.local_peer_id(), payout_peer);
        let wallet = GatedWallet::new(Arc::new(DryRunWallet::with_balance("listener", 10_000)));
        let contributor = Arc::new(Contributor::new(
            Arc::new(overlay),
            wallet.clone(),
            discovery,
            Arc::new(MemoryRecordLog::new()),
        ));
        contributor.record_listen(ListenActivity::new("a", "t1", 60_000));

        let contributing = {
            let contributor = contributor.clone();
            tokio::spawn(async move { contributor.contribute(1_000).await })
        };
        wallet.entered().await;
        contributor.record_listen(ListenActivity::new("b", "t2", 30_000));
        wallet.release();

        let contribution = contributing.await.unwrap().unwrap();
        assert_eq!(contribution.claim.artist_splits.len(), 1);
        assert!(contribution.claim.artist_splits.contains_key("a"));

        let next = contributor.current_shares();
        assert_eq!(next.len(), 1);
        assert!((next["b"] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_failed_funding_restores_listening() {
        let network = LocalNetwork::new();
        let (overlay, _events) = network.join();
        let payout_peer = random_peer_id();
        let discovery = resolved_discovery(overlay.local_peer_id(), payout_peer);
        let wallet = Arc::new(DryRunWallet::with_balance("listener", 10_000));
        let contributor = Contributor::new(
            Arc::new(overlay),
            wallet.clone(),
            discovery,
            Arc::new(MemoryRecordLog::new()),
        );
        contributor.record_listen(ListenActivity::new("a", "t1", 60_000));
        contributor.record_listen(ListenActivity::new("b", "t2", 40_000));

        wallet.set_send_failure(Some(SendFailure::NoTransaction));
        assert!(matches!(
            contributor.contribute(1_000).await,
            Err(ContributeError::NoTransaction)
        ));
        let shares = contributor.current_shares();
        assert!((shares["a"] - 0.6).abs() < 1e-6);
        assert!((shares["b"] - 0.4).abs() < 1e-6);

        // Oversized artist ids are caught before any payment.
        wallet.set_send_failure(None);
        contributor.record_listen(ListenActivity::new(&"x".repeat(70_000), "t3", 10_000));
        assert!(matches!(
            contributor.contribute(1_000).await,
            Err(ContributeError::Codec(_))
        ));
        assert_eq!(wallet.sent_count(), 0);
        assert_eq!(contributor.current_shares().len(), 3);
    }
}

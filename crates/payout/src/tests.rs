//! End-to-end scenarios: payout node and listeners on a local overlay.

use std::sync::Arc;
use std::time::Duration;

use encore_claim::{ClaimVerifier, RejectingVerifier, UncheckedVerifier};
use encore_core::{ClaimStatus, ListenActivity, PayoutId, PayoutStatus, PayoutStatusUpdate, Satoshis};
use encore_ledger::{ContributionLedger, LedgerEvent};
use encore_network::{
    read_records, LocalNetwork, MemoryRecordLog, Overlay, PayoutNodeDiscovery, PeerId,
};
use encore_wallet::{DryRunWallet, SendFailure, Wallet};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::{ClaimBackoff, Contributor, NodeConfig, PayoutCoordinator, PayoutError, PayoutNodeService};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> NodeConfig {
    NodeConfig {
        listen_gossip_interval_secs: 1,
        payout_gossip_interval_secs: 1,
        claim_wait_base_ms: 20,
        ..NodeConfig::default()
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.await.unwrap();
    }
}

fn spawn_service(
    service: PayoutNodeService,
    events: tokio::sync::mpsc::UnboundedReceiver<encore_network::OverlayEvent>,
) -> Running {
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(async move { service.run(events, rx).await });
    Running { shutdown, task }
}

struct PayoutHarness {
    peer: PeerId,
    ledger: Arc<ContributionLedger>,
    wallet: Arc<DryRunWallet>,
    coordinator: Arc<PayoutCoordinator>,
    running: Running,
}

fn start_payout_node(network: &LocalNetwork, verifier: Arc<dyn ClaimVerifier>) -> PayoutHarness {
    let config = fast_config();
    let (overlay, events) = network.join();
    let peer = overlay.local_peer_id();
    let ledger = Arc::new(ContributionLedger::open_in_memory().unwrap());
    let wallet = Arc::new(DryRunWallet::new("payout-addr"));
    let records = Arc::new(MemoryRecordLog::new());
    let coordinator = Arc::new(PayoutCoordinator::new(
        ledger.clone(),
        wallet.clone(),
        verifier,
        records.clone(),
        config.claim_backoff(),
    ));
    let discovery = Arc::new(PayoutNodeDiscovery::for_payout_node(peer, "payout-addr").unwrap());
    let service = PayoutNodeService::new(Arc::new(overlay), discovery, records, config)
        .with_coordinator(coordinator.clone());
    PayoutHarness {
        peer,
        ledger,
        wallet,
        coordinator,
        running: spawn_service(service, events),
    }
}

struct ListenerHarness {
    peer: PeerId,
    wallet: Arc<DryRunWallet>,
    discovery: Arc<PayoutNodeDiscovery>,
    records: Arc<MemoryRecordLog>,
    contributor: Contributor,
    running: Running,
}

fn start_listener(network: &LocalNetwork, name: &str) -> ListenerHarness {
    let (overlay, events) = network.join();
    let peer = overlay.local_peer_id();
    let overlay: Arc<dyn Overlay> = Arc::new(overlay);
    let wallet = Arc::new(DryRunWallet::with_balance(name, 100_000));
    let discovery = Arc::new(PayoutNodeDiscovery::new(peer));
    let records = Arc::new(MemoryRecordLog::new());
    let contributor = Contributor::new(
        overlay.clone(),
        wallet.clone(),
        discovery.clone(),
        records.clone(),
    );
    let service = PayoutNodeService::new(overlay, discovery.clone(), records.clone(), fast_config());
    ListenerHarness {
        peer,
        wallet,
        discovery,
        records,
        contributor,
        running: spawn_service(service, events),
    }
}

/// Contribute and deliver the funding transaction to the payout node's wallet.
async fn contribute(listener: &ListenerHarness, payout: &PayoutHarness, amount: Satoshis) -> String {
    timeout(WAIT, listener.discovery.wait_for_payout_node())
        .await
        .unwrap()
        .unwrap();
    let contribution = listener.contributor.contribute(amount).await.unwrap();
    let sender = listener.wallet.settlement_address();
    payout
        .wallet
        .receive_funds(&contribution.tx_hash, amount, Some(sender.as_str()));
    contribution.tx_hash
}

async fn wait_for(
    rx: &mut broadcast::Receiver<LedgerEvent>,
    matches: impl Fn(&LedgerEvent) -> bool,
) -> LedgerEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_settled(rx: &mut broadcast::Receiver<LedgerEvent>, tx: &str) {
    wait_for(rx, |e| {
        matches!(e,
            LedgerEvent::ClaimVerified { tx_hash, .. } | LedgerEvent::ClaimRejected { tx_hash }
                if tx_hash == tx)
    })
    .await;
}

fn current_payout(payout: &PayoutHarness) -> PayoutId {
    payout.ledger.current_payout().unwrap().unwrap().id
}

#[tokio::test]
async fn test_single_contributor() {
    let network = LocalNetwork::new();
    let payout = start_payout_node(&network, Arc::new(UncheckedVerifier::new()));
    let listener = start_listener(&network, "listener-1");
    let mut events = payout.ledger.subscribe();
    network.connect(&payout.peer, &listener.peer).unwrap();

    listener
        .contributor
        .record_listen(ListenActivity::new("artist-a", "t1", 60_000));
    listener
        .contributor
        .record_listen(ListenActivity::new("artist-b", "t2", 40_000));
    let tx = contribute(&listener, &payout, 1000).await;
    wait_settled(&mut events, &tx).await;

    let claim = payout.ledger.claim(&tx).unwrap().unwrap();
    assert_eq!(claim.status, ClaimStatus::Verified);
    assert_eq!(claim.confirmed_amount, Some(1000));

    let amounts = payout.ledger.allocation_amounts(current_payout(&payout)).unwrap();
    assert_eq!(amounts.get("artist-a"), Some(&600));
    assert_eq!(amounts.get("artist-b"), Some(&400));

    listener.running.stop().await;
    payout.running.stop().await;
}

#[tokio::test]
async fn test_two_contributors() {
    let network = LocalNetwork::new();
    let payout = start_payout_node(&network, Arc::new(UncheckedVerifier::new()));
    let first = start_listener(&network, "listener-1");
    let second = start_listener(&network, "listener-2");
    let mut events = payout.ledger.subscribe();
    network.connect(&payout.peer, &first.peer).unwrap();
    network.connect(&payout.peer, &second.peer).unwrap();

    first
        .contributor
        .record_listen(ListenActivity::new("artist-a", "t1", 60_000));
    first
        .contributor
        .record_listen(ListenActivity::new("artist-b", "t2", 40_000));
    second
        .contributor
        .record_listen(ListenActivity::new("artist-a", "t3", 10_000));

    let tx1 = contribute(&first, &payout, 1000).await;
    let tx2 = contribute(&second, &payout, 500).await;
    wait_settled(&mut events, &tx1).await;
    // tx2 may already have been settled before tx1's event was observed.
    if payout.ledger.claim(&tx2).unwrap().map(|c| c.status) != Some(ClaimStatus::Verified) {
        wait_settled(&mut events, &tx2).await;
    }

    let payout_id = current_payout(&payout);
    let amounts = payout.ledger.allocation_amounts(payout_id).unwrap();
    assert_eq!(amounts.get("artist-a"), Some(&1100));
    assert_eq!(amounts.get("artist-b"), Some(&400));
    assert_eq!(amounts.values().sum::<Satoshis>(), 1500);
    assert_eq!(payout.ledger.claims_by_payout(payout_id).unwrap().len(), 2);

    first.running.stop().await;
    second.running.stop().await;
    payout.running.stop().await;
}

#[tokio::test]
async fn test_disbursement_lifecycle() {
    let network = LocalNetwork::new();
    let payout = start_payout_node(&network, Arc::new(UncheckedVerifier::new()));
    let listener = start_listener(&network, "listener-1");
    let mut events = payout.ledger.subscribe();
    network.connect(&payout.peer, &listener.peer).unwrap();

    listener
        .contributor
        .record_listen(ListenActivity::new("artist-a", "t1", 60_000));
    listener
        .contributor
        .record_listen(ListenActivity::new("artist-b", "t2", 40_000));
    let tx = contribute(&listener, &payout, 1000).await;
    wait_settled(&mut events, &tx).await;

    let payout_id = current_payout(&payout);
    payout.coordinator.advance_next(payout_id).await.unwrap();

    // A failed send leaves the payout waiting and publishes nothing.
    payout.wallet.set_send_failure(Some(SendFailure::Error));
    let result = payout.coordinator.advance_next(payout_id).await;
    assert!(matches!(result, Err(PayoutError::WalletSendFailure(_))));
    let stored = payout.ledger.payout(payout_id).unwrap().unwrap();
    assert_eq!(stored.status, PayoutStatus::AwaitingConfirmation);
    assert_eq!(payout.ledger.allocation_amounts(payout_id).unwrap().len(), 2);

    payout.wallet.set_send_failure(None);
    let txid = payout.coordinator.submit(payout_id).await.unwrap();
    let sent = payout.wallet.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].outputs.get("artist-a"), Some(&600));
    assert_eq!(sent[0].outputs.get("artist-b"), Some(&400));

    // The wallet confirmation completes the payout through the service loop.
    payout.wallet.confirm(&txid);
    wait_for(&mut events, |e| {
        matches!(e, LedgerEvent::PayoutStatusChanged { payout_id: id, to: PayoutStatus::Completed, .. }
            if *id == payout_id)
    })
    .await;
    assert_eq!(
        payout.ledger.claim(&tx).unwrap().unwrap().status,
        ClaimStatus::Completed
    );

    // Status records reach the listener by gossip.
    let gossiped = timeout(WAIT, async {
        loop {
            let updates = read_records::<PayoutStatusUpdate>(listener.records.as_ref());
            if updates.iter().any(|u| u.status == PayoutStatus::Completed) {
                return updates;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();
    let completed = gossiped
        .iter()
        .find(|u| u.status == PayoutStatus::Completed)
        .unwrap();
    assert_eq!(completed.payout_id, payout_id);
    assert_eq!(completed.disbursement_txid.as_deref(), Some(txid.as_str()));
    assert_eq!(completed.source_tx_hashes, vec![tx.clone()]);

    listener.running.stop().await;
    payout.running.stop().await;
}

#[tokio::test]
async fn test_rejected_signature() {
    let network = LocalNetwork::new();
    let payout = start_payout_node(&network, Arc::new(RejectingVerifier));
    let listener = start_listener(&network, "listener-1");
    let mut events = payout.ledger.subscribe();
    network.connect(&payout.peer, &listener.peer).unwrap();

    listener
        .contributor
        .record_listen(ListenActivity::new("artist-a", "t1", 60_000));
    let tx = contribute(&listener, &payout, 1000).await;
    let event = wait_for(&mut events, |e| {
        matches!(e, LedgerEvent::ClaimVerified { .. } | LedgerEvent::ClaimRejected { .. })
    })
    .await;
    assert_eq!(event, LedgerEvent::ClaimRejected { tx_hash: tx.clone() });

    let payout_id = current_payout(&payout);
    assert!(payout.ledger.allocations(payout_id).unwrap().is_empty());
    payout.coordinator.advance_next(payout_id).await.unwrap();
    assert!(matches!(
        payout.coordinator.advance_next(payout_id).await,
        Err(PayoutError::EmptyPayout(_))
    ));

    listener.running.stop().await;
    payout.running.stop().await;
}

#[tokio::test]
async fn test_contribution_after_relayed_discovery() {
    let network = LocalNetwork::new();
    let payout = start_payout_node(&network, Arc::new(UncheckedVerifier::new()));
    let relay = start_listener(&network, "listener-y");
    let far = start_listener(&network, "listener-z");
    let mut events = payout.ledger.subscribe();

    network.connect(&payout.peer, &relay.peer).unwrap();
    timeout(WAIT, relay.discovery.wait_for_payout_node())
        .await
        .unwrap()
        .unwrap();
    network.connect(&relay.peer, &far.peer).unwrap();
    let node = timeout(WAIT, far.discovery.wait_for_payout_node())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.peer_id, payout.peer);
    assert_eq!(node.settlement_address, "payout-addr");

    // Z now dials the payout node it learned about.
    network.connect(&far.peer, &node.peer_id).unwrap();
    far.contributor
        .record_listen(ListenActivity::new("artist-c", "t9", 5_000));
    let tx = contribute(&far, &payout, 250).await;
    wait_settled(&mut events, &tx).await;
    let amounts = payout.ledger.allocation_amounts(current_payout(&payout)).unwrap();
    assert_eq!(amounts.get("artist-c"), Some(&250));

    far.running.stop().await;
    relay.running.stop().await;
    payout.running.stop().await;
}

#[tokio::test]
async fn test_startup_recovers_interrupted_submission() {
    let network = LocalNetwork::new();
    let ledger = Arc::new(ContributionLedger::open_in_memory().unwrap());
    let claim = encore_ledger::NewClaim {
        tx_hash: "tx1".into(),
        payer_address: None,
        signature: String::new(),
        artist_splits: [("artist-a".to_string(), 1.0f32)].into_iter().collect(),
    };
    ledger.insert_claim(&claim).unwrap();
    let verified = ledger.verify_and_distribute("tx1", 1000).unwrap();
    ledger
        .advance_payout_stage(verified.payout_id, PayoutStatus::AwaitingConfirmation)
        .unwrap();
    ledger
        .advance_payout_stage(verified.payout_id, PayoutStatus::Submitted)
        .unwrap();

    let (overlay, events) = network.join();
    let peer = overlay.local_peer_id();
    let records = Arc::new(MemoryRecordLog::new());
    let coordinator = Arc::new(PayoutCoordinator::new(
        ledger.clone(),
        Arc::new(DryRunWallet::new("payout-addr")),
        Arc::new(UncheckedVerifier::new()),
        records.clone(),
        ClaimBackoff::default(),
    ));
    let service = PayoutNodeService::new(
        Arc::new(overlay),
        Arc::new(PayoutNodeDiscovery::for_payout_node(peer, "payout-addr").unwrap()),
        records,
        fast_config(),
    )
    .with_coordinator(coordinator);

    let mut ledger_events = ledger.subscribe();
    let running = spawn_service(service, events);
    wait_for(&mut ledger_events, |e| {
        matches!(e, LedgerEvent::PayoutStatusChanged { to: PayoutStatus::AwaitingConfirmation, .. })
    })
    .await;
    assert_eq!(
        ledger.payout(verified.payout_id).unwrap().unwrap().status,
        PayoutStatus::AwaitingConfirmation
    );
    running.stop().await;
}

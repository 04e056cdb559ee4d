//! Node wiring: turns an [`App`] with a [`NodeConfig`] into a running node on
//! a given overlay and wallet.
//!
//! A payout node opens the ledger, settles claims and serves the operator
//! control socket. Any other node searches for the payout node and can
//! contribute through its [`Contributor`].

use std::sync::Arc;

use encore_claim::UncheckedVerifier;
use encore_ledger::ContributionLedger;
use encore_network::{Overlay, OverlayEvent, PayoutNodeDiscovery, PeerId, RecordLog};
use encore_payout::{Contributor, NodeConfig, PayoutCoordinator, PayoutNodeService};
use encore_wallet::Wallet;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{App, AppError};

pub struct NodeRuntime {
    peer_id: PeerId,
    discovery: Arc<PayoutNodeDiscovery>,
    coordinator: Option<Arc<PayoutCoordinator>>,
    contributor: Option<Contributor>,
    socket_path: Option<String>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Start the node's background tasks. Must be called inside a tokio runtime.
    pub fn start(
        app: &App<NodeConfig>,
        overlay: Arc<dyn Overlay>,
        events: mpsc::UnboundedReceiver<OverlayEvent>,
        wallet: Arc<dyn Wallet>,
        records: Arc<dyn RecordLog>,
    ) -> Result<Self, AppError> {
        let config = &app.settings.config;
        let peer_id = overlay.local_peer_id();
        if peer_id != app.peer_id {
            warn!("Overlay peer {} differs from node identity {}", peer_id, app.peer_id);
        }
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut forwarder = None;
        let mut socket_path = None;

        let (discovery, coordinator, contributor) = if config.payout_node_enabled {
            let db_path = config
                .database_path
                .clone()
                .unwrap_or_else(|| app.data_dir.join("ledger.db"));
            let ledger = Arc::new(ContributionLedger::open(&db_path)?);
            let settlement_address = if config.settlement_address.is_empty() {
                wallet.settlement_address()
            } else {
                config.settlement_address.clone()
            };
            info!(
                "Payout node: ledger {}, settlement address {}",
                db_path.display(),
                settlement_address
            );

            let coordinator = Arc::new(PayoutCoordinator::new(
                ledger.clone(),
                wallet.clone(),
                Arc::new(UncheckedVerifier::new()),
                records.clone(),
                config.claim_backoff(),
            ));

            #[cfg(unix)]
            {
                let path = config
                    .ipc_socket_path
                    .clone()
                    .unwrap_or_else(|| encore_ipc::default_socket_path(&app.service));
                let server = encore_ipc::IpcServer::new(&path);
                forwarder = Some(encore_payout::forward_ledger_events(
                    ledger.subscribe(),
                    server.event_sender(),
                ));
                let handler: Arc<dyn encore_ipc::IpcHandler> =
                    Arc::new(encore_payout::ControlHandler::new(coordinator.clone()));
                let rx = shutdown.subscribe();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = server.run(handler, rx).await {
                        tracing::error!("IPC server failed: {}", e);
                    }
                }));
                socket_path = Some(path);
            }

            let discovery = PayoutNodeDiscovery::for_payout_node(peer_id, &settlement_address)
                .map_err(|e| AppError::InitError(format!("payout node discovery: {}", e)))?;
            let discovery = Arc::new(discovery);
            (discovery, Some(coordinator), None)
        } else {
            let discovery = Arc::new(PayoutNodeDiscovery::new(peer_id));
            let contributor = Contributor::new(
                overlay.clone(),
                wallet.clone(),
                discovery.clone(),
                records.clone(),
            );
            (discovery, None, Some(contributor))
        };

        let mut service =
            PayoutNodeService::new(overlay, discovery.clone(), records, config.clone());
        if let Some(coordinator) = &coordinator {
            service = service.with_coordinator(coordinator.clone());
        }
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move { service.run(events, rx).await }));

        Ok(Self {
            peer_id,
            discovery,
            coordinator,
            contributor,
            socket_path,
            shutdown,
            tasks,
            forwarder,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn discovery(&self) -> &Arc<PayoutNodeDiscovery> {
        &self.discovery
    }

    /// Present on the payout node.
    pub fn coordinator(&self) -> Option<&Arc<PayoutCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Present on listener nodes.
    pub fn contributor(&self) -> Option<&Contributor> {
        self.contributor.as_ref()
    }

    /// Operator control socket, when serving one.
    pub fn socket_path(&self) -> Option<&str> {
        self.socket_path.as_deref()
    }

    /// Signal shutdown and wait for every task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        info!("Node {} stopped", self.peer_id);
    }
}

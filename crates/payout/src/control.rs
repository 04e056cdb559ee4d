//! Operator control over IPC.
//!
//! Methods:
//! - `payout.current`, `payout.list`
//! - `payout.advance {payout_id}`: move to the next stage (submitting on SUBMITTED)
//! - `payout.complete {payout_id}`
//! - `claims.list {status}`, `claims.by_payout {payout_id}`
//! - `allocations.list {payout_id}`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use encore_core::{ClaimStatus, PayoutId};
use encore_ipc::{IpcHandler, RpcError, RpcEvent};
use encore_ledger::LedgerEvent;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator::PayoutCoordinator;

pub struct ControlHandler {
    coordinator: Arc<PayoutCoordinator>,
}

impl ControlHandler {
    pub fn new(coordinator: Arc<PayoutCoordinator>) -> Self {
        Self { coordinator }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let ledger = self.coordinator.ledger();
        match method {
            "payout.current" => to_json(ledger.current_payout().map_err(server)?),
            "payout.list" => to_json(ledger.payouts().map_err(server)?),
            "payout.advance" => {
                let id = payout_id(&params)?;
                let status = self.coordinator.advance_next(id).await.map_err(server)?;
                let payout = ledger.payout(id).map_err(server)?;
                Ok(json!({
                    "payout_id": id,
                    "status": status,
                    "disbursement_txid": payout.and_then(|p| p.disbursement_txid),
                }))
            }
            "payout.complete" => {
                let id = payout_id(&params)?;
                let status = self.coordinator.complete(id).await.map_err(server)?;
                Ok(json!({ "payout_id": id, "status": status }))
            }
            "claims.list" => {
                let raw = string_param(&params, "status")?;
                let status: ClaimStatus = raw
                    .parse()
                    .map_err(|e| RpcError::invalid_params(format!("{}", e)))?;
                to_json(ledger.claims_by_status(status).map_err(server)?)
            }
            "claims.by_payout" => {
                to_json(ledger.claims_by_payout(payout_id(&params)?).map_err(server)?)
            }
            "allocations.list" => {
                to_json(ledger.allocations(payout_id(&params)?).map_err(server)?)
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl IpcHandler for ControlHandler {
    fn handle(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + '_>> {
        let method = method.to_string();
        Box::pin(async move {
            debug!(method = %method, "control request");
            self.dispatch(&method, params).await
        })
    }
}

/// Forward committed ledger changes to IPC clients as `ledger` events until
/// the ledger goes away.
pub fn forward_ledger_events(
    mut ledger_events: broadcast::Receiver<LedgerEvent>,
    ipc_events: broadcast::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match ledger_events.recv().await {
                Ok(event) => {
                    let data = match serde_json::to_value(&event) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Failed to encode ledger event: {}", e);
                            continue;
                        }
                    };
                    if let Ok(line) = serde_json::to_string(&RpcEvent::new("ledger", data)) {
                        // No connected clients is fine.
                        let _ = ipc_events.send(line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Ledger event forwarder lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(server)
}

fn server(e: impl std::fmt::Display) -> RpcError {
    RpcError::server(e.to_string())
}

fn string_param<'a>(params: &'a Option<Value>, key: &str) -> Result<&'a str, RpcError> {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing '{}'", key)))
}

fn payout_id(params: &Option<Value>) -> Result<PayoutId, RpcError> {
    string_param(params, "payout_id")?
        .parse()
        .map_err(|e| RpcError::invalid_params(format!("invalid payout_id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_claim::{ClaimMessage, UncheckedVerifier};
    use encore_ipc::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND, SERVER_ERROR};
    use encore_ledger::ContributionLedger;
    use encore_network::MemoryRecordLog;
    use encore_wallet::DryRunWallet;

    async fn handler_with_claim() -> (ControlHandler, Arc<DryRunWallet>, PayoutId) {
        let ledger = Arc::new(ContributionLedger::open_in_memory().unwrap());
        let wallet = Arc::new(DryRunWallet::new("payout-addr"));
        let coordinator = Arc::new(PayoutCoordinator::new(
            ledger.clone(),
            wallet.clone(),
            Arc::new(UncheckedVerifier::new()),
            Arc::new(MemoryRecordLog::new()),
            Default::default(),
        ));
        wallet.receive_funds("tx1", 1000, Some("listener"));
        let message = ClaimMessage::new(
            "tx1",
            [("a".to_string(), 0.6f32), ("b".to_string(), 0.4f32)]
                .into_iter()
                .collect(),
        );
        coordinator.register_claim(&message, None).await.unwrap();
        let payout = ledger.current_payout().unwrap().unwrap().id;
        (ControlHandler::new(coordinator), wallet, payout)
    }

    #[tokio::test]
    async fn test_queries() {
        let (handler, _, payout) = handler_with_claim().await;

        let current = handler.handle("payout.current", None).await.unwrap();
        assert_eq!(current["id"], json!(payout.to_string()));
        assert_eq!(current["status"], json!("COLLECTING"));

        let allocations = handler
            .handle("allocations.list", Some(json!({ "payout_id": payout.to_string() })))
            .await
            .unwrap();
        assert_eq!(allocations.as_array().unwrap().len(), 2);

        let verified = handler
            .handle("claims.list", Some(json!({ "status": "VERIFIED" })))
            .await
            .unwrap();
        assert_eq!(verified[0]["tx_hash"], json!("tx1"));

        let by_payout = handler
            .handle("claims.by_payout", Some(json!({ "payout_id": payout.to_string() })))
            .await
            .unwrap();
        assert_eq!(by_payout.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_advance_through_stages() {
        let (handler, wallet, payout) = handler_with_claim().await;
        let params = Some(json!({ "payout_id": payout.to_string() }));

        let result = handler.handle("payout.advance", params.clone()).await.unwrap();
        assert_eq!(result["status"], json!("AWAITING_CONFIRMATION"));

        let result = handler.handle("payout.advance", params.clone()).await.unwrap();
        assert_eq!(result["status"], json!("SUBMITTED"));
        assert_eq!(result["disbursement_txid"], json!(wallet.sent()[0].txid));

        let result = handler.handle("payout.complete", params.clone()).await.unwrap();
        assert_eq!(result["status"], json!("COMPLETED"));

        let list = handler.handle("payout.list", None).await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_errors() {
        let (handler, _, _) = handler_with_claim().await;

        let err = handler.handle("payout.nope", None).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);

        let err = handler.handle("payout.advance", None).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let err = handler
            .handle("claims.list", Some(json!({ "status": "LOST" })))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let err = handler
            .handle("payout.complete", Some(json!({ "payout_id": PayoutId::new().to_string() })))
            .await
            .unwrap_err();
        assert_eq!(err.code, SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_forward_ledger_events() {
        let ledger = ContributionLedger::open_in_memory().unwrap();
        let (ipc_tx, mut ipc_rx) = broadcast::channel(16);
        let task = forward_ledger_events(ledger.subscribe(), ipc_tx);

        ledger.get_or_create_collecting_payout().unwrap();
        let line = ipc_rx.recv().await.unwrap();
        let event: RpcEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(event.event, "ledger");
        assert_eq!(event.data["event"], json!("payout_created"));

        drop(ledger);
        task.await.unwrap();
    }
}

//! Payout coordinator
//!
//! Reconciles claims with the funding transactions the wallet observes and
//! drives payouts through their stages. Both halves of a contribution (the
//! claim message and the funding transaction) can arrive in either order;
//! whichever lands second settles the claim.

use std::sync::Arc;

use encore_claim::{ClaimMessage, ClaimVerifier};
use encore_core::{ClaimStatus, GossipRecord, PayoutId, PayoutStatus, PayoutStatusUpdate, Satoshis};
use encore_ledger::{ContributionLedger, LedgerError, NewClaim, VerifiedClaim};
use encore_network::{publish_record, RecordLog};
use encore_wallet::{FundsReceived, Wallet};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ClaimBackoff;
use crate::{PayoutError, Result};

/// What happened to a claim after a reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Funds matched and allocations were credited.
    Verified(VerifiedClaim),
    /// The signature check failed; the claim is REJECTED.
    Rejected,
    /// Stored, waiting for its funding transaction.
    AwaitingFunds,
    /// A claim for this transaction already exists.
    Duplicate,
    /// Another path settled the claim first.
    AlreadySettled(ClaimStatus),
}

pub struct PayoutCoordinator {
    ledger: Arc<ContributionLedger>,
    wallet: Arc<dyn Wallet>,
    verifier: Arc<dyn ClaimVerifier>,
    records: Arc<dyn RecordLog>,
    backoff: ClaimBackoff,
    /// Held across the wallet send so two submissions never interleave.
    submitting: Mutex<()>,
}

impl PayoutCoordinator {
    pub fn new(
        ledger: Arc<ContributionLedger>,
        wallet: Arc<dyn Wallet>,
        verifier: Arc<dyn ClaimVerifier>,
        records: Arc<dyn RecordLog>,
        backoff: ClaimBackoff,
    ) -> Self {
        Self {
            ledger,
            wallet,
            verifier,
            records,
            backoff,
            submitting: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<ContributionLedger> {
        &self.ledger
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    // ── Claims ──────────────────────────────────────────────

    /// Store an inbound claim and settle it at once if the wallet already saw
    /// its funding transaction.
    pub async fn register_claim(
        &self,
        message: &ClaimMessage,
        payer: Option<&str>,
    ) -> Result<ClaimOutcome> {
        let inserted = self.ledger.insert_claim(&NewClaim::from_message(message, payer))?;
        if !inserted {
            debug!(tx = %message.tx_hash, "duplicate claim ignored");
            return Ok(ClaimOutcome::Duplicate);
        }

        match self.wallet.received_funds(&message.tx_hash).await? {
            Some(funds) => self.settle(&funds.tx_hash, funds.amount, funds.sender.as_deref()),
            None => {
                debug!(tx = %message.tx_hash, "claim waiting for funds");
                Ok(ClaimOutcome::AwaitingFunds)
            }
        }
    }

    /// Settle the claim behind an incoming payment, waiting with exponential
    /// backoff for a claim that has not arrived yet.
    pub async fn on_funds_received(&self, funds: &FundsReceived) -> Result<ClaimOutcome> {
        let mut attempt = 0;
        loop {
            match self.settle(&funds.tx_hash, funds.amount, funds.sender.as_deref()) {
                Err(PayoutError::Ledger(LedgerError::ClaimNotFound(_)))
                    if attempt + 1 < self.backoff.attempts =>
                {
                    let delay = self.backoff.delay(attempt);
                    debug!(tx = %funds.tx_hash, attempt, ?delay, "claim not found yet, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(PayoutError::Ledger(LedgerError::ClaimNotFound(tx))) => {
                    warn!(tx = %tx, attempts = self.backoff.attempts, "funds received without a claim");
                    return Err(LedgerError::ClaimNotFound(tx).into());
                }
                other => return other,
            }
        }
    }

    fn settle(&self, tx_hash: &str, amount: Satoshis, sender: Option<&str>) -> Result<ClaimOutcome> {
        let claim = self
            .ledger
            .claim(tx_hash)?
            .ok_or_else(|| LedgerError::ClaimNotFound(tx_hash.to_string()))?;
        if claim.status != ClaimStatus::Unverified {
            return Ok(ClaimOutcome::AlreadySettled(claim.status));
        }

        let payer = claim.payer_address.as_deref().or(sender);
        if !self.verifier.verify_signature(&claim.to_message(), payer) {
            return match self.ledger.reject_claim(tx_hash) {
                Ok(()) => Ok(ClaimOutcome::Rejected),
                Err(LedgerError::InvalidState { status, .. }) => {
                    Ok(ClaimOutcome::AlreadySettled(status))
                }
                Err(e) => Err(e.into()),
            };
        }

        match self.ledger.verify_and_distribute(tx_hash, amount) {
            Ok(verified) => Ok(ClaimOutcome::Verified(verified)),
            Err(LedgerError::InvalidState { status, .. }) => Ok(ClaimOutcome::AlreadySettled(status)),
            Err(e) => Err(e.into()),
        }
    }

    // ── Payout stages ───────────────────────────────────────

    /// Move a payout forward to `next`, executing the disbursement on
    /// SUBMITTED and publishing a status record on SUBMITTED and COMPLETED.
    ///
    /// Stage changes wait for any submission in flight. Falling back from
    /// SUBMITTED is left to a failed [`submit`](Self::submit).
    pub async fn advance(&self, payout_id: PayoutId, next: PayoutStatus) -> Result<PayoutStatus> {
        match next {
            PayoutStatus::Submitted => {
                self.submit(payout_id).await?;
                Ok(PayoutStatus::Submitted)
            }
            PayoutStatus::Completed => self.complete(payout_id).await,
            other => {
                let _guard = self.submitting.lock().await;
                let from = self
                    .ledger
                    .payout(payout_id)?
                    .ok_or(LedgerError::PayoutNotFound(payout_id))?
                    .status;
                if from.next() != Some(other) {
                    return Err(LedgerError::InvalidTransition { from, to: other }.into());
                }
                Ok(self.ledger.advance_payout_stage(payout_id, other)?)
            }
        }
    }

    /// Advance a payout to the stage after its current one.
    pub async fn advance_next(&self, payout_id: PayoutId) -> Result<PayoutStatus> {
        let payout = self
            .ledger
            .payout(payout_id)?
            .ok_or(LedgerError::PayoutNotFound(payout_id))?;
        let next = payout.status.next().ok_or(LedgerError::InvalidTransition {
            from: payout.status,
            to: payout.status,
        })?;
        self.advance(payout_id, next).await
    }

    /// AWAITING_CONFIRMATION → SUBMITTED. Sends one multi-output transaction
    /// paying every allocation of the payout and returns its txid.
    ///
    /// When the wallet fails the payout reverts to AWAITING_CONFIRMATION with
    /// its allocations untouched and nothing published.
    pub async fn submit(&self, payout_id: PayoutId) -> Result<String> {
        let _guard = self.submitting.lock().await;

        let outputs = self.ledger.allocation_amounts(payout_id)?;
        if outputs.is_empty() {
            return Err(PayoutError::EmptyPayout(payout_id));
        }
        self.ledger.advance_payout_stage(payout_id, PayoutStatus::Submitted)?;

        let failure = match self.wallet.send_multi_output(&outputs).await {
            Ok(Some(txid)) => {
                if let Err(e) = self.ledger.record_disbursement(payout_id, &txid) {
                    error!(payout = %payout_id, txid = %txid, "disbursement sent but not recorded: {}", e);
                    return Err(e.into());
                }
                let total: Satoshis = outputs.values().sum();
                info!(payout = %payout_id, txid = %txid, artists = outputs.len(), total, "payout submitted");
                self.publish_status(payout_id);
                return Ok(txid);
            }
            Ok(None) => "wallet produced no transaction".to_string(),
            Err(e) => e.to_string(),
        };

        warn!(payout = %payout_id, "submission failed: {}", failure);
        self.ledger
            .advance_payout_stage(payout_id, PayoutStatus::AwaitingConfirmation)?;
        Err(PayoutError::WalletSendFailure(failure))
    }

    /// SUBMITTED → COMPLETED, once the disbursement is recorded.
    pub async fn complete(&self, payout_id: PayoutId) -> Result<PayoutStatus> {
        let _guard = self.submitting.lock().await;
        self.complete_locked(payout_id)
    }

    /// Complete the SUBMITTED payout whose disbursement is `txid`.
    /// Returns `None` for transactions that are not disbursements.
    pub async fn on_disbursement_confirmed(&self, txid: &str) -> Result<Option<PayoutId>> {
        let _guard = self.submitting.lock().await;
        let payout = self.ledger.payouts()?.into_iter().find(|p| {
            p.status == PayoutStatus::Submitted && p.disbursement_txid.as_deref() == Some(txid)
        });
        match payout {
            Some(payout) => {
                self.complete_locked(payout.id)?;
                Ok(Some(payout.id))
            }
            None => {
                debug!(txid = %txid, "confirmation for unrelated transaction");
                Ok(None)
            }
        }
    }

    fn complete_locked(&self, payout_id: PayoutId) -> Result<PayoutStatus> {
        let status = self
            .ledger
            .advance_payout_stage(payout_id, PayoutStatus::Completed)?;
        info!(payout = %payout_id, "payout completed");
        self.publish_status(payout_id);
        Ok(status)
    }

    /// Revert submissions a crash left without a disbursement txid.
    pub fn recover(&self) -> Result<Vec<PayoutId>> {
        Ok(self.ledger.recover_interrupted_submissions()?)
    }

    fn publish_status(&self, payout_id: PayoutId) {
        let update = match self.status_update(payout_id) {
            Ok(update) => update,
            Err(e) => {
                warn!(payout = %payout_id, "failed to build status record: {}", e);
                return;
            }
        };
        if !update.is_valid() {
            warn!(payout = %payout_id, "status record incomplete, not published");
            return;
        }
        match publish_record(self.records.as_ref(), &update) {
            Ok(_) => debug!(payout = %payout_id, status = %update.status, "status record published"),
            Err(e) => warn!(payout = %payout_id, "failed to publish status record: {}", e),
        }
    }

    fn status_update(&self, payout_id: PayoutId) -> Result<PayoutStatusUpdate> {
        let payout = self
            .ledger
            .payout(payout_id)?
            .ok_or(LedgerError::PayoutNotFound(payout_id))?;
        let amounts = self.ledger.allocation_amounts(payout_id)?;
        Ok(PayoutStatusUpdate::new(
            payout.id,
            payout.status,
            amounts,
            payout.source_tx_hashes,
            payout.disbursement_txid,
        ))
    }
}

//! Encore Ledger
//!
//! Durable record of contribution claims, payout batches and the per-artist
//! amounts owed by each batch. [`ContributionLedger`] is the only writer of
//! these rows; every mutation runs in an immediate SQLite transaction behind a
//! single-writer lock and is announced on a broadcast channel once committed.

pub mod allocation;
mod schema;
pub mod store;

pub use allocation::allocate;
pub use store::ContributionLedger;

use encore_claim::ClaimMessage;
use encore_core::{
    ArtistAmounts, ArtistSplits, ClaimStatus, CoreError, PayoutId, PayoutStatus, Satoshis,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("claim not found: {0}")]
    ClaimNotFound(String),
    #[error("claim {tx_hash} is {status}")]
    InvalidState { tx_hash: String, status: ClaimStatus },
    #[error("payout cannot move from {from} to {to}")]
    InvalidTransition { from: PayoutStatus, to: PayoutStatus },
    #[error("payout not found: {0}")]
    PayoutNotFound(PayoutId),
    #[error("invalid amount: {0}")]
    InvalidAmount(Satoshis),
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
    #[error("disbursement already recorded for payout {0}")]
    DisbursementRecorded(PayoutId),
    #[error("payout {0} has no recorded disbursement")]
    DisbursementMissing(PayoutId),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(#[from] CoreError),
    #[error("ledger lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// A claim as it enters the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewClaim {
    pub tx_hash: String,
    pub payer_address: Option<String>,
    pub signature: String,
    pub artist_splits: ArtistSplits,
}

impl NewClaim {
    pub fn from_message(message: &ClaimMessage, payer_address: Option<&str>) -> Self {
        Self {
            tx_hash: message.tx_hash.clone(),
            payer_address: payer_address.map(str::to_string),
            signature: message.signature.clone(),
            artist_splits: message.artist_splits.clone(),
        }
    }

    /// Back to the wire form, for signature checks.
    pub fn to_message(&self) -> ClaimMessage {
        ClaimMessage {
            tx_hash: self.tx_hash.clone(),
            signature: self.signature.clone(),
            artist_splits: self.artist_splits.clone(),
        }
    }
}

/// Stored claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claim {
    pub tx_hash: String,
    pub payer_address: Option<String>,
    pub signature: String,
    pub artist_splits: ArtistSplits,
    pub confirmed_amount: Option<Satoshis>,
    pub status: ClaimStatus,
    pub payout_id: Option<PayoutId>,
    pub created_at: i64,
}

impl Claim {
    pub fn to_message(&self) -> ClaimMessage {
        ClaimMessage {
            tx_hash: self.tx_hash.clone(),
            signature: self.signature.clone(),
            artist_splits: self.artist_splits.clone(),
        }
    }
}

/// Stored payout batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub id: PayoutId,
    pub status: PayoutStatus,
    /// Claims folded into this batch, sorted.
    pub source_tx_hashes: Vec<String>,
    pub disbursement_txid: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub artist_address: String,
    pub payout_id: PayoutId,
    pub accrued_amount: Satoshis,
}

/// Outcome of a successful [`ContributionLedger::verify_and_distribute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaim {
    pub tx_hash: String,
    pub payout_id: PayoutId,
    pub confirmed_amount: Satoshis,
    /// Amount added to each artist's allocation by this claim.
    pub credited: ArtistAmounts,
}

/// Committed ledger change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    ClaimInserted {
        tx_hash: String,
    },
    ClaimVerified {
        tx_hash: String,
        payout_id: PayoutId,
        amount: Satoshis,
    },
    ClaimRejected {
        tx_hash: String,
    },
    PayoutCreated {
        payout_id: PayoutId,
    },
    PayoutStatusChanged {
        payout_id: PayoutId,
        from: PayoutStatus,
        to: PayoutStatus,
    },
}

//! Encore Payout
//!
//! Payout-node side: reconciles claims with incoming funds, accumulates
//! per-artist allocations and executes batched disbursements, publishing each
//! stage change as a gossip record. Listener side: turns local listening into
//! a funded, signed claim sent to the discovered payout node.

pub mod config;
pub mod contributor;
pub mod control;
pub mod coordinator;
pub mod service;
#[cfg(test)]
mod gated;
#[cfg(test)]
mod tests;

pub use config::{ClaimBackoff, NodeConfig};
pub use contributor::{shares_from_listening, ContributeError, Contribution, Contributor};
pub use control::{forward_ledger_events, ControlHandler};
pub use coordinator::{ClaimOutcome, PayoutCoordinator};
pub use service::PayoutNodeService;

use encore_claim::CodecError;
use encore_core::PayoutId;
use encore_ledger::LedgerError;
use encore_network::NetworkError;
use encore_wallet::WalletError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("wallet send failed: {0}")]
    WalletSendFailure(String),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("payout {0} has no allocations")]
    EmptyPayout(PayoutId),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

pub type Result<T> = std::result::Result<T, PayoutError>;

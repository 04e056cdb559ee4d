//! Encore Gossip
//!
//! Periodic epidemic dissemination of records from the shared log. Each
//! scheduler instance handles one record kind: every interval it picks a
//! random connected peer and pushes a random sample of valid records to it.
//! There is no acknowledgement and no retry; coverage comes from repetition.

pub mod inbound;
pub mod scheduler;

pub use inbound::accept_gossip;
pub use scheduler::{GossipConfig, GossipHandle, GossipScheduler, RoundReport};

use encore_core::RecordError;
use encore_network::NetworkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
    #[error("invalid {0} record")]
    InvalidRecord(String),
}

//! Encore Core
//!
//! Domain types shared by every Encore crate: identifiers, claim and payout
//! statuses, and the schemas of records gossiped across the overlay.

pub mod records;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use records::{
    GossipRecord, ListenActivity, PayoutStatusUpdate, RecordEnvelope, RecordError,
    RECORD_SCHEMA_VERSION,
};

/// Generic error types shared across crates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown claim status: {0}")]
    UnknownClaimStatus(String),
    #[error("Unknown payout status: {0}")]
    UnknownPayoutStatus(String),
    #[error("Invalid payout id: {0}")]
    InvalidPayoutId(String),
}

/// Amount in satoshis.
pub type Satoshis = i64;

/// Artist settlement address → fraction of a contribution.
pub type ArtistSplits = BTreeMap<String, f32>;

/// Artist settlement address → accrued amount.
pub type ArtistAmounts = BTreeMap<String, Satoshis>;

/// Opaque identifier of a payout batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayoutId(Uuid);

impl PayoutId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PayoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PayoutId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::InvalidPayoutId(s.to_string()))
    }
}

/// Lifecycle of a contribution claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Unverified,
    Validating,
    Verified,
    Rejected,
    Completed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "UNVERIFIED",
            Self::Validating => "VALIDATING",
            Self::Verified => "VERIFIED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNVERIFIED" => Ok(Self::Unverified),
            "VALIDATING" => Ok(Self::Validating),
            "VERIFIED" => Ok(Self::Verified),
            "REJECTED" => Ok(Self::Rejected),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(CoreError::UnknownClaimStatus(other.to_string())),
        }
    }
}

/// Stage of a payout batch. Stages are totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Collecting,
    AwaitingConfirmation,
    Submitted,
    Completed,
}

impl PayoutStatus {
    /// The stage following this one, `None` once completed.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Collecting => Some(Self::AwaitingConfirmation),
            Self::AwaitingConfirmation => Some(Self::Submitted),
            Self::Submitted => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Forward edges plus the single compensating edge SUBMITTED → AWAITING_CONFIRMATION.
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.next() == Some(target)
            || (*self == Self::Submitted && target == Self::AwaitingConfirmation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "COLLECTING",
            Self::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Self::Submitted => "SUBMITTED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COLLECTING" => Ok(Self::Collecting),
            "AWAITING_CONFIRMATION" => Ok(Self::AwaitingConfirmation),
            "SUBMITTED" => Ok(Self::Submitted),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(CoreError::UnknownPayoutStatus(other.to_string())),
        }
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

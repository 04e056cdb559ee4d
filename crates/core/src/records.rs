//! Records published on the overlay's shared log and spread by gossip.
//!
//! Every record carries a schema version and is decoded strictly: unknown
//! fields, missing fields or an unsupported version yield
//! [`RecordError::MalformedRecord`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtistAmounts, PayoutId, PayoutStatus};

/// Schema version written into every record.
pub const RECORD_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("record kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },
}

/// A typed record that can live on the shared log.
pub trait GossipRecord: Serialize + DeserializeOwned {
    /// Record type name on the log.
    const KIND: &'static str;

    /// Semantic validity; invalid records are never gossiped.
    fn is_valid(&self) -> bool;
}

/// Listening activity produced by the media player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenActivity {
    pub version: u16,
    pub artist_id: String,
    pub track_id: String,
    pub listened_millis: i64,
}

impl ListenActivity {
    pub fn new(artist_id: &str, track_id: &str, listened_millis: i64) -> Self {
        Self {
            version: RECORD_SCHEMA_VERSION,
            artist_id: artist_id.to_string(),
            track_id: track_id.to_string(),
            listened_millis,
        }
    }
}

impl GossipRecord for ListenActivity {
    const KIND: &'static str = "listen_activity";

    fn is_valid(&self) -> bool {
        self.version == RECORD_SCHEMA_VERSION
            && !self.artist_id.is_empty()
            && !self.track_id.is_empty()
            && self.listened_millis > 0
    }
}

/// Immutable audit record of a payout stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayoutStatusUpdate {
    pub version: u16,
    pub payout_id: PayoutId,
    pub status: PayoutStatus,
    /// Final per-artist amounts of the batch.
    pub artist_splits: ArtistAmounts,
    pub source_tx_hashes: Vec<String>,
    pub disbursement_txid: Option<String>,
}

impl PayoutStatusUpdate {
    pub fn new(
        payout_id: PayoutId,
        status: PayoutStatus,
        artist_splits: ArtistAmounts,
        source_tx_hashes: Vec<String>,
        disbursement_txid: Option<String>,
    ) -> Self {
        Self {
            version: RECORD_SCHEMA_VERSION,
            payout_id,
            status,
            artist_splits,
            source_tx_hashes,
            disbursement_txid,
        }
    }
}

impl GossipRecord for PayoutStatusUpdate {
    const KIND: &'static str = "payout_status_update";

    fn is_valid(&self) -> bool {
        self.version == RECORD_SCHEMA_VERSION
            && !self.artist_splits.is_empty()
            && !self.source_tx_hashes.is_empty()
            && self.disbursement_txid.as_deref().map_or(true, |t| !t.is_empty())
    }
}

/// Kind-tagged container stored on the log and sent between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEnvelope {
    pub kind: String,
    pub body: serde_json::Value,
}

impl RecordEnvelope {
    pub fn wrap<R: GossipRecord>(record: &R) -> Result<Self, RecordError> {
        let body = serde_json::to_value(record)
            .map_err(|e| RecordError::MalformedRecord(e.to_string()))?;
        Ok(Self {
            kind: R::KIND.to_string(),
            body,
        })
    }

    /// Decode the body as `R`, rejecting other kinds and unsupported versions.
    pub fn open<R: GossipRecord>(&self) -> Result<R, RecordError> {
        if self.kind != R::KIND {
            return Err(RecordError::KindMismatch {
                expected: R::KIND.to_string(),
                actual: self.kind.clone(),
            });
        }
        let version = self
            .body
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RecordError::MalformedRecord("missing version".into()))?;
        if version != RECORD_SCHEMA_VERSION as u64 {
            return Err(RecordError::MalformedRecord(format!(
                "unsupported schema version {}",
                version
            )));
        }
        serde_json::from_value(self.body.clone())
            .map_err(|e| RecordError::MalformedRecord(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|e| RecordError::MalformedRecord(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(data).map_err(|e| RecordError::MalformedRecord(e.to_string()))
    }
}

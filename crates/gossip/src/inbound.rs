//! Receiving side of gossip: validate an incoming envelope and add it to the log.

use encore_core::{GossipRecord, ListenActivity, PayoutStatusUpdate, RecordEnvelope};
use encore_network::RecordLog;
use tracing::debug;

use crate::GossipError;

/// Accept a gossiped record payload. Returns `false` for records already on
/// the log. Unknown kinds and records failing their validator are refused.
pub fn accept_gossip(log: &dyn RecordLog, payload: &[u8]) -> Result<bool, GossipError> {
    let envelope = RecordEnvelope::from_bytes(payload)?;
    match envelope.kind.as_str() {
        ListenActivity::KIND => check::<ListenActivity>(&envelope)?,
        PayoutStatusUpdate::KIND => check::<PayoutStatusUpdate>(&envelope)?,
        other => return Err(GossipError::UnknownKind(other.to_string())),
    }
    let added = log.append(envelope)?;
    if added {
        debug!("Accepted gossiped record");
    }
    Ok(added)
}

fn check<R: GossipRecord>(envelope: &RecordEnvelope) -> Result<(), GossipError> {
    let record: R = envelope.open()?;
    if !record.is_valid() {
        return Err(GossipError::InvalidRecord(R::KIND.to_string()));
    }
    Ok(())
}

//! Shared append-only record log.
//!
//! Records reach the log either from local producers (the media player, the
//! payout coordinator) or from gossip. Gossip rounds read the log back by kind.

use std::sync::Mutex;

use encore_core::{GossipRecord, RecordEnvelope};
use tracing::debug;

use crate::NetworkError;

pub trait RecordLog: Send + Sync {
    /// Append a record. Returns `false` if an identical record is already present.
    fn append(&self, envelope: RecordEnvelope) -> Result<bool, NetworkError>;

    /// All records of `kind`, in append order.
    fn records(&self, kind: &str) -> Vec<RecordEnvelope>;
}

/// Wrap and append a typed record.
pub fn publish_record<R: GossipRecord>(
    log: &dyn RecordLog,
    record: &R,
) -> Result<bool, NetworkError> {
    log.append(RecordEnvelope::wrap(record)?)
}

/// Every record of type `R` on the log that decodes; malformed ones are skipped.
pub fn read_records<R: GossipRecord>(log: &dyn RecordLog) -> Vec<R> {
    log.records(R::KIND)
        .iter()
        .filter_map(|envelope| match envelope.open::<R>() {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping {} record: {}", R::KIND, e);
                None
            }
        })
        .collect()
}

/// In-memory [`RecordLog`].
#[derive(Default)]
pub struct MemoryRecordLog {
    entries: Mutex<Vec<RecordEnvelope>>,
}

impl MemoryRecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordLog for MemoryRecordLog {
    fn append(&self, envelope: RecordEnvelope) -> Result<bool, NetworkError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains(&envelope) {
            return Ok(false);
        }
        entries.push(envelope);
        Ok(true)
    }

    fn records(&self, kind: &str) -> Vec<RecordEnvelope> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|e| e.kind == kind).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::ListenActivity;

    #[test]
    fn test_publish_and_read() {
        let log = MemoryRecordLog::new();
        assert!(publish_record(&log, &ListenActivity::new("a", "t1", 100)).unwrap());
        assert!(publish_record(&log, &ListenActivity::new("a", "t2", 200)).unwrap());
        assert!(!publish_record(&log, &ListenActivity::new("a", "t1", 100)).unwrap());

        let records: Vec<ListenActivity> = read_records(&log);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].track_id, "t2");
        assert_eq!(log.records("payout_status_update").len(), 0);
    }

    #[test]
    fn test_malformed_records_skipped() {
        let log = MemoryRecordLog::new();
        let raw = br#"{"kind":"listen_activity","body":{"version":1,"artist_id":"a"}}"#;
        log.append(RecordEnvelope::from_bytes(raw).unwrap()).unwrap();
        publish_record(&log, &ListenActivity::new("a", "t", 1)).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(read_records::<ListenActivity>(&log).len(), 1);
    }
}

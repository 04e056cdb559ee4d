use libp2p::PeerId;
use thiserror::Error;

use encore_core::RecordError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Peer not connected: {0}")]
    PeerNotConnected(PeerId),
    #[error("Peer inbox closed: {0}")]
    InboxClosed(PeerId),
    #[error("Malformed handshake extension: {0}")]
    MalformedHandshake(String),
    #[error("Handshake {field} is {len} bytes, limit is 65535")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("Discovery stopped")]
    DiscoveryStopped,
}

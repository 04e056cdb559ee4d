//! Node configuration persisted through `encore-settings`.

use std::path::PathBuf;
use std::time::Duration;

use encore_gossip::GossipConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Act as the payout node.
    pub payout_node_enabled: bool,
    /// Settlement address announced when acting as the payout node.
    pub settlement_address: String,
    /// Ledger database; defaults to `ledger.db` in the data directory.
    pub database_path: Option<PathBuf>,
    pub listen_gossip_interval_secs: u64,
    pub listen_gossip_batch_size: usize,
    pub payout_gossip_interval_secs: u64,
    pub payout_gossip_batch_size: usize,
    /// How often a funding event looks for its claim before giving up.
    pub claim_wait_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub claim_wait_base_ms: u64,
    /// Operator control socket; defaults to the platform socket path.
    pub ipc_socket_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            payout_node_enabled: false,
            settlement_address: String::new(),
            database_path: None,
            listen_gossip_interval_secs: 10,
            listen_gossip_batch_size: 10,
            payout_gossip_interval_secs: 5,
            payout_gossip_batch_size: 10,
            claim_wait_attempts: 5,
            claim_wait_base_ms: 200,
            ipc_socket_path: None,
        }
    }
}

impl NodeConfig {
    pub fn listen_gossip(&self) -> GossipConfig {
        GossipConfig {
            batch_size: self.listen_gossip_batch_size,
            interval: Duration::from_secs(self.listen_gossip_interval_secs.max(1)),
        }
    }

    pub fn payout_gossip(&self) -> GossipConfig {
        GossipConfig {
            batch_size: self.payout_gossip_batch_size,
            interval: Duration::from_secs(self.payout_gossip_interval_secs.max(1)),
        }
    }

    pub fn claim_backoff(&self) -> ClaimBackoff {
        ClaimBackoff {
            attempts: self.claim_wait_attempts.max(1),
            base: Duration::from_millis(self.claim_wait_base_ms),
        }
    }
}

/// Bounded exponential backoff used while a funding event waits for its claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimBackoff {
    pub attempts: u32,
    pub base: Duration,
}

impl ClaimBackoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for ClaimBackoff {
    fn default() -> Self {
        NodeConfig::default().claim_backoff()
    }
}

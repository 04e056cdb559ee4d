//! Per-kind gossip scheduler.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use encore_core::{GossipRecord, RecordEnvelope};
use encore_network::{read_records, Overlay, PeerId, RecordLog, GOSSIP_RECORD_MESSAGE_ID};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Batch size and period of one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipConfig {
    pub batch_size: usize,
    pub interval: Duration,
}

impl GossipConfig {
    /// 10 records every 10 s.
    pub fn listen_activity() -> Self {
        Self {
            batch_size: 10,
            interval: Duration::from_secs(10),
        }
    }

    /// 10 records every 5 s.
    pub fn payout_status() -> Self {
        Self {
            batch_size: 10,
            interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one gossip round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Peer gossiped to; `None` when no peer was connected.
    pub peer: Option<PeerId>,
    pub sent: usize,
    pub failed: usize,
}

type Validator<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

pub struct GossipScheduler<R> {
    config: GossipConfig,
    overlay: Arc<dyn Overlay>,
    log: Arc<dyn RecordLog>,
    validator: Validator<R>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: GossipRecord + Send + 'static> GossipScheduler<R> {
    /// Scheduler using [`GossipRecord::is_valid`] as validator.
    pub fn new(config: GossipConfig, overlay: Arc<dyn Overlay>, log: Arc<dyn RecordLog>) -> Self {
        Self {
            config,
            overlay,
            log,
            validator: Box::new(|record: &R| record.is_valid()),
            _kind: PhantomData,
        }
    }

    /// Replace the validator predicate.
    pub fn with_validator(mut self, validator: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// One round: random peer, random sample of valid records, sequential sends.
    pub async fn run_round(&self) -> RoundReport {
        let (peer, batch) = {
            let mut rng = rand::thread_rng();
            let Some(peer) = self.overlay.connected_peers().choose(&mut rng).copied() else {
                debug!(kind = R::KIND, "no peers to gossip to");
                return RoundReport::default();
            };
            let mut records: Vec<R> = read_records::<R>(self.log.as_ref())
                .into_iter()
                .filter(|r| (self.validator)(r))
                .collect();
            records.shuffle(&mut rng);
            records.truncate(self.config.batch_size);
            (peer, records)
        };

        let mut report = RoundReport {
            peer: Some(peer),
            ..Default::default()
        };
        for record in batch {
            let payload = match RecordEnvelope::wrap(&record).and_then(|e| e.to_bytes()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(kind = R::KIND, error = %e, "failed to encode record");
                    report.failed += 1;
                    continue;
                }
            };
            match self.overlay.send(&peer, GOSSIP_RECORD_MESSAGE_ID, payload).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(kind = R::KIND, %peer, error = %e, "gossip send failed");
                    report.failed += 1;
                }
            }
        }
        debug!(
            kind = R::KIND,
            %peer,
            sent = report.sent,
            failed = report.failed,
            "gossip round done"
        );
        report
    }

    /// Run rounds every interval on a background task until shut down.
    pub fn spawn(self) -> GossipHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval;
        let task = tokio::spawn(async move {
            info!(kind = R::KIND, interval_ms = period.as_millis() as u64, "gossip started");
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_round().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(kind = R::KIND, "gossip stopped");
        });
        GossipHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running scheduler.
pub struct GossipHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GossipHandle {
    /// Stop the timer and wait for the current round to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "gossip task ended abnormally");
        }
    }
}

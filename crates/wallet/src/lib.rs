//! Encore Wallet
//!
//! The on-chain wallet as seen by payout coordination: batched multi-output
//! sends, single sends for listener funding, message signing and a stream of
//! incoming funds. Transaction construction, fees and key handling live behind
//! the [`Wallet`] trait.
//!
//! [`DryRunWallet`] keeps everything in memory and is used for tests and local
//! runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use encore_core::{ArtistAmounts, Satoshis};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Satoshis, available: Satoshis },
    #[error("invalid amount {0}")]
    InvalidAmount(Satoshis),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, WalletError>;

/// Incoming payment observed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundsReceived {
    pub tx_hash: String,
    pub amount: Satoshis,
    /// Settlement address of the payer, when it can be derived from the inputs.
    pub sender: Option<String>,
}

/// Wallet operations the payout node and the listener rely on.
#[async_trait::async_trait]
pub trait Wallet: Send + Sync {
    /// Address other peers pay into.
    fn settlement_address(&self) -> String;

    async fn current_balance(&self) -> Result<Satoshis>;

    /// Build and broadcast one transaction paying every output. `Ok(None)` means
    /// the wallet declined to produce a transaction.
    async fn send_multi_output(&self, outputs: &ArtistAmounts) -> Result<Option<String>>;

    /// Single payment, used by listeners to fund a contribution.
    async fn send(&self, address: &str, amount: Satoshis) -> Result<Option<String>>;

    /// Sign `message` with the wallet key.
    async fn sign(&self, message: &str) -> Result<String>;

    /// Funds already received in transaction `tx_hash`, if any.
    async fn received_funds(&self, tx_hash: &str) -> Result<Option<FundsReceived>>;

    fn subscribe_funds_received(&self) -> broadcast::Receiver<FundsReceived>;

    /// Transaction ids of our own sends as they confirm.
    fn subscribe_confirmations(&self) -> broadcast::Receiver<String>;
}

/// A transaction recorded by [`DryRunWallet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub txid: String,
    pub outputs: ArtistAmounts,
}

/// How [`DryRunWallet`] sends should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Return [`WalletError::SendFailed`].
    Error,
    /// Return `Ok(None)`.
    NoTransaction,
}

/// In-memory wallet. Records every send and lets tests inject incoming funds,
/// confirmations and send failures.
pub struct DryRunWallet {
    address: String,
    balance: Mutex<Satoshis>,
    sent: Mutex<Vec<SentTransaction>>,
    received: Mutex<HashMap<String, FundsReceived>>,
    failure: Mutex<Option<SendFailure>>,
    warned_unsigned: AtomicBool,
    funds_tx: broadcast::Sender<FundsReceived>,
    confirmations_tx: broadcast::Sender<String>,
}

impl DryRunWallet {
    pub fn new(address: &str) -> Self {
        let (funds_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (confirmations_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            address: address.to_string(),
            balance: Mutex::new(0),
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            warned_unsigned: AtomicBool::new(false),
            funds_tx,
            confirmations_tx,
        }
    }

    /// Wallet starting with `balance` sats.
    pub fn with_balance(address: &str, balance: Satoshis) -> Self {
        let wallet = Self::new(address);
        *lock(&wallet.balance) = balance;
        wallet
    }

    /// Make subsequent sends fail until reset with `None`.
    pub fn set_send_failure(&self, failure: Option<SendFailure>) {
        *lock(&self.failure) = failure;
    }

    /// Record an incoming payment and notify subscribers.
    pub fn receive_funds(&self, tx_hash: &str, amount: Satoshis, sender: Option<&str>) {
        let event = FundsReceived {
            tx_hash: tx_hash.to_string(),
            amount,
            sender: sender.map(str::to_string),
        };
        *lock(&self.balance) += amount;
        lock(&self.received).insert(tx_hash.to_string(), event.clone());
        debug!(tx = %tx_hash, amount, "dry-run: funds received");
        let _ = self.funds_tx.send(event);
    }

    /// Report one of our sends as confirmed.
    pub fn confirm(&self, txid: &str) {
        let _ = self.confirmations_tx.send(txid.to_string());
    }

    /// All recorded sends, oldest first.
    pub fn sent(&self) -> Vec<SentTransaction> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    fn record_send(&self, outputs: ArtistAmounts) -> Result<Option<String>> {
        if let Some(failure) = *lock(&self.failure) {
            warn!(?failure, "dry-run: send failure injected");
            return match failure {
                SendFailure::Error => Err(WalletError::SendFailed("injected failure".into())),
                SendFailure::NoTransaction => Ok(None),
            };
        }

        let total: Satoshis = outputs.values().sum();
        if let Some(&amount) = outputs.values().find(|&&a| a <= 0) {
            return Err(WalletError::InvalidAmount(amount));
        }
        {
            let mut balance = lock(&self.balance);
            if total > *balance {
                return Err(WalletError::InsufficientFunds {
                    needed: total,
                    available: *balance,
                });
            }
            *balance -= total;
        }

        let txid = hex::encode(rand::random::<[u8; 32]>());
        info!(txid = %txid, outputs = outputs.len(), total, "dry-run: recorded transaction");
        lock(&self.sent).push(SentTransaction {
            txid: txid.clone(),
            outputs,
        });
        Ok(Some(txid))
    }
}

#[async_trait::async_trait]
impl Wallet for DryRunWallet {
    fn settlement_address(&self) -> String {
        self.address.clone()
    }

    async fn current_balance(&self) -> Result<Satoshis> {
        Ok(*lock(&self.balance))
    }

    async fn send_multi_output(&self, outputs: &ArtistAmounts) -> Result<Option<String>> {
        if outputs.is_empty() {
            return Err(WalletError::SendFailed("no outputs".into()));
        }
        self.record_send(outputs.clone())
    }

    async fn send(&self, address: &str, amount: Satoshis) -> Result<Option<String>> {
        let mut outputs = ArtistAmounts::new();
        outputs.insert(address.to_string(), amount);
        self.record_send(outputs)
    }

    async fn sign(&self, message: &str) -> Result<String> {
        if !self.warned_unsigned.swap(true, Ordering::Relaxed) {
            warn!("dry-run wallet produces placeholder signatures");
        }
        Ok(format!("dryrun:{}", hex::encode(message.as_bytes())))
    }

    async fn received_funds(&self, tx_hash: &str) -> Result<Option<FundsReceived>> {
        Ok(lock(&self.received).get(tx_hash).cloned())
    }

    fn subscribe_funds_received(&self) -> broadcast::Receiver<FundsReceived> {
        self.funds_tx.subscribe()
    }

    fn subscribe_confirmations(&self) -> broadcast::Receiver<String> {
        self.confirmations_tx.subscribe()
    }
}

// A poisoned dry-run lock only means a test thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

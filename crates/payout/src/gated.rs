//! Test wallet whose sends park until released.

use std::sync::Arc;

use encore_core::{ArtistAmounts, Satoshis};
use encore_wallet::{DryRunWallet, FundsReceived, Result, Wallet};
use tokio::sync::{broadcast, Notify};

pub(crate) struct GatedWallet {
    pub inner: Arc<DryRunWallet>,
    entered: Notify,
    release: Notify,
}

impl GatedWallet {
    pub fn new(inner: Arc<DryRunWallet>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Resolves once a send is parked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the parked send through.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn gate(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[async_trait::async_trait]
impl Wallet for GatedWallet {
    fn settlement_address(&self) -> String {
        self.inner.settlement_address()
    }

    async fn current_balance(&self) -> Result<Satoshis> {
        self.inner.current_balance().await
    }

    async fn send_multi_output(&self, outputs: &ArtistAmounts) -> Result<Option<String>> {
        self.gate().await;
        self.inner.send_multi_output(outputs).await
    }

    async fn send(&self, address: &str, amount: Satoshis) -> Result<Option<String>> {
        self.gate().await;
        self.inner.send(address, amount).await
    }

    async fn sign(&self, message: &str) -> Result<String> {
        self.inner.sign(message).await
    }

    async fn received_funds(&self, tx_hash: &str) -> Result<Option<FundsReceived>> {
        self.inner.received_funds(tx_hash).await
    }

    fn subscribe_funds_received(&self) -> broadcast::Receiver<FundsReceived> {
        self.inner.subscribe_funds_received()
    }

    fn subscribe_confirmations(&self) -> broadcast::Receiver<String> {
        self.inner.subscribe_confirmations()
    }
}

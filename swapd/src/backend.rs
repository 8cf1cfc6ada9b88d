//! The capability surface consumed by swap drivers. The real implementation
//! binds the Ethereum contract client, the Monero wallet and the network
//! sender; tests substitute mocks. The backend never holds the swap manager:
//! it is passed to instances separately so ownership stays acyclic.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::B256;
use async_trait::async_trait;
use tracing::debug;

use eth_client::{CreatedSwap, LogPosition, NewSwapParams, SwapFactoryClient, SwapFactoryEvent};
use xmr_wallet::{LockWatcher, VerifyConfig, VerifyOutcome, XmrWallet};

use crate::config::Environment;
use crate::error::{Result, SwapError};
use crate::message::Envelope;
use crate::net::{MessageSender, NetError, PeerId};

#[async_trait]
pub trait Backend: Send + Sync {
    async fn eth_lock(&self, params: NewSwapParams) -> Result<CreatedSwap>;
    async fn eth_set_ready(&self, swap_id: B256) -> Result<String>;
    async fn eth_claim(&self, swap_id: B256, secret: [u8; 32]) -> Result<String>;
    async fn eth_refund(&self, swap_id: B256, secret: [u8; 32]) -> Result<String>;
    async fn eth_poll_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<(SwapFactoryEvent, LogPosition)>, u64)>;
    async fn eth_block_number(&self) -> Result<u64>;

    async fn xmr_transfer(&self, address: &str, amount_pico: u64) -> Result<String>;
    /// One verification round against the wallet: has the expected amount
    /// arrived at `address` with the environment's confirmation depth?
    async fn xmr_verify(&self, address: &str, amount_pico: u64) -> Result<VerifyOutcome>;
    async fn xmr_primary_address(&self) -> Result<String>;
    /// Opens the joint wallet from raw keys and, when a destination is given,
    /// sweeps its balance there. Restores the daemon wallet afterwards.
    async fn xmr_sweep_joint(
        &self,
        spend_key: [u8; 32],
        view_key: [u8; 32],
        joint_address: &str,
        wallet_name: &str,
        destination: Option<&str>,
    ) -> Result<Option<String>>;

    async fn net_send(&self, peer: &PeerId, envelope: Envelope) -> Result<()>;

    /// Unix seconds, comparable with contract-enforced timeouts.
    fn now(&self) -> u64;
    fn monero_network(&self) -> monero::Network;
    /// This daemon's ETH payout/signing address.
    fn eth_address(&self) -> alloy_primitives::Address;
}

pub struct SwapdBackend {
    factory: SwapFactoryClient,
    wallet: Arc<XmrWallet>,
    sender: Arc<dyn MessageSender>,
    env: Environment,
    wallet_file: String,
    wallet_password: Option<String>,
}

impl SwapdBackend {
    pub fn new(
        factory: SwapFactoryClient,
        wallet: Arc<XmrWallet>,
        sender: Arc<dyn MessageSender>,
        env: Environment,
        wallet_file: String,
        wallet_password: Option<String>,
    ) -> Self {
        Self {
            factory,
            wallet,
            sender,
            env,
            wallet_file,
            wallet_password,
        }
    }

    pub fn factory(&self) -> &SwapFactoryClient {
        &self.factory
    }
}

#[async_trait]
impl Backend for SwapdBackend {
    async fn eth_lock(&self, params: NewSwapParams) -> Result<CreatedSwap> {
        Ok(self.factory.new_swap(params).await?)
    }

    async fn eth_set_ready(&self, swap_id: B256) -> Result<String> {
        let outcome = self.factory.set_ready(swap_id).await?;
        Ok(outcome.tx_hash.to_string())
    }

    async fn eth_claim(&self, swap_id: B256, secret: [u8; 32]) -> Result<String> {
        let outcome = self.factory.claim(swap_id, secret).await?;
        Ok(outcome.tx_hash.to_string())
    }

    async fn eth_refund(&self, swap_id: B256, secret: [u8; 32]) -> Result<String> {
        let outcome = self.factory.refund(swap_id, secret).await?;
        Ok(outcome.tx_hash.to_string())
    }

    async fn eth_poll_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<(SwapFactoryEvent, LogPosition)>, u64)> {
        Ok(self.factory.poll_events(from_block).await?)
    }

    async fn eth_block_number(&self) -> Result<u64> {
        Ok(self.factory.eth().block_number().await?)
    }

    async fn xmr_transfer(&self, address: &str, amount_pico: u64) -> Result<String> {
        Ok(self.wallet.transfer(address, amount_pico).await?)
    }

    async fn xmr_verify(&self, address: &str, amount_pico: u64) -> Result<VerifyOutcome> {
        let config = VerifyConfig {
            confirmations_required: self.env.xmr_confirmations(),
            ..VerifyConfig::default()
        };
        let mut watcher = LockWatcher::new(config, address, amount_pico)?;
        Ok(watcher.poll(&self.wallet).await?)
    }

    async fn xmr_primary_address(&self) -> Result<String> {
        Ok(self.wallet.get_primary_address().await?)
    }

    async fn xmr_sweep_joint(
        &self,
        spend_key: [u8; 32],
        view_key: [u8; 32],
        joint_address: &str,
        wallet_name: &str,
        destination: Option<&str>,
    ) -> Result<Option<String>> {
        debug!(wallet = wallet_name, "Opening joint swap wallet");
        self.wallet.close_wallet().await?;
        self.wallet
            .import_spend_key(spend_key, view_key, joint_address, wallet_name, None)
            .await?;
        self.wallet.refresh(None).await?;

        let swept = match destination {
            Some(destination) => Some(self.wallet.sweep_all(destination).await?),
            None => None,
        };

        self.wallet.close_wallet().await?;
        self.wallet
            .open_wallet(&self.wallet_file, self.wallet_password.as_deref())
            .await?;
        Ok(swept)
    }

    async fn net_send(&self, peer: &PeerId, envelope: Envelope) -> Result<()> {
        self.sender.send(peer, envelope).await.map_err(|err| match err {
            NetError::PeerGone => SwapError::PeerGone,
            NetError::Other(message) => SwapError::BadInput(message),
        })
    }

    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn monero_network(&self) -> monero::Network {
        self.env.monero_network()
    }

    fn eth_address(&self) -> alloy_primitives::Address {
        // External-signer mode has no local key; the payout commitment is
        // opaque to the peer either way.
        self.factory
            .eth()
            .address()
            .unwrap_or(alloy_primitives::Address::ZERO)
    }
}

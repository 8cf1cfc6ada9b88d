//! XMR-maker protocol: provides XMR, receives ETH. The driver observes the
//! counterparty's ETH lock, locks XMR on the joint address, and claims the
//! ETH by revealing its spend share. If the taker refunds instead, the
//! revealed taker share lets the maker sweep its XMR back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::U256;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use eth_client::{pubkey_commitment, SwapFactoryEvent};
use swap_crypto::hex::hex_encode;
use swap_crypto::recover_secret;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::db::SwapStore;
use crate::driver::{
    contract_id, finalize, is_ours, poll_secs, spawn_event_pump, Shutdown, SwapDriver, SwapEvent,
};
use crate::error::{Result, SwapError};
use crate::keyex::{self, OwnKeys, TheirKeys};
use crate::manager::SwapManager;
use crate::message::{DoneOutcome, KeyExchangeParts, SwapMessage};
use crate::metrics::SwapMetrics;
use crate::net::PeerId;
use crate::state::{Asset, ExchangeRate, Swap, SwapRole, SwapState};

/// An open offer awaiting a counterparty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: String,
    pub xmr_amount: u128,
    pub eth_amount: u128,
    pub rate: ExchangeRate,
    pub tolerance_bps: u32,
}

/// The maker protocol instance: offer book plus driver supervision.
pub struct Maker<B: Backend + 'static> {
    backend: Arc<B>,
    manager: Arc<SwapManager>,
    store: SwapStore,
    metrics: Arc<dyn SwapMetrics>,
    shutdown: Shutdown,
    cfg: DriverConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend + 'static> Maker<B> {
    pub fn new(
        backend: Arc<B>,
        manager: Arc<SwapManager>,
        store: SwapStore,
        metrics: Arc<dyn SwapMetrics>,
        shutdown: Shutdown,
        cfg: DriverConfig,
    ) -> Self {
        Self {
            backend,
            manager,
            store,
            metrics,
            shutdown,
            cfg,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Publishes an offer: this side provides `xmr_amount` piconero for
    /// `eth_amount` wei.
    pub fn make_offer(&self, xmr_amount: u128, eth_amount: u128, tolerance_bps: u32) -> Result<Offer> {
        if xmr_amount == 0 || eth_amount == 0 {
            return Err(SwapError::BadInput("offer amounts must be positive".into()));
        }
        let rate = reduce_rate(eth_amount, xmr_amount)
            .ok_or_else(|| SwapError::BadInput("offer rate does not reduce to u64".into()))?;
        let mut id = [0u8; 32];
        OsRng.fill_bytes(&mut id);
        let offer = Offer {
            offer_id: hex_encode(&id),
            xmr_amount,
            eth_amount,
            rate,
            tolerance_bps,
        };
        let bytes = serde_json::to_vec_pretty(&offer)
            .map_err(|err| SwapError::Database(err.to_string()))?;
        self.store.save_offer(&offer.offer_id, &bytes)?;
        info!(offer_id = %offer.offer_id, xmr_amount, eth_amount, "offer published");
        Ok(offer)
    }

    pub fn offer_message(offer: &Offer) -> SwapMessage {
        SwapMessage::Offer {
            offer_id: offer.offer_id.clone(),
            provides: Asset::Xmr,
            provided_amount: offer.xmr_amount,
            desired_amount: offer.eth_amount,
            rate: offer.rate,
            tolerance_bps: offer.tolerance_bps,
        }
    }

    /// Entry point when a peer takes one of our offers. Registers the swap
    /// (one per peer) and starts its driver.
    pub async fn on_offer_accepted(&self, peer: PeerId, offer_id: &str) -> Result<()> {
        let bytes = self
            .store
            .load_offer(offer_id)?
            .ok_or_else(|| SwapError::BadPeer(format!("unknown offer {offer_id}")))?;
        let offer: Offer =
            serde_json::from_slice(&bytes).map_err(|err| SwapError::Database(err.to_string()))?;

        let mut swap = Swap::new(
            offer.offer_id.clone(),
            SwapRole::XmrMaker,
            peer,
            Asset::Xmr,
            offer.xmr_amount,
            offer.eth_amount,
            offer.rate,
            false,
        );
        swap.transition(SwapState::OfferAccepted)?;
        self.spawn(swap).await?;
        self.store.delete_offer(offer_id)
    }

    /// Restarts the driver of a persisted non-terminal swap.
    pub async fn resume(&self, swap: Swap) -> Result<()> {
        info!(offer_id = %swap.offer_id, state = ?swap.state, "resuming maker swap");
        self.spawn(swap).await
    }

    async fn spawn(&self, mut swap: Swap) -> Result<()> {
        let (input, events) = mpsc::channel(64);
        self.manager.new_swap(&swap.offer_id, &swap.peer, input.clone())?;
        if swap.start_block == 0 {
            swap.start_block = self.backend.eth_block_number().await.unwrap_or(0);
        }
        if let Err(err) = self.store.save_swap(&swap) {
            self.manager.complete(&swap.offer_id);
            return Err(err);
        }

        let start_block = swap.start_block;
        let mut driver = SwapDriver {
            swap,
            backend: self.backend.clone(),
            store: self.store.clone(),
            events,
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            cfg: self.cfg,
            manager: Some(self.manager.clone()),
        };
        let pump = spawn_event_pump(
            self.backend.clone(),
            input,
            self.shutdown.clone(),
            start_block,
            Duration::from_millis(self.cfg.poll_interval_ms),
        );
        let manager = self.manager.clone();
        let task = tokio::spawn(async move {
            let offer_id = driver.swap.offer_id.clone();
            let result = run(&mut driver).await;
            finalize(&mut driver, result).await;
            pump.abort();
            manager.complete(&offer_id);
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Waits for in-flight drivers, each bounded by `grace`.
    pub async fn drain(&self, grace: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = tokio::time::timeout(grace, task).await;
        }
    }
}

fn reduce_rate(desired: u128, provided: u128) -> Option<ExchangeRate> {
    let divisor = gcd(desired, provided);
    let num = u64::try_from(desired / divisor).ok()?;
    let den = u64::try_from(provided / divisor).ok()?;
    Some(ExchangeRate { num, den })
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a.max(1)
}

/// Drives one maker swap to a terminal state, resuming from whatever state
/// the record holds.
pub async fn run<B: Backend>(driver: &mut SwapDriver<B>) -> Result<SwapState> {
    loop {
        match driver.swap.state {
            SwapState::OfferAccepted => step_exchange_keys(driver).await?,
            SwapState::KeysExchanged => step_observe_eth_lock(driver).await?,
            SwapState::EthLocked => step_lock_xmr(driver).await?,
            SwapState::XmrLocked => step_await_claim_window(driver).await?,
            SwapState::ReadyToClaim => step_claim(driver).await?,
            state if state.is_terminal() => return Ok(state),
            state => {
                return Err(SwapError::Invariant(format!(
                    "maker cannot drive state {state:?}"
                )))
            }
        }
    }
}

async fn step_exchange_keys<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let own = if driver.swap.keys.own_spend_secret.is_some() {
        OwnKeys::from_material(&driver.swap.keys)?
    } else {
        let own = OwnKeys::generate(true)?;
        own.record_into(&mut driver.swap.keys);
        driver.persist()?;
        own
    };

    let deadline = driver.backend.now() + driver.cfg.key_exchange_timeout_secs;
    let parts = loop {
        match driver.wait_event(Some(deadline)).await? {
            Some(SwapEvent::Message(message @ SwapMessage::KeyExchange { .. })) => {
                break KeyExchangeParts::parse(&message)?
            }
            Some(_) => continue,
            None => {
                warn!(offer_id = %driver.swap.offer_id, "no key exchange from taker");
                driver.transition(SwapState::Aborted)?;
                return Ok(());
            }
        }
    };

    let their = TheirKeys::verify(&parts)?;
    their.record_into(&mut driver.swap.keys);
    let joint = keyex::joint_address(&own, &their, driver.backend.monero_network())?;
    driver.swap.joint_address = Some(joint);
    driver.persist()?;

    let reply = own.exchange_message(driver.backend.eth_address());
    driver.send_message(reply).await?;
    driver.transition(SwapState::KeysExchanged)
}

async fn step_observe_eth_lock<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let own = OwnKeys::from_material(&driver.swap.keys)?;
    let their = TheirKeys::from_material(&driver.swap.keys)?;
    let claim_commit = pubkey_commitment(&own.spend.public().secp256k1);
    let refund_commit = pubkey_commitment(&their.spend_secp);
    let expected_value = U256::from(driver.swap.eth_amount());

    let deadline = driver.backend.now() + driver.cfg.eth_lock_observe_secs;
    loop {
        match driver.wait_event(Some(deadline)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::New {
                swap_id,
                claim_key,
                refund_key,
                value,
                timeout_1,
                timeout_2,
            })) => {
                if claim_key != claim_commit || refund_key != refund_commit {
                    continue;
                }
                if value < expected_value {
                    warn!(offer_id = %driver.swap.offer_id, %value, "lock underfunded; ignoring");
                    continue;
                }
                let now = driver.backend.now();
                if !(timeout_2 > timeout_1 && timeout_1 > now) {
                    warn!(offer_id = %driver.swap.offer_id, timeout_1, timeout_2, "implausible timeouts; ignoring");
                    continue;
                }
                driver.swap.contract_swap_id = Some(hex_encode(&swap_id.0));
                driver.swap.timeout_1 = Some(timeout_1);
                driver.swap.timeout_2 = Some(timeout_2);
                driver.bind_contract_id(&hex_encode(&swap_id.0));
                return driver.transition(SwapState::EthLocked);
            }
            Some(SwapEvent::Message(SwapMessage::NotifyEthLocked { .. })) => {
                // Advisory only; the chain log is authoritative.
                debug!(offer_id = %driver.swap.offer_id, "taker reports ETH locked");
                continue;
            }
            Some(_) => continue,
            None => {
                warn!(offer_id = %driver.swap.offer_id, "ETH lock not observed; aborting");
                driver.transition(SwapState::Aborted)?;
                return Ok(());
            }
        }
    }
}

async fn step_lock_xmr<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let joint = driver
        .swap
        .joint_address
        .clone()
        .ok_or_else(|| SwapError::Invariant("missing joint address".into()))?;
    let amount: u64 = driver
        .swap
        .xmr_amount()
        .try_into()
        .map_err(|_| SwapError::Invariant("XMR amount exceeds u64 piconero".into()))?;

    if driver.swap.xmr_lock_tx.is_none() {
        if driver.shutdown.is_cancelled() {
            return Err(SwapError::Cancelled);
        }
        let tx_hash = driver.backend.xmr_transfer(&joint, amount).await?;
        info!(offer_id = %driver.swap.offer_id, %tx_hash, "XMR lock submitted");
        driver.swap.xmr_lock_tx = Some(tx_hash);
        driver.persist()?;
    }

    loop {
        match driver.backend.xmr_verify(&joint, amount).await {
            Ok(outcome) if outcome.is_confirmed() => break,
            Ok(outcome) => debug!(offer_id = %driver.swap.offer_id, ?outcome, "awaiting XMR lock"),
            Err(err) => warn!(error = %err, "wallet verification read failed; retrying"),
        }
        let tick = driver.backend.now() + poll_secs(driver.cfg);
        match driver.wait_event(Some(tick)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Refunded { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return sweep_back(driver, secret).await;
            }
            _ => {}
        }
    }

    let tx_hash = driver.swap.xmr_lock_tx.clone().unwrap_or_default();
    if let Err(err) = driver
        .send_message(SwapMessage::NotifyXmrLocked { tx_hash })
        .await
    {
        // The claim does not depend on the peer; a vanished taker only
        // forfeits its own verification window.
        warn!(error = %err, "could not announce XMR lock");
    }
    driver.transition(SwapState::XmrLocked)
}

async fn step_await_claim_window<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t1 = driver
        .swap
        .timeout_1
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
    loop {
        if driver.backend.now() >= t1 {
            break;
        }
        match driver.wait_event(Some(t1)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Ready { swap_id }))
                if is_ours(&driver.swap, swap_id) =>
            {
                break;
            }
            Some(SwapEvent::Message(SwapMessage::NotifyReady {})) => break,
            Some(SwapEvent::Chain(SwapFactoryEvent::Refunded { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return sweep_back(driver, secret).await;
            }
            Some(_) => continue,
            None => break,
        }
    }
    driver.transition(SwapState::ReadyToClaim)
}

async fn step_claim<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t1 = driver
        .swap
        .timeout_1
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
    let t2 = driver
        .swap
        .timeout_2
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;

    // The contract only accepts claims inside (t1, t2).
    while driver.backend.now() < t1 {
        match driver.wait_event(Some(t1)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Refunded { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return sweep_back(driver, secret).await;
            }
            _ => continue,
        }
    }
    if driver.backend.now() >= t2 {
        warn!(offer_id = %driver.swap.offer_id, "claim window missed; waiting for refund reveal");
        return await_refund_reveal(driver).await;
    }

    if driver.shutdown.is_cancelled() {
        return Err(SwapError::Cancelled);
    }
    let own = OwnKeys::from_material(&driver.swap.keys)?;
    let contract_id = contract_id(&driver.swap)?;
    let secret = own.spend.secret().to_bytes();
    driver.persist()?;

    let backend = driver.backend.clone();
    let outcome = driver
        .retry_chain("claim", Some(t2), || {
            let backend = backend.clone();
            async move { backend.eth_claim(contract_id, secret).await }
        })
        .await;

    match outcome {
        Ok(tx_hash) => {
            driver.swap.eth_final_tx = Some(tx_hash);
            driver.persist()?;
            let _ = driver
                .send_message(SwapMessage::NotifyDone {
                    outcome: DoneOutcome::Claimed,
                })
                .await;
            driver.transition(SwapState::Claimed)
        }
        Err(SwapError::Chain(err)) if !err.is_transient() => {
            // Lost the window race; the taker's refund reveals its share.
            warn!(error = %err, "claim rejected; watching for refund");
            await_refund_reveal(driver).await
        }
        Err(err) => Err(err),
    }
}

/// Blocks until the taker's refund reveals its spend share, then recovers
/// the locked XMR.
async fn await_refund_reveal<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    loop {
        match driver.wait_event(None).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Refunded { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return sweep_back(driver, secret).await;
            }
            _ => continue,
        }
    }
}

/// The taker refunded, revealing its spend share: reconstruct the joint key
/// and move the XMR back to this wallet, if any was locked.
async fn sweep_back<B: Backend>(driver: &mut SwapDriver<B>, secret: [u8; 32]) -> Result<()> {
    if driver.swap.xmr_lock_tx.is_some() {
        let own = OwnKeys::from_material(&driver.swap.keys)?;
        let their = TheirKeys::from_material(&driver.swap.keys)?;
        let joint = driver
            .swap
            .joint_address
            .clone()
            .ok_or_else(|| SwapError::Invariant("missing joint address".into()))?;
        match recover_secret(secret) {
            Ok(revealed) => {
                let spend = keyex::joint_spend_secret(&own, &revealed);
                let view = keyex::joint_view_secret(&own, &their);
                let destination = driver.backend.xmr_primary_address().await?;
                let wallet_name = format!("swap-sweep-{}", driver.swap.offer_id);
                match driver
                    .backend
                    .xmr_sweep_joint(spend, view, &joint, &wallet_name, Some(&destination))
                    .await
                {
                    Ok(tx) => driver.swap.xmr_final_tx = tx,
                    // Keys are persisted; recovery can be re-run offline.
                    Err(err) => warn!(error = %err, "sweep back failed"),
                }
            }
            Err(err) => warn!(error = %err, "revealed refund secret is invalid"),
        }
    }
    driver.transition(SwapState::Refunded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_reduce() {
        let rate = reduce_rate(10_000_000_000_000u128, 1_000u128).unwrap();
        assert_eq!(rate.num, 10_000_000_000);
        assert_eq!(rate.den, 1);
    }

    #[test]
    fn oversized_rates_are_rejected() {
        assert!(reduce_rate(u128::MAX, 3).is_none());
    }
}

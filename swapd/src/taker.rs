//! XMR-taker protocol: provides ETH, receives XMR. The driver locks ETH on
//! the contract, verifies the maker's XMR lock, marks the swap ready, and
//! sweeps the XMR once the maker's claim reveals its spend share. Any
//! deviation before t1 resolves through the unilateral refund path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::U256;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use eth_client::{pubkey_commitment, NewSwapParams, SwapFactoryEvent};
use swap_crypto::hex::hex_encode;
use swap_crypto::recover_secret;
use xmr_wallet::VerifyOutcome;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::db::SwapStore;
use crate::driver::{
    contract_id, finalize, is_ours, poll_secs, spawn_event_pump, Shutdown, SwapDriver, SwapEvent,
};
use crate::error::{Result, SwapError};
use crate::keyex::{self, OwnKeys, TheirKeys};
use crate::maker::Offer;
use crate::manager::SwapManager;
use crate::message::{DoneOutcome, Envelope, KeyExchangeParts, SwapMessage};
use crate::metrics::SwapMetrics;
use crate::net::PeerId;
use crate::state::{Asset, Swap, SwapRole, SwapState};

/// The taker protocol instance.
pub struct Taker<B: Backend + 'static> {
    backend: Arc<B>,
    manager: Arc<SwapManager>,
    store: SwapStore,
    metrics: Arc<dyn SwapMetrics>,
    shutdown: Shutdown,
    cfg: DriverConfig,
    transfer_back: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend + 'static> Taker<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<B>,
        manager: Arc<SwapManager>,
        store: SwapStore,
        metrics: Arc<dyn SwapMetrics>,
        shutdown: Shutdown,
        cfg: DriverConfig,
        transfer_back: bool,
    ) -> Self {
        Self {
            backend,
            manager,
            store,
            metrics,
            shutdown,
            cfg,
            transfer_back,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Takes a maker's offer: registers the swap, notifies the maker and
    /// starts the driver. Returns the offer id the swap runs under.
    pub async fn take_offer(&self, peer: PeerId, offer: Offer) -> Result<String> {
        if offer.xmr_amount == 0 || offer.eth_amount == 0 {
            return Err(SwapError::BadInput("offer amounts must be positive".into()));
        }
        if !offer
            .rate
            .within_tolerance(offer.xmr_amount, offer.eth_amount, offer.tolerance_bps)
        {
            return Err(SwapError::BadInput("offer rate outside tolerance".into()));
        }

        let mut swap = Swap::new(
            offer.offer_id.clone(),
            SwapRole::XmrTaker,
            peer.clone(),
            Asset::Eth,
            offer.eth_amount,
            offer.xmr_amount,
            offer.rate,
            self.transfer_back,
        );
        swap.transition(SwapState::OfferAccepted)?;

        let (input, events) = mpsc::channel(64);
        self.manager.new_swap(&swap.offer_id, &peer, input.clone())?;

        let accept = Envelope::new(
            swap.offer_id.clone(),
            SwapMessage::OfferAccepted {
                offer_id: swap.offer_id.clone(),
            },
        );
        if let Err(err) = self.backend.net_send(&peer, accept).await {
            self.manager.complete(&swap.offer_id);
            return Err(err);
        }

        let offer_id = swap.offer_id.clone();
        self.spawn(swap, input, events).await?;
        Ok(offer_id)
    }

    /// Restarts the driver of a persisted non-terminal swap.
    pub async fn resume(&self, swap: Swap) -> Result<()> {
        info!(offer_id = %swap.offer_id, state = ?swap.state, "resuming taker swap");
        let (input, events) = mpsc::channel(64);
        self.manager.new_swap(&swap.offer_id, &swap.peer, input.clone())?;
        self.spawn(swap, input, events).await
    }

    async fn spawn(
        &self,
        mut swap: Swap,
        input: mpsc::Sender<SwapEvent>,
        events: mpsc::Receiver<SwapEvent>,
    ) -> Result<()> {
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

    pub async fn drain(&self, grace: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = tokio::time::timeout(grace, task).await;
        }
    }
}

/// Drives one taker swap to a terminal state, resuming from whatever state
/// the record holds.
pub async fn run<B: Backend>(driver: &mut SwapDriver<B>) -> Result<SwapState> {
    loop {
        match driver.swap.state {
            SwapState::OfferAccepted => step_exchange_keys(driver).await?,
            SwapState::KeysExchanged => step_lock_eth(driver).await?,
            SwapState::EthLocked => step_await_xmr_lock(driver).await?,
            SwapState::XmrLocked => step_set_ready(driver).await?,
            SwapState::ReadyToClaim => step_await_claim(driver).await?,
            state if state.is_terminal() => return Ok(state),
            state => {
                return Err(SwapError::Invariant(format!(
                    "taker cannot drive state {state:?}"
                )))
            }
        }
    }
}

async fn step_exchange_keys<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let own = if driver.swap.keys.own_spend_secret.is_some() {
        OwnKeys::from_material(&driver.swap.keys)?
    } else {
        let own = OwnKeys::generate(false)?;
        own.record_into(&mut driver.swap.keys);
        driver.persist()?;
        own
    };

    let hello = own.exchange_message(driver.backend.eth_address());
    driver.send_message(hello).await?;

    let deadline = driver.backend.now() + driver.cfg.key_exchange_timeout_secs;
    let parts = loop {
        match driver.wait_event(Some(deadline)).await? {
            Some(SwapEvent::Message(message @ SwapMessage::KeyExchange { .. })) => {
                break KeyExchangeParts::parse(&message)?
            }
            Some(_) => continue,
            None => {
                warn!(offer_id = %driver.swap.offer_id, "no key exchange from maker");
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
    driver.transition(SwapState::KeysExchanged)
}

async fn step_lock_eth<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let own = OwnKeys::from_material(&driver.swap.keys)?;
    let their = TheirKeys::from_material(&driver.swap.keys)?;
    let claim_commit = pubkey_commitment(&their.spend_secp);
    let refund_commit = pubkey_commitment(&own.spend.public().secp256k1);

    // Crash safety: adopt a lock that already landed before resubmitting.
    if let Ok((events, _)) = driver.backend.eth_poll_events(driver.swap.start_block).await {
        for (event, _) in events {
            if let SwapFactoryEvent::New {
                swap_id,
                claim_key,
                refund_key,
                timeout_1,
                timeout_2,
                ..
            } = event
            {
                if claim_key == claim_commit && refund_key == refund_commit {
                    info!(offer_id = %driver.swap.offer_id, "adopting existing ETH lock");
                    return record_eth_lock(driver, swap_id.0, timeout_1, timeout_2, None).await;
                }
            }
        }
    }

    if driver.shutdown.is_cancelled() {
        return Err(SwapError::Cancelled);
    }
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    let params = NewSwapParams {
        claim_commitment: claim_commit,
        refund_commitment: refund_commit,
        timeout_duration_1: driver.cfg.timeout_duration_secs,
        timeout_duration_2: driver.cfg.timeout_duration_secs,
        nonce: U256::from_be_slice(&nonce),
        value: U256::from(driver.swap.eth_amount()),
    };
    driver.persist()?;

    let deadline = driver.backend.now() + driver.cfg.eth_lock_deadline_secs;
    let backend = driver.backend.clone();
    let created = match driver
        .retry_chain("new_swap", Some(deadline), || {
            let backend = backend.clone();
            let params = params.clone();
            async move { backend.eth_lock(params).await }
        })
        .await
    {
        Ok(created) => created,
        Err(SwapError::Cancelled) => return Err(SwapError::Cancelled),
        Err(err) => {
            warn!(offer_id = %driver.swap.offer_id, error = %err, "ETH lock failed; aborting");
            driver.transition(SwapState::Aborted)?;
            return Ok(());
        }
    };

    let tx_hash = created.outcome.tx_hash.to_string();
    record_eth_lock(
        driver,
        created.swap_id.0,
        created.timeout_1,
        created.timeout_2,
        Some(tx_hash),
    )
    .await
}

async fn record_eth_lock<B: Backend>(
    driver: &mut SwapDriver<B>,
    swap_id: [u8; 32],
    timeout_1: u64,
    timeout_2: u64,
    tx_hash: Option<String>,
) -> Result<()> {
    let id_hex = hex_encode(&swap_id);
    driver.swap.contract_swap_id = Some(id_hex.clone());
    driver.swap.timeout_1 = Some(timeout_1);
    driver.swap.timeout_2 = Some(timeout_2);
    if tx_hash.is_some() {
        driver.swap.eth_lock_tx = tx_hash;
    }
    driver.bind_contract_id(&id_hex);
    driver.transition(SwapState::EthLocked)?;

    let notice = SwapMessage::NotifyEthLocked {
        contract_swap_id: id_hex,
        amount: driver.swap.eth_amount(),
        timeout_1,
        timeout_2,
    };
    if let Err(err) = driver.send_message(notice).await {
        // Advisory; the maker watches the chain.
        warn!(error = %err, "could not announce ETH lock");
    }
    Ok(())
}

async fn step_await_xmr_lock<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t1 = driver
        .swap
        .timeout_1
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
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
    let refund_at = t1.saturating_sub(driver.cfg.refund_buffer_secs);
    let mut announced = driver.swap.xmr_lock_tx.is_some();

    loop {
        if driver.backend.now() >= refund_at {
            warn!(offer_id = %driver.swap.offer_id, "XMR lock not confirmed before refund window");
            return refund_or_follow_claim(driver).await;
        }
        if announced {
            match driver.backend.xmr_verify(&joint, amount).await {
                Ok(outcome) if outcome.is_confirmed() => break,
                Ok(VerifyOutcome::Underpaid { received }) => {
                    warn!(offer_id = %driver.swap.offer_id, received, "XMR lock underpaid");
                    return refund_or_follow_claim(driver).await;
                }
                Ok(outcome) => debug!(offer_id = %driver.swap.offer_id, ?outcome, "awaiting XMR lock"),
                Err(err) => warn!(error = %err, "wallet verification read failed; retrying"),
            }
        }
        let tick = refund_at.min(driver.backend.now() + poll_secs(driver.cfg));
        match driver.wait_event(Some(tick)).await? {
            Some(SwapEvent::Message(SwapMessage::NotifyXmrLocked { tx_hash })) => {
                driver.swap.xmr_lock_tx = Some(tx_hash);
                driver.persist()?;
                announced = true;
            }
            Some(SwapEvent::RefundRequested) => {
                info!(offer_id = %driver.swap.offer_id, "refund requested");
                return refund_or_follow_claim(driver).await;
            }
            Some(SwapEvent::Chain(SwapFactoryEvent::Claimed { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return claim_observed(driver, secret).await;
            }
            _ => {}
        }
    }

    driver.transition(SwapState::XmrLocked)
}

async fn step_set_ready<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t1 = driver
        .swap
        .timeout_1
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;

    if driver.backend.now() < t1 {
        if driver.shutdown.is_cancelled() {
            return Err(SwapError::Cancelled);
        }
        let id = contract_id(&driver.swap)?;
        driver.persist()?;
        let backend = driver.backend.clone();
        match driver
            .retry_chain("set_ready", Some(t1), || {
                let backend = backend.clone();
                async move { backend.eth_set_ready(id).await }
            })
            .await
        {
            Ok(tx_hash) => debug!(offer_id = %driver.swap.offer_id, %tx_hash, "swap marked ready"),
            Err(SwapError::Chain(err)) if !err.is_transient() => {
                // Not fatal: the claim window opens at t1 regardless.
                warn!(error = %err, "set_ready rejected");
            }
            Err(err) => return Err(err),
        }
        let _ = driver.send_message(SwapMessage::NotifyReady {}).await;
    }
    driver.transition(SwapState::ReadyToClaim)
}

async fn step_await_claim<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t2 = driver
        .swap
        .timeout_2
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
    loop {
        match driver.wait_event(Some(t2)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Claimed { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return claim_observed(driver, secret).await;
            }
            Some(SwapEvent::RefundRequested) => {
                // Between t1 and t2 only the maker can move the swap.
                warn!(offer_id = %driver.swap.offer_id, "refund locked out until t2");
                continue;
            }
            Some(_) => continue,
            None => {
                info!(offer_id = %driver.swap.offer_id, "no claim before t2; refunding");
                return refund_or_follow_claim(driver).await;
            }
        }
    }
}

/// Submits the refund whenever the contract window allows it, watching for a
/// racing claim the whole time. A claim that lands first still pays out: the
/// revealed share lets this side sweep the XMR.
async fn refund_or_follow_claim<B: Backend>(driver: &mut SwapDriver<B>) -> Result<()> {
    let t1 = driver
        .swap
        .timeout_1
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
    let t2 = driver
        .swap
        .timeout_2
        .ok_or_else(|| SwapError::Invariant("missing timeout".into()))?;
    let own = OwnKeys::from_material(&driver.swap.keys)?;
    let id = contract_id(&driver.swap)?;
    let secret = own.spend.secret().to_bytes();

    loop {
        let now = driver.backend.now();
        if now < t1 || now >= t2 {
            if driver.shutdown.is_cancelled() {
                return Err(SwapError::Cancelled);
            }
            driver.persist()?;
            let deadline = if now < t1 { t1 } else { now + 30 };
            let backend = driver.backend.clone();
            match driver
                .retry_chain("refund", Some(deadline), || {
                    let backend = backend.clone();
                    async move { backend.eth_refund(id, secret).await }
                })
                .await
            {
                Ok(tx_hash) => {
                    driver.swap.eth_final_tx = Some(tx_hash);
                    driver.persist()?;
                    let _ = driver
                        .send_message(SwapMessage::NotifyDone {
                            outcome: DoneOutcome::Refunded,
                        })
                        .await;
                    return driver.transition(SwapState::Refunded);
                }
                Err(SwapError::Chain(err)) if !err.is_transient() => {
                    warn!(error = %err, "refund rejected; checking for a racing claim");
                }
                Err(err) => return Err(err),
            }
        }

        let wake = if now < t1 {
            t1
        } else if now < t2 {
            t2
        } else {
            now + poll_secs(driver.cfg)
        };
        match driver.wait_event(Some(wake)).await? {
            Some(SwapEvent::Chain(SwapFactoryEvent::Claimed { swap_id, secret }))
                if is_ours(&driver.swap, swap_id) =>
            {
                return claim_observed(driver, secret).await;
            }
            _ => continue,
        }
    }
}

/// The maker claimed, revealing its spend share: reconstruct the joint key
/// and take the XMR.
async fn claim_observed<B: Backend>(driver: &mut SwapDriver<B>, secret: [u8; 32]) -> Result<()> {
    info!(offer_id = %driver.swap.offer_id, "claim observed; recovering XMR");
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
            let destination = if driver.swap.transfer_back {
                Some(driver.backend.xmr_primary_address().await?)
            } else {
                None
            };
            let wallet_name = format!("swap-claim-{}", driver.swap.offer_id);
            match driver
                .backend
                .xmr_sweep_joint(spend, view, &joint, &wallet_name, destination.as_deref())
                .await
            {
                Ok(tx) => driver.swap.xmr_final_tx = tx,
                // Keys are persisted; recovery can be re-run offline.
                Err(err) => warn!(error = %err, "XMR recovery failed"),
            }
        }
        Err(err) => warn!(error = %err, "revealed claim secret is invalid"),
    }
    driver.transition(SwapState::Claimed)
}

//! Shared driver plumbing. Each active swap owns one driver task: the sole
//! mutator of its record. The task consumes inbound network messages, chain
//! events and refund requests from one queue, sleeps until the nearest
//! timeout otherwise, and treats cancellation as "persist and exit".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use eth_client::SwapFactoryEvent;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::db::SwapStore;
use crate::error::{Result, SwapError};
use crate::message::{Envelope, SwapMessage};
use crate::metrics::SwapMetrics;
use crate::state::{Swap, SwapState};

/// Inputs a driver can act on.
#[derive(Debug, Clone)]
pub enum SwapEvent {
    Message(SwapMessage),
    Chain(SwapFactoryEvent),
    RefundRequested,
}

/// Root cancellation signal. Cloned into every task; observing it means
/// persist current state and exit without initiating new chain actions.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Doubles the base per attempt, capped at 2^10 so late retries stay sane.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(10)))
}

/// State shared by both role drivers.
pub struct SwapDriver<B: Backend> {
    pub swap: Swap,
    pub backend: Arc<B>,
    pub store: SwapStore,
    pub events: mpsc::Receiver<SwapEvent>,
    pub shutdown: Shutdown,
    pub metrics: Arc<dyn SwapMetrics>,
    pub cfg: DriverConfig,
    /// Registry to bind the contract-assigned id into; absent in unit tests.
    pub manager: Option<Arc<crate::manager::SwapManager>>,
}

impl<B: Backend> SwapDriver<B> {
    pub fn bind_contract_id(&self, contract_id: &str) {
        if let Some(manager) = &self.manager {
            manager.bind_contract_id(&self.swap.offer_id, contract_id);
        }
    }
}

impl<B: Backend> SwapDriver<B> {
    pub fn persist(&self) -> Result<()> {
        self.store.save_swap(&self.swap)
    }

    /// Applies a transition, persists the record and reports it.
    pub fn transition(&mut self, next: SwapState) -> Result<()> {
        let from = self.swap.state;
        self.swap.transition(next)?;
        self.persist()?;
        self.metrics.record_transition(&self.swap.offer_id, from, next);
        info!(offer_id = %self.swap.offer_id, ?from, ?next, "swap advanced");
        Ok(())
    }

    /// Waits for the next input. `deadline` is an absolute unix timestamp;
    /// reaching it yields `Ok(None)`. Cancellation yields `Err(Cancelled)`.
    pub async fn wait_event(&mut self, deadline: Option<u64>) -> Result<Option<SwapEvent>> {
        let sleep_for = match deadline {
            Some(at) => {
                let now = self.backend.now();
                if at <= now {
                    return Ok(None);
                }
                Duration::from_secs(at - now)
            }
            // No timeout pending; wake on input or cancellation only.
            None => Duration::from_secs(24 * 3600),
        };

        tokio::select! {
            event = self.events.recv() => match event {
                Some(event) => Ok(Some(event)),
                None => Err(SwapError::Cancelled),
            },
            _ = tokio::time::sleep(sleep_for) => Ok(None),
            _ = self.shutdown.cancelled() => Err(SwapError::Cancelled),
        }
    }

    /// Sends a message to the counterparty, retrying temporary unreachability
    /// with bounded backoff.
    pub async fn send_message(&mut self, message: SwapMessage) -> Result<()> {
        let envelope = Envelope::new(self.swap.offer_id.clone(), message);
        let mut attempt = 0u32;
        loop {
            match self.backend.net_send(&self.swap.peer, envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(SwapError::PeerGone) if attempt < self.cfg.send_retries => {
                    attempt += 1;
                    warn!(
                        offer_id = %self.swap.offer_id,
                        attempt,
                        "peer unreachable; retrying send"
                    );
                    let delay = backoff_delay(self.cfg.send_backoff_ms, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(SwapError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Retries a chain action while it fails transiently, bounded by an
    /// absolute deadline. Permanent errors surface immediately.
    pub async fn retry_chain<T, F, Fut>(
        &mut self,
        label: &'static str,
        deadline: Option<u64>,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(SwapError::Chain(err)) if err.is_transient() => {
                    if let Some(at) = deadline {
                        if self.backend.now() >= at {
                            return Err(SwapError::Chain(err));
                        }
                    }
                    attempt += 1;
                    warn!(attempt, error = %err, "transient chain error on {label}; retrying");
                    let delay = backoff_delay(self.cfg.send_backoff_ms, attempt.min(6));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(SwapError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Records the outcome of a finished driver. Cancellation persists the
/// current state untouched; unexpected errors abort only while no funds are
/// locked, otherwise the record stays non-terminal for resume.
pub async fn finalize<B: Backend>(driver: &mut SwapDriver<B>, result: Result<SwapState>) {
    match result {
        Ok(state) => {
            info!(offer_id = %driver.swap.offer_id, ?state, "swap finished");
        }
        Err(SwapError::Cancelled) => {
            let _ = driver.persist();
            info!(offer_id = %driver.swap.offer_id, state = ?driver.swap.state, "driver cancelled; state persisted");
        }
        Err(err) => {
            warn!(offer_id = %driver.swap.offer_id, error = %err, "driver failed");
            if !driver.swap.state.is_terminal() && !driver.swap.state.funds_at_risk() {
                let _ = driver.transition(SwapState::Aborted);
            } else {
                let _ = driver.persist();
            }
        }
    }
}

/// True when a contract event belongs to this swap.
pub fn is_ours(swap: &Swap, id: alloy_primitives::B256) -> bool {
    swap.contract_swap_id.as_deref() == Some(swap_crypto::hex::hex_encode(&id.0).as_str())
}

/// Parses the stored contract swap id.
pub fn contract_id(swap: &Swap) -> Result<alloy_primitives::B256> {
    let hex = swap
        .contract_swap_id
        .as_deref()
        .ok_or_else(|| SwapError::Invariant("missing contract swap id".into()))?;
    Ok(alloy_primitives::B256::from(swap_crypto::hex::decode_hex_32(hex)?))
}

pub fn poll_secs(cfg: DriverConfig) -> u64 {
    (cfg.poll_interval_ms / 1_000).max(1)
}

/// Forwards decoded contract events into a driver's input queue from a block
/// checkpoint. Read failures are retried indefinitely.
pub fn spawn_event_pump<B: Backend + 'static>(
    backend: Arc<B>,
    events: mpsc::Sender<SwapEvent>,
    mut shutdown: Shutdown,
    mut from_block: u64,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            match backend.eth_poll_events(from_block).await {
                Ok((batch, next)) => {
                    from_block = next;
                    for (event, _position) in batch {
                        if events.send(SwapEvent::Chain(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "contract event poll failed; will retry");
                }
            }
        }
    })
}

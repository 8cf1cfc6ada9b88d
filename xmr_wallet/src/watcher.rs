use std::str::FromStr;

use monero_rpc::monero::Address;
use monero_rpc::{GotTransfer, TransferHeight};
use tracing::{debug, warn};

use anyhow::anyhow;

use crate::rpc::XmrWallet;
use crate::types::Result;

#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    pub confirmations_required: u64,
    pub reorg_buffer: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            confirmations_required: 10,
            reorg_buffer: 5,
        }
    }
}

/// A transfer observed towards the watched address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    Pool { amount: u64 },
    Chained { amount: u64, height: u64 },
}

/// Verification verdict for a lock transfer at a specific address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    NotSeen,
    Underpaid {
        received: u64,
    },
    InPool {
        amount: u64,
    },
    AwaitingConfirmations {
        observed_height: u64,
        current_height: u64,
        remaining: u64,
    },
    Confirmed {
        observed_height: u64,
        confirmations: u64,
    },
    ReorgDetected {
        previous_height: u64,
        current_height: u64,
    },
}

impl VerifyOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Watches one address for a lock transfer of an exact expected amount. All
/// observations flow through [`LockWatcher::record`]: it folds a batch of
/// sightings plus the current chain tip into the verdict. A tip that moves
/// backwards past the buffer invalidates the observed lock, which then has
/// to reconfirm from scratch.
pub struct LockWatcher {
    config: VerifyConfig,
    address: Address,
    expected_pico: u64,
    tip: u64,
    lock_height: Option<u64>,
    shortfall: u64,
}

impl LockWatcher {
    pub fn new(config: VerifyConfig, address: &str, expected_pico: u64) -> Result<Self> {
        let address =
            Address::from_str(address).map_err(|err| anyhow!("invalid watch address: {err}"))?;
        Ok(Self {
            config,
            address,
            expected_pico,
            tip: 0,
            lock_height: None,
            shortfall: 0,
        })
    }

    /// Folds a batch of sightings into the watcher and returns the current
    /// verdict at `current_height`.
    pub fn record(&mut self, sightings: &[Sighting], current_height: u64) -> VerifyOutcome {
        if self.tip > current_height + self.config.reorg_buffer {
            let previous = self.tip;
            warn!(
                previous_height = previous,
                current_height,
                "chain tip moved back past the buffer; lock must reconfirm"
            );
            self.tip = current_height;
            self.lock_height = None;
            return VerifyOutcome::ReorgDetected {
                previous_height: previous,
                current_height,
            };
        }
        self.tip = self.tip.max(current_height);

        let mut pool_amount = None;
        for sighting in sightings {
            match *sighting {
                Sighting::Chained { amount, height } if amount >= self.expected_pico => {
                    if self.lock_height.is_none() {
                        debug!(height, amount, "qualifying lock transfer on chain");
                    }
                    let earliest = self.lock_height.map_or(height, |seen| seen.min(height));
                    self.lock_height = Some(earliest);
                }
                Sighting::Pool { amount } if amount >= self.expected_pico => {
                    pool_amount = Some(amount);
                }
                Sighting::Pool { amount } | Sighting::Chained { amount, .. } => {
                    self.shortfall = self.shortfall.max(amount);
                }
            }
        }

        match (self.lock_height, pool_amount) {
            (Some(observed_height), _) => {
                let confirmations = current_height.saturating_sub(observed_height);
                let required = self.config.confirmations_required;
                if confirmations >= required {
                    VerifyOutcome::Confirmed {
                        observed_height,
                        confirmations,
                    }
                } else {
                    VerifyOutcome::AwaitingConfirmations {
                        observed_height,
                        current_height,
                        remaining: required - confirmations,
                    }
                }
            }
            (None, Some(amount)) => VerifyOutcome::InPool { amount },
            (None, None) if self.shortfall > 0 => VerifyOutcome::Underpaid {
                received: self.shortfall,
            },
            (None, None) => VerifyOutcome::NotSeen,
        }
    }

    /// Refreshes the wallet and folds in any transfers towards the watched
    /// address.
    pub async fn poll(&mut self, wallet: &XmrWallet) -> Result<VerifyOutcome> {
        let current_height = wallet.get_height().await?;
        let refresh_from = (self.tip > 0).then_some(self.tip);
        wallet.refresh(refresh_from).await?;
        let transfers = wallet.get_incoming_transfers().await?;
        let sightings: Vec<Sighting> = transfers
            .iter()
            .filter(|transfer| transfer.address == self.address)
            .map(sighting_of)
            .collect();
        Ok(self.record(&sightings, current_height))
    }
}

fn sighting_of(transfer: &GotTransfer) -> Sighting {
    let amount = transfer.amount.as_pico();
    match transfer.height {
        TransferHeight::InPool => Sighting::Pool { amount },
        TransferHeight::Confirmed(height) => Sighting::Chained {
            amount,
            height: height.get(),
        },
    }
}

//! Swap records and the shared state-transition table.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    Xmr,
    Eth,
}

impl Asset {
    pub fn other(self) -> Self {
        match self {
            Self::Xmr => Self::Eth,
            Self::Eth => Self::Xmr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    /// Provides XMR, receives ETH.
    XmrMaker,
    /// Provides ETH, receives XMR.
    XmrTaker,
}

/// Rational exchange rate: desired = provided * num / den.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub num: u64,
    pub den: u64,
}

impl ExchangeRate {
    pub fn desired_for(&self, provided: u128) -> Option<u128> {
        if self.den == 0 {
            return None;
        }
        provided
            .checked_mul(self.num as u128)
            .map(|scaled| scaled / self.den as u128)
    }

    /// Checks `desired` against the rate within `tolerance_bps` basis points.
    pub fn within_tolerance(&self, provided: u128, desired: u128, tolerance_bps: u32) -> bool {
        let Some(expected) = self.desired_for(provided) else {
            return false;
        };
        if expected == 0 {
            return desired == 0;
        }
        let diff = expected.abs_diff(desired);
        diff.saturating_mul(10_000) <= expected.saturating_mul(tolerance_bps as u128)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    OfferAccepted,
    KeysExchanged,
    EthLocked,
    XmrLocked,
    ReadyToClaim,
    Claimed,
    Refunded,
    Aborted,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Claimed | Self::Refunded | Self::Aborted)
    }

    /// True once a chain holds funds for this swap and an abort without a
    /// refund path would strand them.
    pub fn funds_at_risk(self) -> bool {
        matches!(self, Self::EthLocked | Self::XmrLocked | Self::ReadyToClaim)
    }
}

/// Legal transitions of the shared skeleton. Aborts are only reachable while
/// no funds are locked; locked states resolve through claim or refund.
pub fn can_transition(from: SwapState, to: SwapState) -> bool {
    use SwapState::*;
    matches!(
        (from, to),
        (Created, OfferAccepted)
            | (Created, Aborted)
            | (OfferAccepted, KeysExchanged)
            | (OfferAccepted, Aborted)
            | (KeysExchanged, EthLocked)
            | (KeysExchanged, Aborted)
            | (EthLocked, XmrLocked)
            | (EthLocked, Claimed)
            | (EthLocked, Refunded)
            | (XmrLocked, ReadyToClaim)
            | (XmrLocked, Claimed)
            | (XmrLocked, Refunded)
            | (ReadyToClaim, Claimed)
            | (ReadyToClaim, Refunded)
    )
}

/// Own secret material and counterparty shares, kept in hex for persistence.
/// A restarted daemon needs the spend share to finish a claim or sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub own_spend_secret: Option<String>,
    pub own_view_secret: Option<String>,
    pub own_refund_secret: Option<String>,
    pub own_commitment_nonce: Option<String>,
    pub their_spend_secp: Option<String>,
    pub their_spend_ed: Option<String>,
    pub their_view_secret: Option<String>,
    pub their_refund_secp: Option<String>,
    pub their_commitment: Option<String>,
}

/// One swap as persisted and mutated by its driver task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swap {
    /// 32-byte hex id assigned at offer time; the wire envelope tag.
    pub offer_id: String,
    pub role: SwapRole,
    pub peer: String,
    pub provides: Asset,
    pub provided_amount: u128,
    pub desired_amount: u128,
    pub rate: ExchangeRate,
    pub state: SwapState,
    pub transfer_back: bool,

    /// Contract-enforced timeouts (unix seconds), known once the ETH lock
    /// exists.
    pub timeout_1: Option<u64>,
    pub timeout_2: Option<u64>,

    /// Ethereum block checkpoint for event watching; set when the driver
    /// first starts so a restart rescans from before the lock.
    #[serde(default)]
    pub start_block: u64,

    pub keys: KeyMaterial,

    /// Contract-assigned 32-byte swap id, hex.
    pub contract_swap_id: Option<String>,
    pub eth_lock_tx: Option<String>,
    pub eth_final_tx: Option<String>,
    pub xmr_lock_tx: Option<String>,
    pub xmr_final_tx: Option<String>,
    pub joint_address: Option<String>,
}

impl Swap {
    pub fn new(
        offer_id: String,
        role: SwapRole,
        peer: String,
        provides: Asset,
        provided_amount: u128,
        desired_amount: u128,
        rate: ExchangeRate,
        transfer_back: bool,
    ) -> Self {
        Self {
            offer_id,
            role,
            peer,
            provides,
            provided_amount,
            desired_amount,
            rate,
            state: SwapState::Created,
            transfer_back,
            timeout_1: None,
            timeout_2: None,
            start_block: 0,
            keys: KeyMaterial::default(),
            contract_swap_id: None,
            eth_lock_tx: None,
            eth_final_tx: None,
            xmr_lock_tx: None,
            xmr_final_tx: None,
            joint_address: None,
        }
    }

    /// The XMR side of the trade, in piconero.
    pub fn xmr_amount(&self) -> u128 {
        match self.provides {
            Asset::Xmr => self.provided_amount,
            Asset::Eth => self.desired_amount,
        }
    }

    /// The ETH side of the trade, in wei.
    pub fn eth_amount(&self) -> u128 {
        match self.provides {
            Asset::Eth => self.provided_amount,
            Asset::Xmr => self.desired_amount,
        }
    }

    pub fn transition(&mut self, next: SwapState) -> Result<()> {
        if !can_transition(self.state, next) {
            return Err(SwapError::Invariant(format!(
                "illegal transition {:?} -> {next:?} for swap {}",
                self.state, self.offer_id
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [SwapState::Claimed, SwapState::Refunded, SwapState::Aborted] {
            for next in [
                SwapState::Created,
                SwapState::OfferAccepted,
                SwapState::KeysExchanged,
                SwapState::EthLocked,
                SwapState::XmrLocked,
                SwapState::ReadyToClaim,
                SwapState::Claimed,
                SwapState::Refunded,
                SwapState::Aborted,
            ] {
                assert!(!can_transition(terminal, next));
            }
        }
    }

    #[test]
    fn aborts_are_unreachable_once_funds_lock() {
        assert!(!can_transition(SwapState::EthLocked, SwapState::Aborted));
        assert!(!can_transition(SwapState::XmrLocked, SwapState::Aborted));
        assert!(!can_transition(SwapState::ReadyToClaim, SwapState::Aborted));
    }

    #[test]
    fn rate_tolerance_accepts_small_drift() {
        let rate = ExchangeRate { num: 10, den: 1 };
        // 1 ETH -> 10 XMR with 1% tolerance.
        assert!(rate.within_tolerance(100, 1_000, 100));
        assert!(rate.within_tolerance(100, 995, 100));
        assert!(!rate.within_tolerance(100, 900, 100));
        assert!(!ExchangeRate { num: 1, den: 0 }.within_tolerance(100, 100, 100));
    }

    #[test]
    fn amount_accessors_follow_direction() {
        let swap = Swap::new(
            "aa".into(),
            SwapRole::XmrTaker,
            "peer".into(),
            Asset::Eth,
            1_000,
            2_000,
            ExchangeRate { num: 2, den: 1 },
            false,
        );
        assert_eq!(swap.eth_amount(), 1_000);
        assert_eq!(swap.xmr_amount(), 2_000);
    }
}

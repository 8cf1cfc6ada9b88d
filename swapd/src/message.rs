//! Wire messages exchanged between swap peers. One swap per envelope; the
//! network layer provides framing, so encoding here is just the JSON body.

use serde::{Deserialize, Serialize};

use swap_crypto::dleq::DleqProof;
use swap_crypto::hex::{decode_hex_32, decode_hex_33, hex_encode};

use crate::error::{Result, SwapError};
use crate::state::{Asset, ExchangeRate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneOutcome {
    Claimed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapMessage {
    Offer {
        offer_id: String,
        provides: Asset,
        provided_amount: u128,
        desired_amount: u128,
        rate: ExchangeRate,
        tolerance_bps: u32,
    },
    OfferAccepted {
        offer_id: String,
    },
    KeyExchange {
        spend_public_secp: String,
        spend_public_ed: String,
        dleq_r1: String,
        dleq_r2: String,
        dleq_s: String,
        view_secret: String,
        refund_public_secp: Option<String>,
        commitment: String,
    },
    NotifyEthLocked {
        contract_swap_id: String,
        amount: u128,
        timeout_1: u64,
        timeout_2: u64,
    },
    NotifyXmrLocked {
        tx_hash: String,
    },
    NotifyReady {},
    NotifyDone {
        outcome: DoneOutcome,
    },
}

/// A framed message: the swap id it belongs to plus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub swap_id: String,
    pub message: SwapMessage,
}

impl Envelope {
    pub fn new(swap_id: impl Into<String>, message: SwapMessage) -> Self {
        Self {
            swap_id: swap_id.into(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| SwapError::Invariant(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| SwapError::BadPeer(err.to_string()))
    }
}

/// Decoded and length-checked contents of a `KeyExchange` message.
pub struct KeyExchangeParts {
    pub spend_public_secp: [u8; 33],
    pub spend_public_ed: [u8; 32],
    pub proof: DleqProof,
    pub view_secret: [u8; 32],
    pub refund_public_secp: Option<[u8; 33]>,
    pub commitment: [u8; 32],
}

impl KeyExchangeParts {
    pub fn parse(message: &SwapMessage) -> Result<Self> {
        let SwapMessage::KeyExchange {
            spend_public_secp,
            spend_public_ed,
            dleq_r1,
            dleq_r2,
            dleq_s,
            view_secret,
            refund_public_secp,
            commitment,
        } = message
        else {
            return Err(SwapError::BadPeer("expected key exchange".into()));
        };

        let refund = match refund_public_secp {
            Some(value) => Some(decode_hex_33(value)?),
            None => None,
        };

        Ok(Self {
            spend_public_secp: decode_hex_33(spend_public_secp)?,
            spend_public_ed: decode_hex_32(spend_public_ed)?,
            proof: DleqProof {
                r1: decode_hex_33(dleq_r1)?,
                r2: decode_hex_32(dleq_r2)?,
                s: decode_hex_32(dleq_s)?,
            },
            view_secret: decode_hex_32(view_secret)?,
            refund_public_secp: refund,
            commitment: decode_hex_32(commitment)?,
        })
    }

    pub fn to_message(&self) -> SwapMessage {
        SwapMessage::KeyExchange {
            spend_public_secp: hex_encode(&self.spend_public_secp),
            spend_public_ed: hex_encode(&self.spend_public_ed),
            dleq_r1: hex_encode(&self.proof.r1),
            dleq_r2: hex_encode(&self.proof.r2),
            dleq_s: hex_encode(&self.proof.s),
            view_secret: hex_encode(&self.view_secret),
            refund_public_secp: self.refund_public_secp.map(|key| hex_encode(&key)),
            commitment: hex_encode(&self.commitment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new(
            "ab".repeat(32),
            SwapMessage::NotifyEthLocked {
                contract_swap_id: "cd".repeat(32),
                amount: 1_000_000_000_000_000_000,
                timeout_1: 1_700_000_060,
                timeout_2: 1_700_000_120,
            },
        );
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
    }

    #[test]
    fn key_exchange_rejects_short_fields() {
        let message = SwapMessage::KeyExchange {
            spend_public_secp: "02".into(),
            spend_public_ed: "ff".into(),
            dleq_r1: "00".into(),
            dleq_r2: "00".into(),
            dleq_s: "00".into(),
            view_secret: "00".into(),
            refund_public_secp: None,
            commitment: "00".into(),
        };
        assert!(KeyExchangeParts::parse(&message).is_err());
    }
}

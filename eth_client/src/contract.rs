//! SwapFactory contract bindings and typed access.
//!
//! The contract escrows ETH under two secp256k1 public-key commitments: the
//! claim key (revealing its discrete log pays the counterparty) and the
//! refund key (revealing its discrete log returns the funds to the
//! initiator, before t1 or after t2).

use std::sync::Arc;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use tracing::debug;

use crate::client::{EthClient, RawLog, TxOutcome};
use crate::error::{ChainError, Result};

sol! {
    event New(bytes32 indexed swapId, bytes32 claimKey, bytes32 refundKey, uint256 value, uint256 timeout1, uint256 timeout2);
    event Ready(bytes32 indexed swapId);
    event Claimed(bytes32 indexed swapId, bytes32 secret);
    event Refunded(bytes32 indexed swapId, bytes32 secret);

    function newSwap(bytes32 claimKey, bytes32 refundKey, uint256 timeoutDuration1, uint256 timeoutDuration2, uint256 nonce) payable returns (bytes32);
    function setReady(bytes32 swapId);
    function claim(bytes32 swapId, bytes32 secret);
    function refund(bytes32 swapId, bytes32 secret);
}

/// Commitment stored on-chain for a secp256k1 public key.
pub fn pubkey_commitment(pubkey: &[u8; 33]) -> B256 {
    keccak256(pubkey)
}

/// Decoded SwapFactory log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwapFactoryEvent {
    New {
        swap_id: B256,
        claim_key: B256,
        refund_key: B256,
        value: U256,
        timeout_1: u64,
        timeout_2: u64,
    },
    Ready {
        swap_id: B256,
    },
    Claimed {
        swap_id: B256,
        secret: [u8; 32],
    },
    Refunded {
        swap_id: B256,
        secret: [u8; 32],
    },
}

impl SwapFactoryEvent {
    pub fn swap_id(&self) -> B256 {
        match self {
            Self::New { swap_id, .. }
            | Self::Ready { swap_id }
            | Self::Claimed { swap_id, .. }
            | Self::Refunded { swap_id, .. } => *swap_id,
        }
    }
}

/// Decodes a raw log into a SwapFactory event. Unknown topics are an error;
/// call sites filtering a contract address should only see these four.
pub fn decode_event(topics: &[B256], data: &[u8]) -> Result<SwapFactoryEvent> {
    let topic0 = topics
        .first()
        .ok_or_else(|| ChainError::Permanent("log without topics".into()))?;
    let event = if *topic0 == New::SIGNATURE_HASH {
        let parsed = New::decode_raw_log(topics.iter().copied(), data, true)
            .map_err(|err| ChainError::Permanent(format!("decode New: {err}")))?;
        SwapFactoryEvent::New {
            swap_id: parsed.swapId,
            claim_key: parsed.claimKey,
            refund_key: parsed.refundKey,
            value: parsed.value,
            timeout_1: timestamp_of(parsed.timeout1)?,
            timeout_2: timestamp_of(parsed.timeout2)?,
        }
    } else if *topic0 == Ready::SIGNATURE_HASH {
        let parsed = Ready::decode_raw_log(topics.iter().copied(), data, true)
            .map_err(|err| ChainError::Permanent(format!("decode Ready: {err}")))?;
        SwapFactoryEvent::Ready {
            swap_id: parsed.swapId,
        }
    } else if *topic0 == Claimed::SIGNATURE_HASH {
        let parsed = Claimed::decode_raw_log(topics.iter().copied(), data, true)
            .map_err(|err| ChainError::Permanent(format!("decode Claimed: {err}")))?;
        SwapFactoryEvent::Claimed {
            swap_id: parsed.swapId,
            secret: parsed.secret.into(),
        }
    } else if *topic0 == Refunded::SIGNATURE_HASH {
        let parsed = Refunded::decode_raw_log(topics.iter().copied(), data, true)
            .map_err(|err| ChainError::Permanent(format!("decode Refunded: {err}")))?;
        SwapFactoryEvent::Refunded {
            swap_id: parsed.swapId,
            secret: parsed.secret.into(),
        }
    } else {
        return Err(ChainError::Permanent("unknown SwapFactory event".into()));
    };
    Ok(event)
}

fn timestamp_of(value: U256) -> Result<u64> {
    value
        .try_into()
        .map_err(|_| ChainError::Permanent("timeout exceeds u64".into()))
}

/// Parameters for opening a swap on the contract.
#[derive(Clone, Debug)]
pub struct NewSwapParams {
    pub claim_commitment: B256,
    pub refund_commitment: B256,
    /// Seconds from inclusion until the initiator's refund window closes.
    pub timeout_duration_1: u64,
    /// Additional seconds until the claim window closes.
    pub timeout_duration_2: u64,
    pub nonce: U256,
    pub value: U256,
}

/// A contract-assigned swap with its absolute timeouts.
#[derive(Clone, Debug)]
pub struct CreatedSwap {
    pub swap_id: B256,
    pub timeout_1: u64,
    pub timeout_2: u64,
    pub outcome: TxOutcome,
}

/// Position of an event for checkpointing and same-block ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
    pub block_number: u64,
    pub log_index: u64,
}

pub struct SwapFactoryClient {
    eth: Arc<EthClient>,
    address: Address,
}

impl SwapFactoryClient {
    pub fn new(eth: Arc<EthClient>, address: Address) -> Self {
        Self { eth, address }
    }

    pub fn contract_address(&self) -> Address {
        self.address
    }

    pub fn eth(&self) -> &EthClient {
        &self.eth
    }

    /// Opens a swap, escrowing `value` wei, and returns the id and absolute
    /// timeouts assigned by the contract.
    pub async fn new_swap(&self, params: NewSwapParams) -> Result<CreatedSwap> {
        let data = new_swap_calldata(&params);
        let outcome = self.eth.send(self.address, data, params.value).await?;
        let created = outcome
            .logs
            .iter()
            .find_map(|log| match decode_event(&log.topics, &log.data) {
                Ok(SwapFactoryEvent::New {
                    swap_id,
                    timeout_1,
                    timeout_2,
                    ..
                }) => Some((swap_id, timeout_1, timeout_2)),
                _ => None,
            })
            .ok_or_else(|| ChainError::Permanent("newSwap emitted no New event".into()))?;
        debug!(swap_id = %created.0, "Opened swap on contract");
        Ok(CreatedSwap {
            swap_id: created.0,
            timeout_1: created.1,
            timeout_2: created.2,
            outcome,
        })
    }

    pub async fn set_ready(&self, swap_id: B256) -> Result<TxOutcome> {
        let data = setReadyCall { swapId: swap_id }.abi_encode();
        self.eth.send(self.address, data, U256::ZERO).await
    }

    pub async fn claim(&self, swap_id: B256, secret: [u8; 32]) -> Result<TxOutcome> {
        let data = claimCall {
            swapId: swap_id,
            secret: B256::from(secret),
        }
        .abi_encode();
        self.eth.send(self.address, data, U256::ZERO).await
    }

    pub async fn refund(&self, swap_id: B256, secret: [u8; 32]) -> Result<TxOutcome> {
        let data = refundCall {
            swapId: swap_id,
            secret: B256::from(secret),
        }
        .abi_encode();
        self.eth.send(self.address, data, U256::ZERO).await
    }

    /// Fetches and decodes contract events from `from_block`, returning the
    /// next checkpoint. Logs that fail to decode are skipped.
    pub async fn poll_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<(SwapFactoryEvent, LogPosition)>, u64)> {
        let (logs, next) = self.eth.logs_from(self.address, from_block).await?;
        let events = logs
            .iter()
            .filter_map(|log| {
                let event = decode_event(&log.topics, &log.data).ok()?;
                Some((event, position_of(log)))
            })
            .collect();
        Ok((events, next))
    }

    /// Checks the configured address holds the expected runtime code.
    pub async fn verify_code(&self, expected_hash: B256) -> Result<()> {
        let found = self.eth.code_hash_at(self.address).await?;
        if found != expected_hash {
            return Err(ChainError::Permanent(format!(
                "contract code hash mismatch at {}: found {found}, expected {expected_hash}",
                self.address
            )));
        }
        Ok(())
    }
}

fn position_of(log: &RawLog) -> LogPosition {
    LogPosition {
        block_number: log.block_number.unwrap_or(0),
        log_index: log.log_index.unwrap_or(0),
    }
}

/// ABI-encoded calldata for `newSwap`; exposed for encoding tests.
pub fn new_swap_calldata(params: &NewSwapParams) -> Vec<u8> {
    newSwapCall {
        claimKey: params.claim_commitment,
        refundKey: params.refund_commitment,
        timeoutDuration1: U256::from(params.timeout_duration_1),
        timeoutDuration2: U256::from(params.timeout_duration_2),
        nonce: params.nonce,
    }
    .abi_encode()
}

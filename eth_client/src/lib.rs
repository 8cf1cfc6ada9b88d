//! Ethereum client and SwapFactory contract access for the swap daemon.

pub mod client;
pub mod contract;
pub mod error;

pub use client::{EthClient, RawLog, TxOutcome};
pub use contract::{
    decode_event, new_swap_calldata, pubkey_commitment, CreatedSwap, LogPosition, NewSwapParams,
    SwapFactoryClient, SwapFactoryEvent,
};
pub use error::{classify_send, ChainError, Result};

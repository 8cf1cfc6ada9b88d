//! Monero wallet integration for the swap daemon.
//!
//! Auditor notes:
//! - RPC access is a thin wrapper over `monero-rpc` with retry/timeout.
//! - Wallet operations are serialized by the wallet RPC process; callers
//!   treat the wallet as single-writer.

pub mod rpc;
pub mod types;
pub mod watcher;

pub use rpc::{RpcPolicy, XmrWallet};
pub use types::{Result, WalletError};
pub use watcher::{LockWatcher, VerifyConfig, VerifyOutcome};

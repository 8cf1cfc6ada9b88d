//! Daemon configuration and environment-derived policy.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Stagenet,
    Mainnet,
}

impl Environment {
    /// Re-org depth policy: receipts are final after this many confirmations.
    pub fn eth_confirmations(self) -> u64 {
        match self {
            Self::Dev => 1,
            Self::Stagenet => 2,
            Self::Mainnet => 12,
        }
    }

    pub fn xmr_confirmations(self) -> u64 {
        match self {
            Self::Dev => 1,
            Self::Stagenet | Self::Mainnet => 10,
        }
    }

    /// Expected Ethereum chain id; dev accepts any local chain.
    pub fn eth_chain_id(self) -> Option<u64> {
        match self {
            Self::Dev => None,
            Self::Stagenet => Some(11155111),
            Self::Mainnet => Some(1),
        }
    }

    /// Monero network tag. Dev regtest nodes use mainnet-format addresses.
    pub fn monero_network(self) -> monero::Network {
        match self {
            Self::Dev | Self::Mainnet => monero::Network::Mainnet,
            Self::Stagenet => monero::Network::Stagenet,
        }
    }

    /// Contract timeout window length (both t1-t0 and t2-t1), in seconds.
    pub fn timeout_duration_secs(self) -> u64 {
        match self {
            Self::Dev => 120,
            Self::Stagenet => 900,
            Self::Mainnet => 3_600,
        }
    }
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub data_dir: PathBuf,
    pub rpc_bind: String,
    pub monero_wallet_rpc: String,
    pub wallet_file: String,
    pub wallet_password: Option<String>,
    pub eth_endpoint: String,
    /// File holding the hex Ethereum key; falls back to the database record.
    pub eth_privkey_file: Option<PathBuf>,
    /// Run without a local Ethereum key; a signing frontend authorizes
    /// chain writes. Mutually exclusive with `eth_privkey_file`.
    pub external_signer: bool,
    pub contract_address: Option<String>,
    pub contract_artifact: Option<PathBuf>,
    pub deploy: bool,
    pub transfer_back: bool,
    pub single_swap: bool,
    pub bootnodes: Vec<String>,
    pub driver: DriverConfig,
}

/// Per-swap driver timing knobs, dev-scaled by default.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// How long to wait for the counterparty's key exchange.
    pub key_exchange_timeout_secs: u64,
    /// Taker: deadline for submitting the ETH lock after keys are agreed.
    pub eth_lock_deadline_secs: u64,
    /// Maker: how long to wait to observe the ETH lock before aborting.
    pub eth_lock_observe_secs: u64,
    /// Taker: refund is submitted this long before t1 closes the window.
    pub refund_buffer_secs: u64,
    /// Contract window length passed to `newSwap` (t1-t0 and t2-t1).
    pub timeout_duration_secs: u64,
    /// Chain and wallet polling cadence.
    pub poll_interval_ms: u64,
    /// Bounded grace for drivers to persist on shutdown.
    pub shutdown_grace_secs: u64,
    /// Network send retry ceiling.
    pub send_retries: u32,
    pub send_backoff_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            key_exchange_timeout_secs: 120,
            eth_lock_deadline_secs: 30,
            eth_lock_observe_secs: 60,
            refund_buffer_secs: 10,
            timeout_duration_secs: 120,
            poll_interval_ms: 1_000,
            shutdown_grace_secs: 5,
            send_retries: 4,
            send_backoff_ms: 500,
        }
    }
}

pub fn validate_rpc_url(label: &str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!("{label} must start with http:// or https://"))
    }
}

pub fn validate_nonzero(label: &str, value: u64) -> Result<()> {
    if value == 0 {
        Err(anyhow!("{label} must be greater than zero"))
    } else {
        Ok(())
    }
}

/// Boot nodes may be passed one per flag or comma separated in one flag.
pub fn expand_bootnodes(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_url_requires_http() {
        assert!(validate_rpc_url("rpc", "http://127.0.0.1:8545").is_ok());
        assert!(validate_rpc_url("rpc", "https://rpc.example.org").is_ok());
        assert!(validate_rpc_url("rpc", "ws://localhost").is_err());
        assert!(validate_rpc_url("rpc", "localhost").is_err());
    }

    #[test]
    fn nonzero_validation() {
        assert!(validate_nonzero("timeout", 1).is_ok());
        assert!(validate_nonzero("timeout", 0).is_err());
    }

    #[test]
    fn bootnodes_expand_commas() {
        let raw = vec!["a,b".to_string(), " c ".to_string(), "".to_string()];
        assert_eq!(expand_bootnodes(&raw), vec!["a", "b", "c"]);
    }

    #[test]
    fn environment_policy_is_fixed() {
        assert_eq!(Environment::Dev.eth_confirmations(), 1);
        assert_eq!(Environment::Mainnet.eth_confirmations(), 12);
        assert_eq!(Environment::Mainnet.eth_chain_id(), Some(1));
        assert!(Environment::Dev.eth_chain_id().is_none());
    }
}

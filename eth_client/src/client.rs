//! JSON-RPC client backed by Alloy's provider stack and a local signer.

use alloy_network::EthereumWallet;
use alloy_primitives::{keccak256, Address, Bytes, TxKind, B256, U256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::eth::transaction::{TransactionInput, TransactionRequest};
use alloy_rpc_types::eth::Filter;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use tracing::debug;

use crate::error::{classify_send, permanent, transient, ChainError, Result};

/// A raw contract log with enough position information for checkpointing and
/// same-block ordering.
#[derive(Clone, Debug)]
pub struct RawLog {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
}

/// Result of an included transaction.
#[derive(Clone, Debug)]
pub struct TxOutcome {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub logs: Vec<RawLog>,
}

/// Ethereum access for at most one signing key. Send calls go through
/// Alloy's recommended fillers, which serialize nonce assignment for the
/// key; the daemon holds a single instance so sends are single-signer.
/// Without a local key (external-signer operation) reads still work and
/// chain writes fail permanently until a signing frontend takes over.
pub struct EthClient {
    rpc_url: reqwest::Url,
    signer: Option<PrivateKeySigner>,
    chain_id: u64,
    confirmations: u64,
}

impl EthClient {
    /// Connects, fetches the chain id and checks it against the configured
    /// environment when one is expected.
    pub async fn connect(
        rpc_url: &str,
        private_key_hex: Option<&str>,
        expected_chain_id: Option<u64>,
        confirmations: u64,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(rpc_url).map_err(permanent)?;
        let provider = ProviderBuilder::new().on_http(url.clone());
        let chain_id = provider.get_chain_id().await.map_err(transient)?;
        if let Some(expected) = expected_chain_id {
            if expected != chain_id {
                return Err(ChainError::Permanent(format!(
                    "chain id mismatch: endpoint reports {chain_id}, environment expects {expected}"
                )));
            }
        }

        let signer = match private_key_hex {
            Some(raw) => {
                let mut signer: PrivateKeySigner = raw
                    .parse()
                    .map_err(|_| ChainError::Permanent("invalid ethereum private key".into()))?;
                signer.set_chain_id(Some(chain_id));
                Some(signer)
            }
            None => None,
        };
        debug!(
            chain_id,
            confirmations,
            local_key = signer.is_some(),
            "Connected to Ethereum endpoint"
        );

        Ok(Self {
            rpc_url: url,
            signer,
            chain_id,
            confirmations,
        })
    }

    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|signer| signer.address())
    }

    fn local_signer(&self) -> Result<PrivateKeySigner> {
        self.signer
            .clone()
            .ok_or_else(|| ChainError::Permanent("no local signer for chain writes".into()))
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Submits a signed call and waits for the configured confirmation depth.
    /// A reverted receipt is a permanent error.
    pub async fn send(&self, to: Address, data: Vec<u8>, value: U256) -> Result<TxOutcome> {
        let signer = self.local_signer()?;
        let mut tx = TransactionRequest::default()
            .from(signer.address())
            .input(TransactionInput::from(Bytes::from(data)))
            .value(value);
        tx.to = Some(TxKind::Call(to));
        self.submit(signer, tx).await
    }

    /// Deploys a contract from creation bytecode.
    pub async fn deploy(&self, bytecode: Vec<u8>) -> Result<(Address, TxOutcome)> {
        let signer = self.local_signer()?;
        let mut tx = TransactionRequest::default()
            .from(signer.address())
            .input(TransactionInput::from(Bytes::from(bytecode)));
        tx.to = Some(TxKind::Create);
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::new(signer))
            .on_http(self.rpc_url.clone());
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|err| classify_send(err.to_string()))?;
        let receipt = pending
            .with_required_confirmations(self.confirmations)
            .get_receipt()
            .await
            .map_err(transient)?;
        let address = receipt
            .contract_address
            .ok_or_else(|| ChainError::Permanent("deployment produced no contract".into()))?;
        Ok((address, outcome_of(receipt)))
    }

    async fn submit(&self, signer: PrivateKeySigner, tx: TransactionRequest) -> Result<TxOutcome> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::new(signer))
            .on_http(self.rpc_url.clone());
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|err| classify_send(err.to_string()))?;
        let receipt = pending
            .with_required_confirmations(self.confirmations)
            .get_receipt()
            .await
            .map_err(transient)?;
        if !receipt.status() {
            return Err(ChainError::Permanent(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }
        Ok(outcome_of(receipt))
    }

    /// Read-only `eth_call`.
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Bytes> {
        let mut tx = TransactionRequest::default().input(TransactionInput::from(Bytes::from(data)));
        if let Some(address) = self.address() {
            tx = tx.from(address);
        }
        tx.to = Some(TxKind::Call(to));
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        provider.call(&tx).await.map_err(transient)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        provider.get_block_number().await.map_err(transient)
    }

    /// Fetches contract logs from `from_block` up to the current tip and
    /// returns them with the next checkpoint block.
    pub async fn logs_from(&self, address: Address, from_block: u64) -> Result<(Vec<RawLog>, u64)> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let tip = provider.get_block_number().await.map_err(transient)?;
        if tip < from_block {
            return Ok((Vec::new(), from_block));
        }
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(tip);
        let logs = provider.get_logs(&filter).await.map_err(transient)?;
        let raw = logs
            .into_iter()
            .map(|log| RawLog {
                topics: log.inner.data.topics().to_vec(),
                data: log.inner.data.data.to_vec(),
                block_number: log.block_number,
                log_index: log.log_index,
            })
            .collect();
        Ok((raw, tip + 1))
    }

    /// Hash of the runtime code at `address`; empty code is permanent.
    pub async fn code_hash_at(&self, address: Address) -> Result<B256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let code = provider.get_code_at(address).await.map_err(transient)?;
        if code.is_empty() {
            return Err(ChainError::Permanent(format!(
                "no contract code at {address}"
            )));
        }
        Ok(keccak256(&code))
    }
}

fn outcome_of(receipt: alloy_rpc_types::eth::TransactionReceipt) -> TxOutcome {
    let logs = receipt
        .inner
        .logs()
        .iter()
        .map(|log| RawLog {
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.to_vec(),
            block_number: log.block_number,
            log_index: log.log_index,
        })
        .collect();
    TxOutcome {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        logs,
    }
}

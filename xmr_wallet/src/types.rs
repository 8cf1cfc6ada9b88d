use jsonrpc_core::types::error::Error as RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("wallet RPC gave up on {op} after {attempts} attempts")]
    GaveUp { op: &'static str, attempts: u32 },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, WalletError>;

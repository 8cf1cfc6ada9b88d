use thiserror::Error;

/// Swap failure taxonomy. Only transient chain errors and wallet read errors
/// are retried; everything else either aborts the swap safely (no funds
/// locked yet) or routes the driver into its refund path.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("bad peer message: {0}")]
    BadPeer(String),
    #[error(transparent)]
    Chain(#[from] eth_client::ChainError),
    #[error(transparent)]
    Wallet(#[from] xmr_wallet::WalletError),
    #[error(transparent)]
    Crypto(#[from] swap_crypto::CryptoError),
    #[error("peer unreachable")]
    PeerGone,
    #[error("a swap is already active for this peer")]
    AlreadyActive,
    #[error("no ongoing swap")]
    NoOngoingSwap,
    #[error("cancelled")]
    Cancelled,
    #[error("database error: {0}")]
    Database(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, SwapError>;

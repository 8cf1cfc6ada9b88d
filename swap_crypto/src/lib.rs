//! Cryptographic primitives for ETH/XMR swap key material.
//!
//! Auditor notes:
//! - Curve arithmetic uses curve25519-dalek and k256 only.
//! - No custom scalar/point arithmetic.
//! - Secret shares are wiped on drop.

pub mod address;
pub mod dleq;
pub mod hex;
pub mod keys;

use thiserror::Error;

pub use address::{aggregate_ed25519, derive_swap_address, validate_address};
pub use dleq::{DleqProof, CHALLENGE_BYTES, NONCE_BYTES};
pub use keys::{
    combine_spend_shares, recover_secret, KeyPair, PublicShares, SecretShare, SECRET_BYTES,
};

/// Errors produced by key, proof and address operations. None of these are
/// retryable: a bad encoding or rejected proof means the counterparty input
/// must be discarded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("bad encoding for {0}")]
    BadEncoding(&'static str),
    #[error("small-order point: {0}")]
    SmallOrderPoint(&'static str),
    #[error("proof rejected")]
    ProofRejected,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

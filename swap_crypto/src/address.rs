//! Joint key aggregation and Monero address derivation.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use monero::{Address, Network, PublicKey};
use std::str::FromStr;

use crate::{CryptoError, Result};

/// Adds two compressed ed25519 public shares into the joint public key.
pub fn aggregate_ed25519(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32]> {
    let pa = decode_point(a, "first share")?;
    let pb = decode_point(b, "second share")?;
    Ok((pa + pb).compress().to_bytes())
}

/// Derives the standard Monero address for the joint spend and view keys.
/// The base58check rendering carries the network tag and checksum.
pub fn derive_swap_address(
    spend_joint: &[u8; 32],
    view_joint: &[u8; 32],
    network: Network,
) -> Result<String> {
    decode_point(spend_joint, "joint spend key")?;
    decode_point(view_joint, "joint view key")?;
    let spend =
        PublicKey::from_slice(spend_joint).map_err(|_| CryptoError::BadEncoding("spend key"))?;
    let view =
        PublicKey::from_slice(view_joint).map_err(|_| CryptoError::BadEncoding("view key"))?;
    Ok(Address::standard(network, spend, view).to_string())
}

/// Parses an address string, checking checksum and network tag.
pub fn validate_address(address: &str, network: Network) -> Result<()> {
    let parsed = Address::from_str(address).map_err(|_| CryptoError::BadEncoding("address"))?;
    if parsed.network != network {
        return Err(CryptoError::BadEncoding("address network"));
    }
    Ok(())
}

fn decode_point(bytes: &[u8; 32], field: &'static str) -> Result<EdwardsPoint> {
    let point = CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(CryptoError::BadEncoding(field))?;
    if point.is_small_order() {
        return Err(CryptoError::SmallOrderPoint(field));
    }
    Ok(point)
}

//! Dual-curve secret shares and keypairs.
//!
//! A swap secret is a single integer used as a discrete log on both ed25519
//! (Monero spend/view keys) and secp256k1 (Ethereum contract claim/refund
//! keys). Shares carry 128 bits of entropy, the work factor of both curves;
//! keeping them below 2^128 also keeps DLEQ responses reduction-free on both
//! group orders.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::scalar::Scalar;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{ProjectivePoint, Scalar as SecpScalar};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::dleq::{self, DleqProof};
use crate::{CryptoError, Result};

/// Random bytes per secret share.
pub const SECRET_BYTES: usize = 16;

/// A secret scalar contribution, stored as 32 little-endian bytes.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretShare([u8; 32]);

impl std::fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretShare").field(&"<redacted>").finish()
    }
}

impl SecretShare {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes[..SECRET_BYTES]);
        Self(bytes)
    }

    /// Accepts a canonical ed25519 scalar encoding.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        if Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes)).is_none() {
            return Err(CryptoError::BadEncoding("secret scalar"));
        }
        Ok(Self(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn ed25519_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn secp256k1_scalar(&self) -> Result<SecpScalar> {
        secp_scalar_from_le(&self.0).ok_or(CryptoError::BadEncoding("secret scalar"))
    }

    /// Compressed ed25519 public key for this share.
    pub fn ed25519_public(&self) -> [u8; 32] {
        (ED25519_BASEPOINT_POINT * self.ed25519_scalar())
            .compress()
            .to_bytes()
    }

    /// Compressed SEC1 secp256k1 public key for this share.
    pub fn secp256k1_public(&self) -> Result<[u8; 33]> {
        let scalar = self.secp256k1_scalar()?;
        let point = (ProjectivePoint::GENERATOR * scalar).to_affine();
        let encoded = point.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(encoded.as_bytes());
        Ok(out)
    }
}

/// Interprets 32 little-endian bytes as a secp256k1 scalar. Any canonical
/// ed25519 scalar is below the secp256k1 group order, so the conversion only
/// fails on non-canonical input.
pub(crate) fn secp_scalar_from_le(bytes: &[u8; 32]) -> Option<SecpScalar> {
    let mut be = *bytes;
    be.reverse();
    Option::from(SecpScalar::from_repr(be.into()))
}

/// Public half of a keypair, as exchanged with the counterparty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicShares {
    pub secp256k1: [u8; 33],
    pub ed25519: [u8; 32],
}

/// A spend-key contribution: the secret scalar, both public keys and the
/// proof that they share one discrete log.
pub struct KeyPair {
    secret: SecretShare,
    public: PublicShares,
    proof: DleqProof,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        Self::from_secret(SecretShare::random())
    }

    /// Rebuilds the keypair (with a fresh proof) from a stored secret.
    pub fn from_secret(secret: SecretShare) -> Result<Self> {
        let public = PublicShares {
            secp256k1: secret.secp256k1_public()?,
            ed25519: secret.ed25519_public(),
        };
        let proof = dleq::prove(&secret)?;
        Ok(Self {
            secret,
            public,
            proof,
        })
    }

    pub fn secret(&self) -> &SecretShare {
        &self.secret
    }

    pub fn public(&self) -> &PublicShares {
        &self.public
    }

    pub fn proof(&self) -> &DleqProof {
        &self.proof
    }
}

/// Rebuilds a secret share from a scalar revealed on the Ethereum side.
pub fn recover_secret(bytes: [u8; 32]) -> Result<SecretShare> {
    SecretShare::from_bytes(bytes)
}

/// Sums two spend-share scalars into the joint Monero spend key.
pub fn combine_spend_shares(own: &SecretShare, other: &SecretShare) -> [u8; 32] {
    (own.ed25519_scalar() + other.ed25519_scalar()).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_upper_bytes_are_zero() {
        let share = SecretShare::random();
        assert!(share.to_bytes()[SECRET_BYTES..].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_non_canonical_scalar() {
        let result = SecretShare::from_bytes([0xff; 32]);
        assert_eq!(result.unwrap_err(), CryptoError::BadEncoding("secret scalar"));
    }

    #[test]
    fn combine_matches_scalar_addition() {
        let a = SecretShare::random();
        let b = SecretShare::random();
        let joint = combine_spend_shares(&a, &b);
        assert_eq!(
            Scalar::from_bytes_mod_order(joint),
            a.ed25519_scalar() + b.ed25519_scalar()
        );
    }
}

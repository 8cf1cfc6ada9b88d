//! Cross-curve discrete-log-equality proofs.
//!
//! Proves that a secp256k1 point P and an ed25519 point Q share one discrete
//! log without revealing it. A single Schnorr response covers both curves:
//! the witness is below 2^128, the challenge below 2^120 and the nonce below
//! 2^248, so `s = r + c·x` stays under both group orders and the verification
//! equations hold over the integers on each curve.

use blake2::{Blake2s256, Digest};
use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey as SecpPublicKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::keys::{secp_scalar_from_le, SecretShare};
use crate::{CryptoError, Result};

const DLEQ_DOMAIN_TAG: &[u8] = b"DLEQ-secp256k1-ed25519";

/// Challenge width in bytes (120 bits).
pub const CHALLENGE_BYTES: usize = 15;

/// Prover nonce width in bytes (248 bits).
pub const NONCE_BYTES: usize = 31;

/// Transferable proof transcript: commitments on both curves plus the shared
/// response scalar (little-endian).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DleqProof {
    pub r1: [u8; 33],
    pub r2: [u8; 32],
    pub s: [u8; 32],
}

/// Produces a proof that the share's secp256k1 and ed25519 public keys are
/// derived from the same scalar.
pub fn prove(secret: &SecretShare) -> Result<DleqProof> {
    let x_ed = secret.ed25519_scalar();
    let p = secret.secp256k1_public()?;
    let q = secret.ed25519_public();

    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce[..NONCE_BYTES]);
    let r_ed = Scalar::from_bytes_mod_order(nonce);
    let r_secp = secp_scalar_from_le(&nonce).ok_or(CryptoError::BadEncoding("nonce"))?;

    let r1 = encode_secp_point(&(ProjectivePoint::GENERATOR * r_secp));
    let r2 = (ED25519_BASEPOINT_POINT * r_ed).compress().to_bytes();

    let challenge = challenge_bytes(&p, &q, &r1, &r2);
    let c_ed = Scalar::from_bytes_mod_order(challenge);

    // No reduction occurs: r < 2^248 and c·x < 2^248, so s < 2^249 < l.
    let s = r_ed + c_ed * x_ed;

    Ok(DleqProof {
        r1,
        r2,
        s: s.to_bytes(),
    })
}

/// Checks a proof against the counterparty's public shares.
pub fn verify(p: &[u8; 33], q: &[u8; 32], proof: &DleqProof) -> Result<()> {
    let p_point = decode_secp_point(p, "secp256k1 public share")?;
    let q_point = decode_ed_point(q, "ed25519 public share")?;
    let r1_point = decode_secp_point(&proof.r1, "secp256k1 commitment")?;
    let r2_point = decode_ed_point(&proof.r2, "ed25519 commitment")?;

    let s_ed = Option::<Scalar>::from(Scalar::from_canonical_bytes(proof.s))
        .ok_or(CryptoError::BadEncoding("proof response"))?;
    let s_secp =
        secp_scalar_from_le(&proof.s).ok_or(CryptoError::BadEncoding("proof response"))?;

    let challenge = challenge_bytes(p, q, &proof.r1, &proof.r2);
    let c_ed = Scalar::from_bytes_mod_order(challenge);
    let c_secp =
        secp_scalar_from_le(&challenge).ok_or(CryptoError::BadEncoding("challenge"))?;

    let secp_ok = ProjectivePoint::GENERATOR * s_secp == r1_point + p_point * c_secp;
    let ed_ok = ED25519_BASEPOINT_POINT * s_ed == r2_point + q_point * c_ed;

    if secp_ok && ed_ok {
        Ok(())
    } else {
        Err(CryptoError::ProofRejected)
    }
}

fn challenge_bytes(p: &[u8; 33], q: &[u8; 32], r1: &[u8; 33], r2: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(DLEQ_DOMAIN_TAG);
    hasher.update(encode_secp_point(&ProjectivePoint::GENERATOR));
    hasher.update(ED25519_BASEPOINT_POINT.compress().to_bytes());
    hasher.update(p);
    hasher.update(q);
    hasher.update(r1);
    hasher.update(r2);
    let hash: [u8; 32] = hasher.finalize().into();

    let mut out = [0u8; 32];
    out[..CHALLENGE_BYTES].copy_from_slice(&hash[..CHALLENGE_BYTES]);
    out
}

fn encode_secp_point(point: &ProjectivePoint) -> [u8; 33] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

fn decode_secp_point(bytes: &[u8; 33], field: &'static str) -> Result<ProjectivePoint> {
    let key =
        SecpPublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::BadEncoding(field))?;
    Ok(key.to_projective())
}

fn decode_ed_point(bytes: &[u8; 32], field: &'static str) -> Result<EdwardsPoint> {
    let point = CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(CryptoError::BadEncoding(field))?;
    if point.is_small_order() {
        return Err(CryptoError::SmallOrderPoint(field));
    }
    Ok(point)
}

//! Key-share generation, exchange and joint-key derivation used by both
//! roles. Own material is recorded in the swap record so a restarted driver
//! can finish a claim or sweep.

use alloy_primitives::Address;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use swap_crypto::hex::{decode_hex_32, decode_hex_33, hex_encode};
use swap_crypto::{aggregate_ed25519, combine_spend_shares, derive_swap_address, dleq, KeyPair, SecretShare};

use crate::error::{Result, SwapError};
use crate::message::{KeyExchangeParts, SwapMessage};
use crate::state::KeyMaterial;

/// This side's contributions: a dual-curve spend share, a plain ed25519 view
/// share and, for the maker, a secp256k1 refund key committed to the taker.
pub struct OwnKeys {
    pub spend: KeyPair,
    pub view: SecretShare,
    pub refund: Option<KeyPair>,
    pub commitment_nonce: [u8; 32],
}

impl OwnKeys {
    pub fn generate(with_refund: bool) -> Result<Self> {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let refund = if with_refund {
            Some(KeyPair::generate()?)
        } else {
            None
        };
        Ok(Self {
            spend: KeyPair::generate()?,
            view: SecretShare::random(),
            refund,
            commitment_nonce: nonce,
        })
    }

    pub fn record_into(&self, material: &mut KeyMaterial) {
        material.own_spend_secret = Some(hex_encode(&self.spend.secret().to_bytes()));
        material.own_view_secret = Some(hex_encode(&self.view.to_bytes()));
        material.own_refund_secret = self
            .refund
            .as_ref()
            .map(|pair| hex_encode(&pair.secret().to_bytes()));
        material.own_commitment_nonce = Some(hex_encode(&self.commitment_nonce));
    }

    pub fn from_material(material: &KeyMaterial) -> Result<Self> {
        let spend_hex = material
            .own_spend_secret
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing own spend secret".into()))?;
        let view_hex = material
            .own_view_secret
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing own view secret".into()))?;
        let nonce_hex = material
            .own_commitment_nonce
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing commitment nonce".into()))?;
        let refund = match material.own_refund_secret.as_deref() {
            Some(value) => Some(KeyPair::from_secret(SecretShare::from_bytes(
                decode_hex_32(value)?,
            )?)?),
            None => None,
        };
        Ok(Self {
            spend: KeyPair::from_secret(SecretShare::from_bytes(decode_hex_32(spend_hex)?)?)?,
            view: SecretShare::from_bytes(decode_hex_32(view_hex)?)?,
            refund,
            commitment_nonce: decode_hex_32(nonce_hex)?,
        })
    }

    /// The message sent during the single key-exchange round. The commitment
    /// binds this side's ETH payout address without revealing the nonce.
    pub fn exchange_message(&self, eth_address: Address) -> SwapMessage {
        let parts = KeyExchangeParts {
            spend_public_secp: self.spend.public().secp256k1,
            spend_public_ed: self.spend.public().ed25519,
            proof: self.spend.proof().clone(),
            view_secret: self.view.to_bytes(),
            refund_public_secp: self
                .refund
                .as_ref()
                .map(|pair| pair.public().secp256k1),
            commitment: address_commitment(eth_address, &self.commitment_nonce),
        };
        parts.to_message()
    }
}

/// Counterparty shares accepted after DLEQ verification.
pub struct TheirKeys {
    pub spend_secp: [u8; 33],
    pub spend_ed: [u8; 32],
    pub view: SecretShare,
    pub refund_secp: Option<[u8; 33]>,
    pub commitment: [u8; 32],
}

impl TheirKeys {
    /// Verifies the proof binding the counterparty's secp256k1 and ed25519
    /// spend keys. Invalid material is a peer fault, never retryable.
    pub fn verify(parts: &KeyExchangeParts) -> Result<Self> {
        dleq::verify(&parts.spend_public_secp, &parts.spend_public_ed, &parts.proof)
            .map_err(|err| SwapError::BadPeer(format!("key exchange rejected: {err}")))?;
        let view = SecretShare::from_bytes(parts.view_secret)
            .map_err(|err| SwapError::BadPeer(format!("view share rejected: {err}")))?;
        Ok(Self {
            spend_secp: parts.spend_public_secp,
            spend_ed: parts.spend_public_ed,
            view,
            refund_secp: parts.refund_public_secp,
            commitment: parts.commitment,
        })
    }

    pub fn record_into(&self, material: &mut KeyMaterial) {
        material.their_spend_secp = Some(hex_encode(&self.spend_secp));
        material.their_spend_ed = Some(hex_encode(&self.spend_ed));
        material.their_view_secret = Some(hex_encode(&self.view.to_bytes()));
        material.their_refund_secp = self.refund_secp.map(|key| hex_encode(&key));
        material.their_commitment = Some(hex_encode(&self.commitment));
    }

    pub fn from_material(material: &KeyMaterial) -> Result<Self> {
        let spend_secp = material
            .their_spend_secp
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing counterparty spend key".into()))?;
        let spend_ed = material
            .their_spend_ed
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing counterparty spend key".into()))?;
        let view = material
            .their_view_secret
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing counterparty view share".into()))?;
        let refund_secp = match material.their_refund_secp.as_deref() {
            Some(value) => Some(decode_hex_33(value)?),
            None => None,
        };
        let commitment = material
            .their_commitment
            .as_deref()
            .ok_or_else(|| SwapError::Invariant("missing counterparty commitment".into()))?;
        Ok(Self {
            spend_secp: decode_hex_33(spend_secp)?,
            spend_ed: decode_hex_32(spend_ed)?,
            view: SecretShare::from_bytes(decode_hex_32(view)?)?,
            refund_secp,
            commitment: decode_hex_32(commitment)?,
        })
    }
}

/// Joint Monero address from both spend and view contributions.
pub fn joint_address(
    own: &OwnKeys,
    their: &TheirKeys,
    network: monero::Network,
) -> Result<String> {
    let spend_joint = aggregate_ed25519(&own.spend.public().ed25519, &their.spend_ed)?;
    let view_joint = aggregate_ed25519(&own.view.ed25519_public(), &their.view.ed25519_public())?;
    Ok(derive_swap_address(&spend_joint, &view_joint, network)?)
}

/// Full private view key of the joint wallet; both sides can derive it.
pub fn joint_view_secret(own: &OwnKeys, their: &TheirKeys) -> [u8; 32] {
    combine_spend_shares(&own.view, &their.view)
}

/// Full private spend key once the counterparty share is revealed on-chain.
pub fn joint_spend_secret(own: &OwnKeys, revealed: &SecretShare) -> [u8; 32] {
    combine_spend_shares(own.spend.secret(), revealed)
}

fn address_commitment(address: Address, nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(address.as_slice());
    hasher.update(nonce);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::KeyExchangeParts;

    #[test]
    fn exchange_round_trips_and_verifies() {
        let own = OwnKeys::generate(true).unwrap();
        let message = own.exchange_message(Address::ZERO);
        let parts = KeyExchangeParts::parse(&message).unwrap();
        let their = TheirKeys::verify(&parts).unwrap();
        assert_eq!(their.spend_secp, own.spend.public().secp256k1);
        assert!(their.refund_secp.is_some());
    }

    #[test]
    fn tampered_exchange_is_rejected() {
        let own = OwnKeys::generate(false).unwrap();
        let message = own.exchange_message(Address::ZERO);
        let mut parts = KeyExchangeParts::parse(&message).unwrap();
        parts.proof.s[0] ^= 0x01;
        assert!(matches!(
            TheirKeys::verify(&parts),
            Err(SwapError::BadPeer(_))
        ));
    }

    #[test]
    fn material_round_trips_through_record() {
        let own = OwnKeys::generate(true).unwrap();
        let mut material = KeyMaterial::default();
        own.record_into(&mut material);
        let restored = OwnKeys::from_material(&material).unwrap();
        assert_eq!(
            restored.spend.public().ed25519,
            own.spend.public().ed25519
        );
        assert_eq!(restored.commitment_nonce, own.commitment_nonce);

        let their = TheirKeys::verify(&KeyExchangeParts::parse(
            &OwnKeys::generate(false).unwrap().exchange_message(Address::ZERO),
        )
        .unwrap())
        .unwrap();
        their.record_into(&mut material);
        let restored_their = TheirKeys::from_material(&material).unwrap();
        assert_eq!(restored_their.spend_ed, their.spend_ed);
    }

    #[test]
    fn both_sides_derive_the_same_joint_address() {
        let maker = OwnKeys::generate(true).unwrap();
        let taker = OwnKeys::generate(false).unwrap();

        let maker_view_of_taker = TheirKeys::verify(
            &KeyExchangeParts::parse(&taker.exchange_message(Address::ZERO)).unwrap(),
        )
        .unwrap();
        let taker_view_of_maker = TheirKeys::verify(
            &KeyExchangeParts::parse(&maker.exchange_message(Address::ZERO)).unwrap(),
        )
        .unwrap();

        let from_maker =
            joint_address(&maker, &maker_view_of_taker, monero::Network::Mainnet).unwrap();
        let from_taker =
            joint_address(&taker, &taker_view_of_maker, monero::Network::Mainnet).unwrap();
        assert_eq!(from_maker, from_taker);

        assert_eq!(
            joint_view_secret(&maker, &maker_view_of_taker),
            joint_view_secret(&taker, &taker_view_of_maker)
        );
    }
}

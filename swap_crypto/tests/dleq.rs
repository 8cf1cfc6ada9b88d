use monero::Network;
use swap_crypto::{
    aggregate_ed25519, combine_spend_shares, derive_swap_address, dleq, keys::SecretShare,
    recover_secret, validate_address, CryptoError, KeyPair,
};

#[test]
fn proof_round_trips() {
    let pair = KeyPair::generate().expect("keypair");
    dleq::verify(&pair.public().secp256k1, &pair.public().ed25519, pair.proof())
        .expect("honest proof verifies");
}

#[test]
fn tampered_response_is_rejected() {
    let pair = KeyPair::generate().expect("keypair");
    let mut proof = pair.proof().clone();
    proof.s[0] ^= 0x01;
    let err = dleq::verify(&pair.public().secp256k1, &pair.public().ed25519, &proof)
        .expect_err("tampered response");
    assert_eq!(err, CryptoError::ProofRejected);
}

#[test]
fn tampered_commitment_is_rejected() {
    let pair = KeyPair::generate().expect("keypair");
    let mut proof = pair.proof().clone();
    proof.r2[0] ^= 0x01;
    assert!(dleq::verify(&pair.public().secp256k1, &pair.public().ed25519, &proof).is_err());
}

#[test]
fn proof_is_bound_to_its_keys() {
    let pair = KeyPair::generate().expect("keypair");
    let other = KeyPair::generate().expect("other keypair");
    let err = dleq::verify(&other.public().secp256k1, &other.public().ed25519, pair.proof())
        .expect_err("wrong keys");
    assert_eq!(err, CryptoError::ProofRejected);
}

#[test]
fn rejects_small_order_public_share() {
    let pair = KeyPair::generate().expect("keypair");
    // Compressed identity: y = 1.
    let mut identity = [0u8; 32];
    identity[0] = 0x01;
    let err = dleq::verify(&pair.public().secp256k1, &identity, pair.proof())
        .expect_err("identity share");
    assert!(matches!(err, CryptoError::SmallOrderPoint(_)));
}

#[test]
fn joint_address_is_symmetric() {
    let ours = KeyPair::generate().expect("ours");
    let theirs = KeyPair::generate().expect("theirs");
    let view_ours = SecretShare::random();
    let view_theirs = SecretShare::random();

    let spend_ab = aggregate_ed25519(&ours.public().ed25519, &theirs.public().ed25519).unwrap();
    let spend_ba = aggregate_ed25519(&theirs.public().ed25519, &ours.public().ed25519).unwrap();
    assert_eq!(spend_ab, spend_ba);

    let view_joint =
        aggregate_ed25519(&view_ours.ed25519_public(), &view_theirs.ed25519_public()).unwrap();
    let address = derive_swap_address(&spend_ab, &view_joint, Network::Mainnet).unwrap();
    assert!(address.starts_with('4'));
    validate_address(&address, Network::Mainnet).expect("checksum");
    assert!(validate_address(&address, Network::Stagenet).is_err());
}

#[test]
fn combined_shares_open_the_joint_key() {
    use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
    use curve25519_dalek::scalar::Scalar;

    let ours = KeyPair::generate().expect("ours");
    let theirs = KeyPair::generate().expect("theirs");

    let joint_secret = combine_spend_shares(ours.secret(), theirs.secret());
    let joint_public =
        aggregate_ed25519(&ours.public().ed25519, &theirs.public().ed25519).unwrap();
    let derived = ED25519_BASEPOINT_POINT * Scalar::from_bytes_mod_order(joint_secret);
    assert_eq!(derived.compress().to_bytes(), joint_public);
}

#[test]
fn revealed_secret_recovers_the_share() {
    let pair = KeyPair::generate().expect("keypair");
    let recovered = recover_secret(pair.secret().to_bytes()).expect("canonical");
    assert_eq!(recovered.ed25519_public(), pair.public().ed25519);
    assert_eq!(
        recovered.secp256k1_public().unwrap(),
        pair.public().secp256k1
    );
}

#[test]
fn rejects_non_canonical_revealed_secret() {
    assert!(recover_secret([0xff; 32]).is_err());
}

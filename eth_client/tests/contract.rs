use alloy_primitives::{B256, U256};
use alloy_sol_types::{SolCall, SolEvent};

use eth_client::contract::{newSwapCall, Claimed, New, Ready, Refunded};
use eth_client::{decode_event, new_swap_calldata, pubkey_commitment, NewSwapParams, SwapFactoryEvent};

fn sample_params() -> NewSwapParams {
    NewSwapParams {
        claim_commitment: B256::from([0x11; 32]),
        refund_commitment: B256::from([0x22; 32]),
        timeout_duration_1: 60,
        timeout_duration_2: 60,
        nonce: U256::from(7u64),
        value: U256::from(1_000_000_000_000_000_000u128),
    }
}

#[test]
fn new_swap_calldata_round_trips() {
    let params = sample_params();
    let data = new_swap_calldata(&params);
    let decoded = newSwapCall::abi_decode(&data, true).expect("decode calldata");
    assert_eq!(decoded.claimKey, params.claim_commitment);
    assert_eq!(decoded.refundKey, params.refund_commitment);
    assert_eq!(decoded.timeoutDuration1, U256::from(60u64));
    assert_eq!(decoded.timeoutDuration2, U256::from(60u64));
    assert_eq!(decoded.nonce, U256::from(7u64));
}

#[test]
fn decodes_new_event() {
    let swap_id = B256::from([0xAA; 32]);
    let event = New {
        swapId: swap_id,
        claimKey: B256::from([0x11; 32]),
        refundKey: B256::from([0x22; 32]),
        value: U256::from(5u64),
        timeout1: U256::from(1_700_000_060u64),
        timeout2: U256::from(1_700_000_120u64),
    };
    let topics = vec![New::SIGNATURE_HASH, swap_id];
    let data = event.encode_data();

    let decoded = decode_event(&topics, &data).expect("decode");
    assert_eq!(
        decoded,
        SwapFactoryEvent::New {
            swap_id,
            claim_key: B256::from([0x11; 32]),
            refund_key: B256::from([0x22; 32]),
            value: U256::from(5u64),
            timeout_1: 1_700_000_060,
            timeout_2: 1_700_000_120,
        }
    );
}

#[test]
fn decodes_terminal_events_with_secret() {
    let swap_id = B256::from([0xBB; 32]);
    let secret = [0x5Au8; 32];

    let claimed = Claimed {
        swapId: swap_id,
        secret: B256::from(secret),
    };
    let decoded = decode_event(&[Claimed::SIGNATURE_HASH, swap_id], &claimed.encode_data())
        .expect("decode claimed");
    assert_eq!(decoded, SwapFactoryEvent::Claimed { swap_id, secret });

    let refunded = Refunded {
        swapId: swap_id,
        secret: B256::from(secret),
    };
    let decoded = decode_event(&[Refunded::SIGNATURE_HASH, swap_id], &refunded.encode_data())
        .expect("decode refunded");
    assert_eq!(decoded, SwapFactoryEvent::Refunded { swap_id, secret });
}

#[test]
fn decodes_ready_event() {
    let swap_id = B256::from([0xCC; 32]);
    let ready = Ready { swapId: swap_id };
    let decoded =
        decode_event(&[Ready::SIGNATURE_HASH, swap_id], &ready.encode_data()).expect("decode");
    assert_eq!(decoded, SwapFactoryEvent::Ready { swap_id });
}

#[test]
fn rejects_unknown_topic() {
    let topics = vec![B256::from([0x01; 32])];
    assert!(decode_event(&topics, &[]).is_err());
}

#[test]
fn pubkey_commitment_is_deterministic() {
    let mut pubkey = [0u8; 33];
    pubkey[0] = 0x02;
    pubkey[32] = 0x99;
    let first = pubkey_commitment(&pubkey);
    let second = pubkey_commitment(&pubkey);
    assert_eq!(first, second);

    pubkey[32] = 0x98;
    assert_ne!(first, pubkey_commitment(&pubkey));
}

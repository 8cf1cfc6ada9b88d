use xmr_wallet::watcher::Sighting;
use xmr_wallet::{LockWatcher, VerifyConfig, VerifyOutcome};

// Well-known mainnet address (Monero donation fund), used as a parse target.
const WATCH_ADDRESS: &str = "44AFFq5kSiGBoZ4NMDwYtN18obc8AemS33DBLWs3H7otXft3XjrpDtQGv7SqSsaBYBb98uNbr2VBBEt7f2wfn3RVGQBEP3A";

fn watcher(expected: u64) -> LockWatcher {
    let config = VerifyConfig {
        confirmations_required: 10,
        reorg_buffer: 5,
    };
    LockWatcher::new(config, WATCH_ADDRESS, expected).expect("watcher")
}

#[test]
fn reports_not_seen_without_sightings() {
    let mut watcher = watcher(1_000);
    let outcome = watcher.record(&[], 100);
    assert_eq!(outcome, VerifyOutcome::NotSeen);
}

#[test]
fn classifies_underpayment() {
    let mut watcher = watcher(1_000);
    let outcome = watcher.record(
        &[
            Sighting::Chained {
                amount: 400,
                height: 50,
            },
            Sighting::Chained {
                amount: 700,
                height: 51,
            },
        ],
        60,
    );
    assert_eq!(outcome, VerifyOutcome::Underpaid { received: 700 });
}

#[test]
fn reports_pool_sightings_before_inclusion() {
    let mut watcher = watcher(1_000);
    let outcome = watcher.record(&[Sighting::Pool { amount: 1_000 }], 60);
    assert_eq!(outcome, VerifyOutcome::InPool { amount: 1_000 });
}

#[test]
fn a_chained_lock_outranks_a_pool_duplicate() {
    let mut watcher = watcher(1_000);
    let outcome = watcher.record(
        &[
            Sighting::Pool { amount: 1_000 },
            Sighting::Chained {
                amount: 1_000,
                height: 50,
            },
        ],
        55,
    );
    assert_eq!(
        outcome,
        VerifyOutcome::AwaitingConfirmations {
            observed_height: 50,
            current_height: 55,
            remaining: 5,
        }
    );
}

#[test]
fn waits_for_confirmations_then_confirms() {
    let mut watcher = watcher(1_000);
    let awaiting = watcher.record(
        &[Sighting::Chained {
            amount: 1_000,
            height: 50,
        }],
        55,
    );
    assert_eq!(
        awaiting,
        VerifyOutcome::AwaitingConfirmations {
            observed_height: 50,
            current_height: 55,
            remaining: 5,
        }
    );

    // Later rounds with no new sightings still converge on the tip.
    let confirmed = watcher.record(&[], 60);
    assert_eq!(
        confirmed,
        VerifyOutcome::Confirmed {
            observed_height: 50,
            confirmations: 10,
        }
    );
}

#[test]
fn keeps_the_earliest_qualifying_height() {
    let mut watcher = watcher(1_000);
    watcher.record(
        &[Sighting::Chained {
            amount: 1_000,
            height: 52,
        }],
        55,
    );
    let outcome = watcher.record(
        &[Sighting::Chained {
            amount: 1_500,
            height: 48,
        }],
        58,
    );
    assert_eq!(
        outcome,
        VerifyOutcome::Confirmed {
            observed_height: 48,
            confirmations: 10,
        }
    );
}

#[test]
fn a_rollback_past_the_buffer_clears_the_lock() {
    let mut watcher = watcher(1_000);
    let awaiting = watcher.record(
        &[Sighting::Chained {
            amount: 1_000,
            height: 95,
        }],
        100,
    );
    assert!(matches!(
        awaiting,
        VerifyOutcome::AwaitingConfirmations { .. }
    ));

    let reorg = watcher.record(&[], 90);
    assert_eq!(
        reorg,
        VerifyOutcome::ReorgDetected {
            previous_height: 100,
            current_height: 90,
        }
    );

    let after = watcher.record(&[], 90);
    assert_eq!(after, VerifyOutcome::NotSeen);
}

#[test]
fn rejects_malformed_watch_address() {
    let config = VerifyConfig::default();
    assert!(LockWatcher::new(config, "not-an-address", 1).is_err());
}

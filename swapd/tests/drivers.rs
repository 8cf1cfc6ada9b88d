//! Driver state-machine tests over a scripted backend. Virtual time is
//! paused, so contract timeouts elapse instantly while the mock clock stays
//! in lockstep with the tokio clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use eth_client::{
    pubkey_commitment, ChainError, CreatedSwap, LogPosition, NewSwapParams, SwapFactoryEvent,
    TxOutcome,
};
use swap_crypto::hex::hex_encode;
use swapd::backend::Backend;
use swapd::config::DriverConfig;
use swapd::db::{JsonFileDb, SwapStore};
use swapd::driver::{finalize, ShutdownController, SwapDriver, SwapEvent};
use swapd::error::SwapError;
use swapd::keyex::OwnKeys;
use swapd::message::SwapMessage;
use swapd::metrics::NoopMetrics;
use swapd::state::{Asset, ExchangeRate, Swap, SwapRole, SwapState};
use swapd::{maker, taker};
use xmr_wallet::VerifyOutcome;

const ETH_WEI: u128 = 1_000_000_000_000_000_000;
const XMR_PICO: u128 = 10_000_000_000_000;
const SWAP_ID: [u8; 32] = [0xAB; 32];
const BASE_TIME: u64 = 1_700_000_000;

struct MockBackend {
    started: Instant,
    sent: Mutex<Vec<SwapMessage>>,
    lock_params: Mutex<Vec<NewSwapParams>>,
    ready_calls: Mutex<Vec<B256>>,
    claim_calls: Mutex<Vec<(B256, [u8; 32])>>,
    refund_calls: Mutex<Vec<(B256, [u8; 32])>>,
    transfers: Mutex<Vec<(String, u64)>>,
    sweeps: Mutex<Vec<(String, Option<String>)>>,
    verify_script: Mutex<VecDeque<VerifyOutcome>>,
    default_verify: VerifyOutcome,
    fail_refund: AtomicBool,
}

impl MockBackend {
    fn new(default_verify: VerifyOutcome) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            sent: Mutex::new(Vec::new()),
            lock_params: Mutex::new(Vec::new()),
            ready_calls: Mutex::new(Vec::new()),
            claim_calls: Mutex::new(Vec::new()),
            refund_calls: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            sweeps: Mutex::new(Vec::new()),
            verify_script: Mutex::new(VecDeque::new()),
            default_verify,
            fail_refund: AtomicBool::new(false),
        })
    }

    fn confirmed() -> VerifyOutcome {
        VerifyOutcome::Confirmed {
            observed_height: 100,
            confirmations: 10,
        }
    }

    fn sent_messages(&self) -> Vec<SwapMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn eth_lock(&self, params: NewSwapParams) -> swapd::Result<CreatedSwap> {
        self.lock_params.lock().unwrap().push(params);
        let now = self.now();
        Ok(CreatedSwap {
            swap_id: B256::from(SWAP_ID),
            timeout_1: now + 60,
            timeout_2: now + 120,
            outcome: TxOutcome {
                tx_hash: B256::from([0x01; 32]),
                block_number: Some(1),
                logs: Vec::new(),
            },
        })
    }

    async fn eth_set_ready(&self, swap_id: B256) -> swapd::Result<String> {
        self.ready_calls.lock().unwrap().push(swap_id);
        Ok("0xready".into())
    }

    async fn eth_claim(&self, swap_id: B256, secret: [u8; 32]) -> swapd::Result<String> {
        self.claim_calls.lock().unwrap().push((swap_id, secret));
        Ok("0xclaim".into())
    }

    async fn eth_refund(&self, swap_id: B256, secret: [u8; 32]) -> swapd::Result<String> {
        self.refund_calls.lock().unwrap().push((swap_id, secret));
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(SwapError::Chain(ChainError::Permanent(
                "execution reverted: already claimed".into(),
            )));
        }
        Ok("0xrefund".into())
    }

    async fn eth_poll_events(
        &self,
        from_block: u64,
    ) -> swapd::Result<(Vec<(SwapFactoryEvent, LogPosition)>, u64)> {
        Ok((Vec::new(), from_block))
    }

    async fn eth_block_number(&self) -> swapd::Result<u64> {
        Ok(1)
    }

    async fn xmr_transfer(&self, address: &str, amount_pico: u64) -> swapd::Result<String> {
        self.transfers
            .lock()
            .unwrap()
            .push((address.to_string(), amount_pico));
        Ok("xmr-lock-tx".into())
    }

    async fn xmr_verify(&self, _address: &str, _amount_pico: u64) -> swapd::Result<VerifyOutcome> {
        let next = self.verify_script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(self.default_verify))
    }

    async fn xmr_primary_address(&self) -> swapd::Result<String> {
        Ok("primary-wallet-address".into())
    }

    async fn xmr_sweep_joint(
        &self,
        _spend_key: [u8; 32],
        _view_key: [u8; 32],
        joint_address: &str,
        _wallet_name: &str,
        destination: Option<&str>,
    ) -> swapd::Result<Option<String>> {
        self.sweeps
            .lock()
            .unwrap()
            .push((joint_address.to_string(), destination.map(String::from)));
        Ok(destination.map(|_| "xmr-sweep-tx".to_string()))
    }

    async fn net_send(
        &self,
        _peer: &swapd::net::PeerId,
        envelope: swapd::message::Envelope,
    ) -> swapd::Result<()> {
        self.sent.lock().unwrap().push(envelope.message);
        Ok(())
    }

    fn now(&self) -> u64 {
        BASE_TIME + self.started.elapsed().as_secs()
    }

    fn monero_network(&self) -> monero::Network {
        monero::Network::Mainnet
    }

    fn eth_address(&self) -> Address {
        Address::ZERO
    }
}

fn test_cfg() -> DriverConfig {
    DriverConfig {
        key_exchange_timeout_secs: 30,
        eth_lock_deadline_secs: 30,
        eth_lock_observe_secs: 60,
        refund_buffer_secs: 10,
        timeout_duration_secs: 60,
        poll_interval_ms: 1_000,
        shutdown_grace_secs: 5,
        send_retries: 2,
        send_backoff_ms: 10,
    }
}

fn offer_id() -> String {
    hex_encode(&[0x11; 32])
}

fn taker_swap() -> Swap {
    let mut swap = Swap::new(
        offer_id(),
        SwapRole::XmrTaker,
        "maker-peer".into(),
        Asset::Eth,
        ETH_WEI,
        XMR_PICO,
        ExchangeRate { num: 1, den: 100_000 },
        false,
    );
    swap.transition(SwapState::OfferAccepted).unwrap();
    swap.start_block = 1;
    swap
}

fn maker_swap() -> Swap {
    let mut swap = Swap::new(
        offer_id(),
        SwapRole::XmrMaker,
        "taker-peer".into(),
        Asset::Xmr,
        XMR_PICO,
        ETH_WEI,
        ExchangeRate { num: 100_000, den: 1 },
        false,
    );
    swap.transition(SwapState::OfferAccepted).unwrap();
    swap.start_block = 1;
    swap
}

struct Harness {
    backend: Arc<MockBackend>,
    store: SwapStore,
    controller: ShutdownController,
    input: mpsc::Sender<SwapEvent>,
    driver: SwapDriver<MockBackend>,
    _dir: tempfile::TempDir,
}

fn harness(swap: Swap, backend: Arc<MockBackend>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = SwapStore::new(Arc::new(JsonFileDb::new(dir.path()).unwrap()));
    let controller = ShutdownController::new();
    let (input, events) = mpsc::channel(64);
    let driver = SwapDriver {
        swap,
        backend: backend.clone(),
        store: store.clone(),
        events,
        shutdown: controller.subscribe(),
        metrics: Arc::new(NoopMetrics),
        cfg: test_cfg(),
        manager: None,
    };
    Harness {
        backend,
        store,
        controller,
        input,
        driver,
        _dir: dir,
    }
}

fn key_exchange_from(keys: &OwnKeys) -> SwapEvent {
    SwapEvent::Message(keys.exchange_message(Address::ZERO))
}

#[tokio::test(start_paused = true)]
async fn taker_happy_path_ends_claimed() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let mut h = harness(taker_swap(), backend.clone());
    let maker_keys = OwnKeys::generate(true).unwrap();
    let maker_secret = maker_keys.spend.secret().to_bytes();

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&maker_keys)).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        input
            .send(SwapEvent::Message(SwapMessage::NotifyXmrLocked {
                tx_hash: "maker-xmr-tx".into(),
            }))
            .await
            .unwrap();
        sleep(Duration::from_secs(3)).await;
        input
            .send(SwapEvent::Chain(SwapFactoryEvent::Claimed {
                swap_id: B256::from(SWAP_ID),
                secret: maker_secret,
            }))
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(taker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Claimed);

    // The lock commits to the maker's claim key and our refund key.
    let params = h.backend.lock_params.lock().unwrap().clone();
    assert_eq!(params.len(), 1);
    assert_eq!(
        params[0].claim_commitment,
        pubkey_commitment(&maker_keys.spend.public().secp256k1)
    );
    let own = OwnKeys::from_material(&h.driver.swap.keys).unwrap();
    assert_eq!(
        params[0].refund_commitment,
        pubkey_commitment(&own.spend.public().secp256k1)
    );

    assert_eq!(h.backend.ready_calls.lock().unwrap().len(), 1);
    assert_eq!(h.backend.sweeps.lock().unwrap().len(), 1);
    assert!(h.backend.refund_calls.lock().unwrap().is_empty());

    let persisted = h.store.load_swap(&offer_id()).unwrap().unwrap();
    assert_eq!(persisted.state, SwapState::Claimed);
    assert_eq!(persisted.contract_swap_id.as_deref(), Some(hex_encode(&SWAP_ID).as_str()));
}

#[tokio::test(start_paused = true)]
async fn taker_refunds_when_maker_never_locks() {
    let backend = MockBackend::new(VerifyOutcome::NotSeen);
    let mut h = harness(taker_swap(), backend.clone());
    let maker_keys = OwnKeys::generate(true).unwrap();

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&maker_keys)).await.unwrap();
        // The maker acknowledges keys and then vanishes.
        sleep(Duration::from_secs(200)).await;
    };

    let (result, _) = tokio::join!(taker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Refunded);

    let refunds = h.backend.refund_calls.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].0, B256::from(SWAP_ID));
    let own = OwnKeys::from_material(&h.driver.swap.keys).unwrap();
    assert_eq!(refunds[0].1, own.spend.secret().to_bytes());

    assert!(h.backend.claim_calls.lock().unwrap().is_empty());
    let persisted = h.store.load_swap(&offer_id()).unwrap().unwrap();
    assert_eq!(persisted.state, SwapState::Refunded);
}

#[tokio::test(start_paused = true)]
async fn taker_aborts_on_tampered_dleq() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let mut h = harness(taker_swap(), backend.clone());
    let maker_keys = OwnKeys::generate(true).unwrap();

    let mut message = maker_keys.exchange_message(Address::ZERO);
    if let SwapMessage::KeyExchange { dleq_s, .. } = &mut message {
        // Flip one byte of the response.
        let flipped = if dleq_s.starts_with("00") { "01" } else { "00" };
        dleq_s.replace_range(0..2, flipped);
    }
    h.input.send(SwapEvent::Message(message)).await.unwrap();

    let result = taker::run(&mut h.driver).await;
    assert!(matches!(&result, Err(SwapError::BadPeer(_))));

    finalize(&mut h.driver, result).await;
    let persisted = h.store.load_swap(&offer_id()).unwrap().unwrap();
    assert_eq!(persisted.state, SwapState::Aborted);

    // Nothing was ever locked.
    assert!(h.backend.lock_params.lock().unwrap().is_empty());
    assert!(h.backend.transfers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn taker_follows_claim_when_refund_loses_the_race() {
    let backend = MockBackend::new(MockBackend::confirmed());
    backend.fail_refund.store(true, Ordering::SeqCst);
    let mut h = harness(taker_swap(), backend.clone());
    let maker_keys = OwnKeys::generate(true).unwrap();
    let maker_secret = maker_keys.spend.secret().to_bytes();

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&maker_keys)).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        input
            .send(SwapEvent::Message(SwapMessage::NotifyXmrLocked {
                tx_hash: "maker-xmr-tx".into(),
            }))
            .await
            .unwrap();
        // Past t2 the refund races a claim that landed one block earlier.
        sleep(Duration::from_secs(125)).await;
        input
            .send(SwapEvent::Chain(SwapFactoryEvent::Claimed {
                swap_id: B256::from(SWAP_ID),
                secret: maker_secret,
            }))
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(taker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Claimed);
    assert!(!h.backend.refund_calls.lock().unwrap().is_empty());
    assert_eq!(h.backend.sweeps.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn taker_cancellation_persists_current_state() {
    let backend = MockBackend::new(VerifyOutcome::NotSeen);
    let mut h = harness(taker_swap(), backend.clone());
    let maker_keys = OwnKeys::generate(true).unwrap();

    h.input.send(key_exchange_from(&maker_keys)).await.unwrap();
    let input = h.input.clone();
    let controller = &h.controller;
    let feeder = async {
        // Let the driver reach EthLocked, then pull the root token.
        sleep(Duration::from_secs(5)).await;
        controller.trigger();
        drop(input);
    };

    let (result, _) = tokio::join!(taker::run(&mut h.driver), feeder);
    assert!(matches!(&result, Err(SwapError::Cancelled)));

    finalize(&mut h.driver, result).await;
    let persisted = h.store.load_swap(&offer_id()).unwrap().unwrap();
    assert_eq!(persisted.state, SwapState::EthLocked);
    // No refund or claim was initiated after cancellation.
    assert!(h.backend.refund_calls.lock().unwrap().is_empty());
    assert!(h.backend.claim_calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn maker_happy_path_ends_claimed() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let mut swap = maker_swap();
    let maker_keys = OwnKeys::generate(true).unwrap();
    maker_keys.record_into(&mut swap.keys);
    let mut h = harness(swap, backend.clone());
    let taker_keys = OwnKeys::generate(false).unwrap();

    let new_event = SwapFactoryEvent::New {
        swap_id: B256::from(SWAP_ID),
        claim_key: pubkey_commitment(&maker_keys.spend.public().secp256k1),
        refund_key: pubkey_commitment(&taker_keys.spend.public().secp256k1),
        value: alloy_primitives::U256::from(ETH_WEI),
        timeout_1: BASE_TIME + 60,
        timeout_2: BASE_TIME + 120,
    };

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&taker_keys)).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        input.send(SwapEvent::Chain(new_event)).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        input
            .send(SwapEvent::Message(SwapMessage::NotifyReady {}))
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(maker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Claimed);

    // The maker locked the agreed XMR on the joint address.
    let transfers = h.backend.transfers.lock().unwrap().clone();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].0, h.driver.swap.joint_address.clone().unwrap());
    assert_eq!(transfers[0].1 as u128, XMR_PICO);

    // The claim revealed the maker's own spend share after t1.
    let claims = h.backend.claim_calls.lock().unwrap().clone();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].1, maker_keys.spend.secret().to_bytes());
    assert!(h.backend.now() >= BASE_TIME + 60);

    let sent = h.backend.sent_messages();
    assert!(sent.iter().any(|m| matches!(m, SwapMessage::KeyExchange { .. })));
    assert!(sent.iter().any(|m| matches!(m, SwapMessage::NotifyXmrLocked { .. })));
    assert!(sent.iter().any(|m| matches!(m, SwapMessage::NotifyDone { .. })));
}

#[tokio::test(start_paused = true)]
async fn maker_aborts_when_eth_lock_never_appears() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let mut swap = maker_swap();
    let maker_keys = OwnKeys::generate(true).unwrap();
    maker_keys.record_into(&mut swap.keys);
    let mut h = harness(swap, backend.clone());
    let taker_keys = OwnKeys::generate(false).unwrap();

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&taker_keys)).await.unwrap();
        sleep(Duration::from_secs(200)).await;
    };

    let (result, _) = tokio::join!(maker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Aborted);
    // No XMR ever moved.
    assert!(h.backend.transfers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn maker_sweeps_back_when_taker_refunds() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let mut swap = maker_swap();
    let maker_keys = OwnKeys::generate(true).unwrap();
    maker_keys.record_into(&mut swap.keys);
    let mut h = harness(swap, backend.clone());
    let taker_keys = OwnKeys::generate(false).unwrap();
    let taker_secret = taker_keys.spend.secret().to_bytes();

    let new_event = SwapFactoryEvent::New {
        swap_id: B256::from(SWAP_ID),
        claim_key: pubkey_commitment(&maker_keys.spend.public().secp256k1),
        refund_key: pubkey_commitment(&taker_keys.spend.public().secp256k1),
        value: alloy_primitives::U256::from(ETH_WEI),
        timeout_1: BASE_TIME + 60,
        timeout_2: BASE_TIME + 120,
    };

    let input = h.input.clone();
    let feeder = async {
        input.send(key_exchange_from(&taker_keys)).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        input.send(SwapEvent::Chain(new_event)).await.unwrap();
        // Taker bails out early, revealing its spend share on-chain.
        sleep(Duration::from_secs(10)).await;
        input
            .send(SwapEvent::Chain(SwapFactoryEvent::Refunded {
                swap_id: B256::from(SWAP_ID),
                secret: taker_secret,
            }))
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(maker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Refunded);

    // Locked XMR came back to the primary wallet.
    let sweeps = h.backend.sweeps.lock().unwrap().clone();
    assert_eq!(sweeps.len(), 1);
    assert_eq!(sweeps[0].1.as_deref(), Some("primary-wallet-address"));
    assert!(h.backend.claim_calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn taker_resumes_from_persisted_eth_locked_state() {
    let backend = MockBackend::new(MockBackend::confirmed());
    let maker_keys = OwnKeys::generate(true).unwrap();
    let maker_secret = maker_keys.spend.secret().to_bytes();

    // Simulate a record persisted by a previous run that stopped in S3.
    let mut swap = taker_swap();
    let own = OwnKeys::generate(false).unwrap();
    own.record_into(&mut swap.keys);
    let parts = swapd::message::KeyExchangeParts::parse(
        &maker_keys.exchange_message(Address::ZERO),
    )
    .unwrap();
    let their = swapd::keyex::TheirKeys::verify(&parts).unwrap();
    their.record_into(&mut swap.keys);
    swap.joint_address =
        Some(swapd::keyex::joint_address(&own, &their, monero::Network::Mainnet).unwrap());
    swap.state = SwapState::EthLocked;
    swap.contract_swap_id = Some(hex_encode(&SWAP_ID));
    swap.timeout_1 = Some(BASE_TIME + 60);
    swap.timeout_2 = Some(BASE_TIME + 120);
    swap.xmr_lock_tx = Some("maker-xmr-tx".into());

    let mut h = harness(swap, backend.clone());
    let input = h.input.clone();
    let feeder = async {
        sleep(Duration::from_secs(5)).await;
        input
            .send(SwapEvent::Chain(SwapFactoryEvent::Claimed {
                swap_id: B256::from(SWAP_ID),
                secret: maker_secret,
            }))
            .await
            .unwrap();
    };

    let (result, _) = tokio::join!(taker::run(&mut h.driver), feeder);
    assert_eq!(result.unwrap(), SwapState::Claimed);
    // No second lock was submitted on resume.
    assert!(h.backend.lock_params.lock().unwrap().is_empty());
}

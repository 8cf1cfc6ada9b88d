//! Daemon lifecycle: ordered startup, message dispatch, resume of persisted
//! swaps, and drain-on-shutdown. Any failure during startup unwinds the
//! resources brought up so far before returning.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use eth_client::{EthClient, SwapFactoryClient};
use swap_crypto::hex::{decode_hex, hex_encode};
use xmr_wallet::XmrWallet;

use crate::backend::{Backend, SwapdBackend};
use crate::config::Config;
use crate::db::{JsonFileDb, SwapStore};
use crate::driver::{ShutdownController, SwapEvent};
use crate::maker::Maker;
use crate::manager::SwapManager;
use crate::message::{Envelope, SwapMessage};
use crate::metrics::TracingMetrics;
use crate::net::{Host, InboundHandler, MessageSender, PeerId};
use crate::rpc::{self, RpcState};
use crate::state::SwapRole;
use crate::taker::Taker;

/// Routes inbound envelopes: new swap entries go to the maker (it owns the
/// offer book), everything else to the owning driver via the manager.
struct Dispatcher<B: Backend + 'static> {
    manager: Arc<SwapManager>,
    maker: Arc<Maker<B>>,
}

#[async_trait]
impl<B: Backend + 'static> InboundHandler for Dispatcher<B> {
    async fn handle(&self, peer: PeerId, envelope: Envelope) {
        match &envelope.message {
            SwapMessage::OfferAccepted { offer_id } => {
                if let Err(err) = self.maker.on_offer_accepted(peer, offer_id).await {
                    warn!(%offer_id, error = %err, "rejected inbound swap");
                }
            }
            SwapMessage::Offer { .. } => {
                debug!(%peer, "unsolicited offer broadcast ignored");
            }
            message => match self.manager.get(&envelope.swap_id) {
                Some(handle) => {
                    let _ = handle.input.send(SwapEvent::Message(message.clone())).await;
                }
                None => debug!(swap_id = %envelope.swap_id, "message for unknown swap dropped"),
            },
        }
    }
}

/// Runs the daemon until the controller is triggered, then drains and closes
/// everything in reverse order.
pub async fn run<F>(
    cfg: Config,
    controller: &ShutdownController,
    build_host: F,
) -> anyhow::Result<()>
where
    F: FnOnce(PeerId) -> (Arc<dyn Host>, Arc<dyn MessageSender>),
{
    info!(env = ?cfg.env, data_dir = %cfg.data_dir.display(), "starting swapd");

    // 1. Database.
    let db = JsonFileDb::new(cfg.data_dir.join("db"))?;
    let store = SwapStore::new(Arc::new(db));

    // 2. Ethereum client; the chain id is validated against the environment.
    // With an external signer the daemon holds no local key at all.
    let eth_key = if cfg.external_signer {
        None
    } else {
        Some(resolve_eth_key(&store, cfg.eth_privkey_file.as_deref())?)
    };
    let eth = Arc::new(
        EthClient::connect(
            &cfg.eth_endpoint,
            eth_key.as_deref(),
            cfg.env.eth_chain_id(),
            cfg.env.eth_confirmations(),
        )
        .await
        .context("ethereum endpoint")?,
    );
    match eth.address() {
        Some(address) => info!(%address, chain_id = eth.chain_id(), "ethereum client ready"),
        None => info!(
            chain_id = eth.chain_id(),
            "ethereum client ready without a local key; chain writes await the external signer"
        ),
    }

    // 3. Monero wallet.
    let wallet = Arc::new(XmrWallet::connect(&cfg.monero_wallet_rpc).await?);
    open_or_create_wallet(&wallet, &cfg).await?;

    // Failures from here on must close the wallet again before returning.
    let result = run_inner(&cfg, controller, build_host, store, eth, wallet.clone()).await;
    if let Err(err) = wallet.close_wallet().await {
        warn!(error = %err, "failed to close monero wallet");
    }
    result
}

async fn run_inner<F>(
    cfg: &Config,
    controller: &ShutdownController,
    build_host: F,
    store: SwapStore,
    eth: Arc<EthClient>,
    wallet: Arc<XmrWallet>,
) -> anyhow::Result<()>
where
    F: FnOnce(PeerId) -> (Arc<dyn Host>, Arc<dyn MessageSender>),
{
    // 4. Swap contract: deploy, or validate the configured address.
    let factory = setup_contract(cfg, &eth).await?;

    // 5. Swap manager.
    let manager = Arc::new(SwapManager::new(cfg.single_swap));

    // 6. Backend façade over 2-4, bound to the network sender.
    let peer_id = load_or_create_identity(&store)?;
    let (host, sender) = build_host(peer_id.clone());
    info!(%peer_id, "network identity loaded");
    let backend = Arc::new(SwapdBackend::new(
        factory,
        wallet.clone(),
        sender,
        cfg.env,
        cfg.wallet_file.clone(),
        cfg.wallet_password.clone(),
    ));

    if cfg.transfer_back {
        let destination = wallet.get_primary_address().await?;
        info!(%destination, "claimed XMR will be swept back to this wallet");
    }

    // 7. Protocol instances over the backend.
    let metrics = Arc::new(TracingMetrics);
    let maker = Arc::new(Maker::new(
        backend.clone(),
        manager.clone(),
        store.clone(),
        metrics.clone(),
        controller.subscribe(),
        cfg.driver,
    ));
    let taker = Arc::new(Taker::new(
        backend.clone(),
        manager.clone(),
        store.clone(),
        metrics,
        controller.subscribe(),
        cfg.driver,
        cfg.transfer_back,
    ));

    // Resume any swap the previous run left non-terminal.
    for swap in store.active_swaps()? {
        let resumed = match swap.role {
            SwapRole::XmrMaker => maker.resume(swap).await,
            SwapRole::XmrTaker => taker.resume(swap).await,
        };
        if let Err(err) = resumed {
            warn!(error = %err, "failed to resume persisted swap");
        }
    }

    // 8. Network host, with the maker as inbound swap handler.
    let dispatcher = Arc::new(Dispatcher {
        manager: manager.clone(),
        maker: maker.clone(),
    });
    host.set_handler(dispatcher);
    host.start().await.map_err(|err| anyhow!("host start: {err}"))?;

    // 9. RPC server.
    let rpc_state = RpcState {
        manager,
        store,
        maker: maker.clone(),
        taker: taker.clone(),
    };
    let rpc_bind = cfg.rpc_bind.clone();
    let rpc_shutdown = controller.subscribe();
    let rpc_task = tokio::spawn(async move {
        if let Err(err) = rpc::serve(&rpc_bind, rpc_state, rpc_shutdown).await {
            warn!(error = %err, "RPC server stopped");
        }
    });

    info!("swapd running");
    controller.subscribe().cancelled().await;
    info!("shutting down");

    // Reverse order: RPC, host, drivers, then (in run) wallet and database.
    let grace = std::time::Duration::from_secs(cfg.driver.shutdown_grace_secs);
    let _ = tokio::time::timeout(grace, rpc_task).await;
    if let Err(err) = host.stop().await {
        warn!(error = %err, "host stop failed");
    }
    maker.drain(grace).await;
    taker.drain(grace).await;
    info!("drivers drained");
    Ok(())
}

async fn setup_contract(cfg: &Config, eth: &Arc<EthClient>) -> anyhow::Result<SwapFactoryClient> {
    if cfg.deploy {
        let artifact = cfg
            .contract_artifact
            .as_ref()
            .ok_or_else(|| anyhow!("--deploy requires --contract-artifact"))?;
        let bytecode = read_artifact_field(artifact, "bytecode")?;
        let (address, outcome) = eth.deploy(bytecode).await?;
        info!(%address, tx = %outcome.tx_hash, "deployed swap contract");
        return Ok(SwapFactoryClient::new(eth.clone(), address));
    }

    let address: Address = cfg
        .contract_address
        .as_deref()
        .ok_or_else(|| anyhow!("--contract-address or --deploy is required"))?
        .parse()
        .context("contract address")?;
    let factory = SwapFactoryClient::new(eth.clone(), address);

    match cfg.contract_artifact.as_ref() {
        Some(artifact) => {
            let deployed = read_artifact_field(artifact, "deployedBytecode")?;
            factory.verify_code(keccak256(&deployed)).await?;
            info!(%address, "contract bytecode validated");
        }
        None if cfg.env == crate::config::Environment::Dev => {
            warn!(%address, "no contract artifact; skipping bytecode validation");
        }
        None => bail!("contract artifact required to validate the address outside dev"),
    }
    Ok(factory)
}

fn read_artifact_field(path: &Path, field: &str) -> anyhow::Result<Vec<u8>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let artifact: serde_json::Value = serde_json::from_str(&raw).context("parse artifact")?;
    let value = artifact
        .get(field)
        .and_then(|value| value.as_str())
        .ok_or_else(|| anyhow!("artifact missing {field}"))?;
    decode_hex(value.trim_start_matches("0x")).map_err(|err| anyhow!("artifact {field}: {err}"))
}

/// Resolves the local Ethereum key: from the given key file when one is
/// configured (created if missing), otherwise from the `keys/ethereum`
/// database record (created if missing).
fn resolve_eth_key(store: &SwapStore, key_file: Option<&Path>) -> anyhow::Result<String> {
    if let Some(path) = key_file {
        if path.exists() {
            let raw =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            return Ok(raw.trim().to_string());
        }
        let signer = alloy_signer_local::PrivateKeySigner::random();
        let hex = hex_encode(signer.to_bytes().as_slice());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        fs::write(path, &hex).with_context(|| format!("write {}", path.display()))?;
        info!(address = %signer.address(), path = %path.display(), "generated new ethereum key file");
        return Ok(hex);
    }

    if let Some(bytes) = store.load_key("ethereum")? {
        return Ok(String::from_utf8(bytes).context("ethereum key file")?.trim().to_string());
    }
    let signer = alloy_signer_local::PrivateKeySigner::random();
    let hex = hex_encode(signer.to_bytes().as_slice());
    store.save_key("ethereum", hex.as_bytes())?;
    info!(address = %signer.address(), "generated new ethereum key");
    Ok(hex)
}

/// Network identity: an ed25519 keypair persisted across restarts. The peer
/// id is the hex verifying key.
fn load_or_create_identity(store: &SwapStore) -> anyhow::Result<PeerId> {
    let signing_key = match store.load_key("net_identity")? {
        Some(bytes) => {
            let hex = String::from_utf8(bytes).context("identity key file")?;
            let secret = swap_crypto::hex::decode_hex_32(hex.trim())
                .map_err(|err| anyhow!("identity key: {err}"))?;
            ed25519_dalek::SigningKey::from_bytes(&secret)
        }
        None => {
            let mut secret = [0u8; 32];
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut secret);
            let key = ed25519_dalek::SigningKey::from_bytes(&secret);
            store.save_key("net_identity", hex_encode(&secret).as_bytes())?;
            key
        }
    };
    Ok(hex_encode(signing_key.verifying_key().as_bytes()))
}

async fn open_or_create_wallet(wallet: &XmrWallet, cfg: &Config) -> anyhow::Result<()> {
    let password = cfg.wallet_password.as_deref();
    if wallet.open_wallet(&cfg.wallet_file, password).await.is_ok() {
        return Ok(());
    }
    info!(wallet = %cfg.wallet_file, "wallet missing; creating");
    wallet
        .create_wallet(&cfg.wallet_file, password, "English")
        .await
        .context("create wallet")?;
    wallet
        .open_wallet(&cfg.wallet_file, password)
        .await
        .context("open wallet")?;
    Ok(())
}

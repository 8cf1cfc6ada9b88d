use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swapd::config::{expand_bootnodes, validate_rpc_url, Config, DriverConfig, Environment};
use swapd::daemon;
use swapd::driver::ShutdownController;
use swapd::net::{Host, LoopbackBus, MessageSender};

const DEFAULT_RPC_PORT: u16 = 5005;
const DEFAULT_XMRTAKER_RPC_PORT: u16 = 5001;
const DEFAULT_XMRMAKER_RPC_PORT: u16 = 5002;

#[derive(Parser)]
#[command(name = "swapd", version, about = "Daemon for ETH/XMR atomic swaps")]
struct Cli {
    /// Environment: dev, stagenet or mainnet
    #[arg(long, value_enum, default_value = "dev")]
    env: Environment,
    /// Path to store swap artifacts
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Bind address for the daemon RPC server
    #[arg(long)]
    rpc_bind: Option<String>,
    /// monero-wallet-rpc endpoint
    #[arg(long, default_value = "http://127.0.0.1:18083/json_rpc")]
    monero_wallet_rpc: String,
    /// Monero wallet file, created if missing
    #[arg(long, default_value = "swap-wallet")]
    wallet_file: String,
    /// Password of the monero wallet file
    #[arg(long)]
    wallet_password: Option<String>,
    /// Ethereum client endpoint
    #[arg(long, default_value = "http://127.0.0.1:8545")]
    ethereum_endpoint: String,
    /// File containing the ethereum private key as hex, generated if missing
    #[arg(long)]
    ethereum_privkey: Option<PathBuf>,
    /// Use an external signer, for usage with the swap UI
    #[arg(long, default_value_t = false)]
    external_signer: bool,
    /// Address of an already deployed SwapFactory; required on mainnet
    #[arg(long)]
    contract_address: Option<String>,
    /// Contract build artifact used for deploy / bytecode validation
    #[arg(long)]
    contract_artifact: Option<PathBuf>,
    /// Deploy an instance of the swap contract
    #[arg(long, default_value_t = false)]
    deploy: bool,
    /// Run in development mode with ETH provider defaults
    #[arg(long, default_value_t = false)]
    dev_xmrtaker: bool,
    /// Run in development mode with XMR provider defaults
    #[arg(long, default_value_t = false)]
    dev_xmrmaker: bool,
    /// When receiving XMR, sweep it back to the original wallet
    #[arg(long, default_value_t = false)]
    transfer_back: bool,
    /// Allow at most one active swap in this process
    #[arg(long, default_value_t = false)]
    single_swap: bool,
    /// Bootnode, comma separated if passing multiple to a single flag
    #[arg(long)]
    bootnodes: Vec<String>,
    /// Log level: one of [error|warn|info|debug]
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level)?)
        .init();

    if cli.dev_xmrmaker && cli.dev_xmrtaker {
        bail!("flags --dev-xmrmaker and --dev-xmrtaker are mutually exclusive");
    }
    if cli.deploy && cli.contract_address.is_some() {
        bail!("flags --deploy and --contract-address are mutually exclusive");
    }
    if cli.external_signer && cli.ethereum_privkey.is_some() {
        bail!("flags --external-signer and --ethereum-privkey are mutually exclusive");
    }
    validate_rpc_url("ethereum endpoint", &cli.ethereum_endpoint)?;
    validate_rpc_url("monero wallet rpc", &cli.monero_wallet_rpc)?;

    let rpc_port = match (&cli.rpc_bind, cli.dev_xmrtaker, cli.dev_xmrmaker) {
        (Some(_), _, _) => 0,
        (None, true, _) => DEFAULT_XMRTAKER_RPC_PORT,
        (None, _, true) => DEFAULT_XMRMAKER_RPC_PORT,
        (None, false, false) => DEFAULT_RPC_PORT,
    };
    let rpc_bind = cli
        .rpc_bind
        .clone()
        .unwrap_or_else(|| format!("127.0.0.1:{rpc_port}"));

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| default_data_dir(&cli));

    let cfg = Config {
        env: cli.env,
        data_dir,
        rpc_bind,
        monero_wallet_rpc: cli.monero_wallet_rpc,
        wallet_file: cli.wallet_file,
        wallet_password: cli.wallet_password,
        eth_endpoint: cli.ethereum_endpoint,
        eth_privkey_file: cli.ethereum_privkey,
        external_signer: cli.external_signer,
        contract_address: cli.contract_address,
        contract_artifact: cli.contract_artifact,
        deploy: cli.deploy,
        transfer_back: cli.transfer_back,
        single_swap: cli.single_swap,
        bootnodes: expand_bootnodes(&cli.bootnodes),
        driver: DriverConfig {
            timeout_duration_secs: cli.env.timeout_duration_secs(),
            ..DriverConfig::default()
        },
    };

    let controller = Arc::new(ShutdownController::new());
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            controller.trigger();
        });
    }

    let bus = LoopbackBus::new();
    daemon::run(cfg, controller.as_ref(), move |peer| {
        let host = bus.host(peer);
        (host.clone() as Arc<dyn Host>, host as Arc<dyn MessageSender>)
    })
    .await
}

fn default_data_dir(cli: &Cli) -> PathBuf {
    if cli.dev_xmrtaker {
        return std::env::temp_dir().join("swapd-xmrtaker");
    }
    if cli.dev_xmrmaker {
        return std::env::temp_dir().join("swapd-xmrmaker");
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let env_dir = match cli.env {
        Environment::Dev => "dev",
        Environment::Stagenet => "stagenet",
        Environment::Mainnet => "mainnet",
    };
    home.join(".ethxmr-swap").join(env_dir)
}

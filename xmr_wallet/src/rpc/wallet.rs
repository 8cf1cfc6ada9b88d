use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use monero_rpc::{
    monero::{Address, Amount, PrivateKey},
    GetTransfersCategory, GetTransfersSelector, GotTransfer, RpcClientBuilder, SweepAllArgs,
    TransferOptions, TransferPriority, WalletClient,
};
use rand::Rng;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use anyhow::anyhow;

use crate::types::{Result, WalletError};

/// Time budget for one logical wallet call. Reads are idempotent, so a call
/// is re-attempted until its budget runs out; each attempt is individually
/// capped so a stalled RPC cannot consume the whole budget at once.
#[derive(Debug, Clone, Copy)]
pub struct RpcPolicy {
    pub attempt_timeout: Duration,
    pub call_budget: Duration,
    pub backoff_floor: Duration,
}

impl Default for RpcPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            call_budget: Duration::from_secs(20),
            backoff_floor: Duration::from_millis(200),
        }
    }
}

impl RpcPolicy {
    /// `SWAPD_XMR_RPC_{ATTEMPT_MS,BUDGET_MS,BACKOFF_MS}` override the
    /// defaults, in milliseconds.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            attempt_timeout: env_duration("SWAPD_XMR_RPC_ATTEMPT_MS", default.attempt_timeout),
            call_budget: env_duration("SWAPD_XMR_RPC_BUDGET_MS", default.call_budget),
            backoff_floor: env_duration("SWAPD_XMR_RPC_BACKOFF_MS", default.backoff_floor),
        }
    }
}

fn env_duration(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

/// Runs `call` until it succeeds or the policy budget is spent. The pause
/// between attempts doubles from the floor, trimmed to whatever budget is
/// left, with a little jitter so concurrent callers fan out.
pub(crate) async fn call_with_budget<T, F, Fut>(
    policy: &RpcPolicy,
    op: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let give_up = Instant::now() + policy.call_budget;
    let mut pause = policy.backoff_floor;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let last_error = match timeout(policy.attempt_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => Some(err),
            Err(_elapsed) => None,
        };

        let now = Instant::now();
        if now + pause >= give_up {
            return match last_error {
                Some(err) => Err(err),
                None => Err(WalletError::GaveUp { op, attempts }),
            };
        }
        match &last_error {
            Some(err) => warn!(op, attempts, error = %err, "wallet RPC failed; backing off"),
            None => warn!(op, attempts, "wallet RPC attempt timed out; backing off"),
        }

        let jitter = rand::thread_rng().gen_range(0..=pause.as_millis() as u64 / 2);
        sleep(pause + Duration::from_millis(jitter)).await;
        pause = (pause * 2).min(give_up.saturating_duration_since(now));
    }
}

/// Wrapper over a `monero-wallet-rpc` endpoint. The RPC process serializes
/// wallet mutations, so one instance of this client may be shared across
/// tasks; only one wallet file can be open at a time.
pub struct XmrWallet {
    client: WalletClient,
    policy: RpcPolicy,
}

impl XmrWallet {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_policy(url, RpcPolicy::from_env()).await
    }

    pub async fn connect_with_policy(url: &str, policy: RpcPolicy) -> Result<Self> {
        debug!(rpc_url = url, "Connecting to Monero wallet RPC");
        let rpc_client = RpcClientBuilder::new().build(url)?;
        let client = rpc_client.wallet();
        Ok(Self { client, policy })
    }

    async fn call<T, F, Fut>(&self, op: &'static str, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        call_with_budget(&self.policy, op, action).await
    }

    pub async fn create_wallet(
        &self,
        filename: &str,
        password: Option<&str>,
        language: &str,
    ) -> Result<()> {
        debug!(wallet = filename, "Creating Monero wallet");
        let filename = filename.to_string();
        let password = password.map(|value| value.to_string());
        let language = language.to_string();
        self.call("create_wallet", || async {
            self.client
                .create_wallet(filename.clone(), password.clone(), language.clone())
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn open_wallet(&self, filename: &str, password: Option<&str>) -> Result<()> {
        debug!(wallet = filename, "Opening Monero wallet");
        let filename = filename.to_string();
        let password = password.map(|value| value.to_string());
        self.call("open_wallet", || async {
            self.client
                .open_wallet(filename.clone(), password.clone())
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn close_wallet(&self) -> Result<()> {
        debug!("Closing Monero wallet");
        self.call("close_wallet", || async {
            self.client.close_wallet().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_balance(&self) -> Result<u64> {
        self.call("get_balance", || async {
            let balance = self.client.get_balance(0, None).await?;
            Ok(balance.balance.as_pico())
        })
        .await
    }

    pub async fn get_primary_address(&self) -> Result<String> {
        self.call("get_primary_address", || async {
            let addresses = self.client.get_address(0, None).await?;
            Ok(addresses.address.to_string())
        })
        .await
    }

    pub async fn refresh(&self, start_height: Option<u64>) -> Result<()> {
        self.call("refresh", || async {
            self.client.refresh(start_height).await?;
            Ok(())
        })
        .await
    }

    pub async fn get_height(&self) -> Result<u64> {
        self.call("get_height", || async {
            let height = self.client.get_height().await?;
            Ok(height.get())
        })
        .await
    }

    pub async fn get_incoming_transfers(&self) -> Result<Vec<GotTransfer>> {
        self.call("get_incoming_transfers", || async {
            let mut selector = GetTransfersSelector::default();
            let mut category_selector = HashMap::new();
            category_selector.insert(GetTransfersCategory::In, true);
            category_selector.insert(GetTransfersCategory::Pool, true);
            selector.category_selector = category_selector;
            let transfers = self.client.get_transfers(selector).await?;
            let mut results = Vec::new();
            for values in transfers.values() {
                results.extend(values.clone());
            }
            Ok(results)
        })
        .await
    }

    /// Sends `amount_pico` to `destination` and returns the transaction hash
    /// once the wallet accepts the transfer.
    pub async fn transfer(&self, destination: &str, amount_pico: u64) -> Result<String> {
        debug!(amount_pico, "Submitting Monero transfer");
        Address::from_str(destination)
            .map_err(|err| anyhow!("invalid destination address: {err}"))?;
        let destination = destination.to_string();
        self.call("transfer", || async {
            let address = Address::from_str(&destination)
                .map_err(|err| anyhow!("invalid destination address: {err}"))?;
            let mut destinations = HashMap::new();
            destinations.insert(address, Amount::from_pico(amount_pico));
            let result = self
                .client
                .transfer(destinations, TransferPriority::Default, TransferOptions::default())
                .await?;
            Ok(result.tx_hash.to_string())
        })
        .await
    }

    /// Loads a wallet file from raw spend/view keys. Used to open the joint
    /// swap wallet once both secret shares are known.
    pub async fn import_spend_key(
        &self,
        spend_key_bytes: [u8; 32],
        view_key_bytes: [u8; 32],
        address: &str,
        filename: &str,
        restore_height: Option<u64>,
    ) -> Result<()> {
        debug!(wallet = filename, "Importing spend/view keys into wallet");
        let address_str = address.to_string();
        PrivateKey::from_slice(&spend_key_bytes)
            .map_err(|err| anyhow!("invalid spend key: {err}"))?;
        PrivateKey::from_slice(&view_key_bytes).map_err(|err| anyhow!("invalid view key: {err}"))?;
        Address::from_str(&address_str).map_err(|err| anyhow!("invalid address: {err}"))?;
        self.call("generate_from_keys", || async {
            let spend_key = PrivateKey::from_slice(&spend_key_bytes)
                .map_err(|err| anyhow!("invalid spend key: {err}"))?;
            let view_key = PrivateKey::from_slice(&view_key_bytes)
                .map_err(|err| anyhow!("invalid view key: {err}"))?;
            let address =
                Address::from_str(&address_str).map_err(|err| anyhow!("invalid address: {err}"))?;
            let args = monero_rpc::GenerateFromKeysArgs {
                restore_height,
                filename: filename.to_string(),
                address,
                spendkey: Some(spend_key),
                viewkey: view_key,
                password: String::new(),
                autosave_current: Some(true),
            };
            self.client.generate_from_keys(args).await?;
            Ok(())
        })
        .await
    }

    /// Sweeps the full balance of the currently open wallet to `destination`.
    pub async fn sweep_all(&self, destination: &str) -> Result<String> {
        debug!("Sweeping wallet balance");
        Address::from_str(destination)
            .map_err(|err| anyhow!("invalid destination address: {err}"))?;
        let destination = destination.to_string();
        self.call("sweep_all", || async {
            let address = Address::from_str(&destination)
                .map_err(|err| anyhow!("invalid destination address: {err}"))?;
            let args = SweepAllArgs {
                address,
                account_index: 0,
                subaddr_indices: None,
                priority: TransferPriority::Default,
                mixin: 15,
                ring_size: 16,
                unlock_time: 0,
                get_tx_keys: Some(true),
                below_amount: None,
                do_not_relay: None,
                get_tx_hex: None,
                get_tx_metadata: None,
            };
            let result = self.client.sweep_all(args).await?;
            let first = result
                .tx_hash_list
                .first()
                .map(|hash| hash.to_string())
                .unwrap_or_default();
            Ok(first)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tight_policy() -> RpcPolicy {
        RpcPolicy {
            attempt_timeout: Duration::from_millis(20),
            call_budget: Duration::from_millis(200),
            backoff_floor: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn recovers_within_the_budget() {
        let failures_left = Arc::new(AtomicUsize::new(2));
        let counter = failures_left.clone();
        let value = call_with_budget(&tight_policy(), "get_height", move || {
            let counter = counter.clone();
            async move {
                let failed = counter
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    Err(anyhow::anyhow!("wallet flaky").into())
                } else {
                    Ok(7u64)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_the_last_error() {
        let err = call_with_budget(&tight_policy(), "refresh", || async {
            Err::<(), _>(anyhow::anyhow!("wallet busy").into())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("wallet busy"));
    }

    #[tokio::test]
    async fn stalled_attempts_give_up_with_the_operation_name() {
        let policy = RpcPolicy {
            attempt_timeout: Duration::from_millis(5),
            call_budget: Duration::from_millis(30),
            backoff_floor: Duration::from_millis(1),
        };
        let err = call_with_budget(&policy, "get_balance", || async {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            WalletError::GaveUp {
                op: "get_balance",
                ..
            }
        ));
    }
}

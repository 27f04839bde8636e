use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::bridge::{AddressValidator, BalanceObserver};

use super::Subaddress;

/// Monero wallet JSON-RPC client. All operations target account 0; invoices
/// are isolated from one another purely by subaddress minor index.
#[derive(Clone)]
pub struct MoneroRpcClient {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreateAddressResult {
    addresses: Vec<String>,
    address_indices: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct ValidateAddressResult {
    valid: bool,
    #[serde(default)]
    nettype: String,
}

#[derive(Debug, Deserialize, Default)]
struct GetTransfersResult {
    #[serde(default, rename = "in")]
    incoming: Vec<Transfer>,
    #[serde(default)]
    pool: Vec<Transfer>,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    amount: u64,
    #[serde(default)]
    unlock_time: u64,
    #[serde(default)]
    double_spend_seen: bool,
}

#[derive(Debug, Deserialize)]
struct SweepAllResult {
    #[serde(default)]
    tx_hash_list: Vec<String>,
}

impl MoneroRpcClient {
    pub fn new(url: String, username: String, password: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build wallet rpc http client")?;
        Ok(Self {
            client,
            url,
            username,
            password,
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });

        let envelope: RpcEnvelope<T> = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("wallet rpc {method}: send"))?
            .error_for_status()
            .with_context(|| format!("wallet rpc {method}: status"))?
            .json()
            .await
            .with_context(|| format!("wallet rpc {method}: decode"))?;

        if let Some(err) = envelope.error {
            anyhow::bail!("wallet rpc {method}: {} (code {})", err.message, err.code);
        }
        envelope
            .result
            .with_context(|| format!("wallet rpc {method}: empty result"))
    }

    /// Create a fresh subaddress under account 0.
    pub async fn create_subaddress(&self) -> Result<Subaddress> {
        let result: CreateAddressResult = self
            .call("create_address", json!({"account_index": 0, "count": 1}))
            .await?;

        let address = result
            .addresses
            .into_iter()
            .next()
            .context("create_address returned no address")?;
        let minor_index = result
            .address_indices
            .into_iter()
            .next()
            .context("create_address returned no index")?;
        anyhow::ensure!(!address.is_empty(), "create_address returned empty address");

        Ok(Subaddress {
            address,
            minor_index,
        })
    }

    /// Validate a payer-supplied address and report the network it belongs to.
    pub async fn validate_address(&self, address: &str) -> Result<(bool, String)> {
        let result: ValidateAddressResult = self
            .call("validate_address", json!({"address": address}))
            .await?;
        Ok((result.valid, result.nettype))
    }

    /// Sweep everything received at one subaddress to `target`, returning the
    /// transaction hashes (empty when there was nothing to sweep).
    pub async fn sweep_subaddress(&self, minor_index: u32, target: &str) -> Result<Vec<String>> {
        let result: Result<SweepAllResult> = self
            .call(
                "sweep_all",
                json!({
                    "address": target,
                    "account_index": 0,
                    "subaddr_indices": [minor_index],
                    "get_tx_keys": true,
                }),
            )
            .await;

        match result {
            Ok(r) => Ok(r.tx_hash_list),
            // The wallet reports an empty sweep as an error; treat it as a
            // clean no-op so release never stalls on a dust-free subaddress.
            Err(e) if e.to_string().contains("No unlocked balance") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AddressValidator for MoneroRpcClient {
    async fn is_valid_address(&self, address: &str) -> Result<bool> {
        let (valid, _) = self.validate_address(address).await?;
        Ok(valid)
    }
}

#[async_trait]
impl BalanceObserver for MoneroRpcClient {
    async fn received_total(&self, minor_index: u32, include_unconfirmed: bool) -> Result<u64> {
        let result: GetTransfersResult = self
            .call(
                "get_transfers",
                json!({
                    "in": true,
                    "out": false,
                    "pending": true,
                    "failed": false,
                    "pool": true,
                    "filter_by_height": false,
                    "account_index": 0,
                    "subaddr_indices": [minor_index],
                }),
            )
            .await?;

        let spendable = |t: &Transfer| t.unlock_time == 0 && !t.double_spend_seen;

        let mut total: u64 = result
            .incoming
            .iter()
            .filter(|t| spendable(t))
            .map(|t| t.amount)
            .sum();
        if include_unconfirmed {
            total = total.saturating_add(
                result
                    .pool
                    .iter()
                    .filter(|t| spendable(t))
                    .map(|t| t.amount)
                    .sum(),
            );
        }
        Ok(total)
    }
}

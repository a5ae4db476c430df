//! WalletExplorer API client implementing [`WalletLookup`].
//!
//! WalletExplorer clusters addresses by common-input ownership and attaches
//! labels to known services. The API is free but asks callers to identify
//! themselves through the `caller` parameter.

use std::time::Duration;

use eyre::{eyre, Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::source::WalletLookup;
use crate::types::{
    WalletAddressPage, WalletLookupResult, WalletTransaction, WalletTxKind, WalletTxOutput,
    WalletTxPage,
};

/// WalletExplorer API base URL.
pub const WALLETEXPLORER_BASE_URL: &str = "https://www.walletexplorer.com/api/1";

/// Default `caller` identification sent with every request.
const DEFAULT_CALLER: &str = "fundflow";

/// HTTP client for WalletExplorer.
pub struct WalletExplorerClient {
    http: reqwest::Client,
    base_url: String,
    caller: String,
}

impl WalletExplorerClient {
    /// Creates a client against the public endpoint.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: WALLETEXPLORER_BASE_URL.to_string(),
            caller: DEFAULT_CALLER.to_string(),
        })
    }

    /// Points the client at a different base URL.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Overrides the `caller` identification.
    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = caller.to_string();
        self
    }

    async fn get_json(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("caller", self.caller.clone()));

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .wrap_err_with(|| format!("WalletExplorer {endpoint} request failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(eyre!(
                "WalletExplorer {} returned HTTP {}",
                endpoint,
                status.as_u16()
            ));
        }

        let body = response
            .json::<Value>()
            .await
            .wrap_err_with(|| format!("failed to parse WalletExplorer {endpoint} JSON"))?;
        debug!(endpoint, "WalletExplorer response received");
        Ok(body)
    }
}

impl WalletLookup for WalletExplorerClient {
    #[tracing::instrument(skip(self))]
    async fn lookup(&self, address: &str) -> Result<WalletLookupResult> {
        let body = self
            .get_json("address-lookup", &[("address", address.to_string())])
            .await?;
        Ok(parse_lookup(&body))
    }

    #[tracing::instrument(skip(self))]
    async fn get_wallet_transactions(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<Option<WalletTxPage>> {
        let body = self
            .get_json(
                "wallet",
                &[
                    ("wallet", wallet_id.to_string()),
                    ("from", offset.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        Ok(parse_wallet_transactions(&body))
    }

    #[tracing::instrument(skip(self))]
    async fn get_wallet_addresses(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<WalletAddressPage> {
        let body = self
            .get_json(
                "wallet-addresses",
                &[
                    ("wallet", wallet_id.to_string()),
                    ("from", offset.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;
        Ok(parse_wallet_addresses(&body))
    }
}

/// Parses an `address-lookup` response. Empty labels are treated as absent.
pub fn parse_lookup(body: &Value) -> WalletLookupResult {
    let found = body.get("found").and_then(Value::as_bool).unwrap_or(false);
    if !found {
        return WalletLookupResult::default();
    }

    WalletLookupResult {
        found,
        wallet_id: body
            .get("wallet_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        label: body
            .get("label")
            .and_then(Value::as_str)
            .filter(|label| !label.trim().is_empty())
            .map(str::to_string),
    }
}

/// Parses a `wallet` response; `None` when the provider reports the wallet
/// as not found.
pub fn parse_wallet_transactions(body: &Value) -> Option<WalletTxPage> {
    if body.get("found").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    let txs = body.get("txs")?.as_array()?;

    Some(WalletTxPage {
        txs: txs.iter().filter_map(parse_wallet_tx).collect(),
        txs_count: body.get("txs_count").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_wallet_tx(tx: &Value) -> Option<WalletTransaction> {
    let kind = match tx.get("type").and_then(Value::as_str) {
        Some("received") => WalletTxKind::Received,
        Some("sent") => WalletTxKind::Sent,
        _ => WalletTxKind::Other,
    };

    let outputs = tx
        .get("outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|output| {
                    Some(WalletTxOutput {
                        address: output.get("address")?.as_str()?.to_string(),
                        amount_btc: output.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(WalletTransaction {
        txid: tx.get("txid")?.as_str()?.to_string(),
        kind,
        amount_btc: tx.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
        outputs,
        wallet_id: tx
            .get("wallet_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    })
}

/// Parses a `wallet-addresses` response.
pub fn parse_wallet_addresses(body: &Value) -> WalletAddressPage {
    WalletAddressPage {
        addresses_count: body
            .get("addresses_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

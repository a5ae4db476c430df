//! # Blockchair Client
//!
//! Address dashboards and transaction detail from the Blockchair REST API.
//!
//! The address dashboard lists transactions newest first, so pagination stops
//! as soon as a transaction older than the requested start block shows up.
//! Every listed transaction needs a second request for its inputs and outputs;
//! those details are immutable once confirmed and are cached per txid for the
//! lifetime of the client.

use std::time::Duration;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use eyre::{eyre, Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::source::TransactionDataSource;
use crate::types::{AddressSummary, TransactionPage, TransactionSummary, TxOutput};

/// Blockchair Bitcoin API base URL.
pub const BLOCKCHAIR_BASE_URL: &str = "https://api.blockchair.com/bitcoin";

/// Maximum transactions Blockchair lists per dashboard page.
const PAGE_LIMIT: usize = 100;

/// Timestamp layout used by Blockchair (`YYYY-MM-DD HH:MM:SS`, UTC).
pub const BLOCKCHAIR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Transaction reference as listed on an address dashboard.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRef {
    /// Transaction hash.
    pub hash: String,
    /// Confirming block, `None` while unconfirmed.
    pub block_id: Option<u64>,
}

/// HTTP client for Blockchair dashboards.
pub struct BlockchairClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    tx_cache: DashMap<String, TransactionSummary>,
}

impl BlockchairClient {
    /// Creates a client against the public endpoint.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: BLOCKCHAIR_BASE_URL.to_string(),
            api_key,
            tx_cache: DashMap::new(),
        })
    }

    /// Points the client at a different base URL (mirrors, test servers).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = params.to_vec();
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .wrap_err_with(|| format!("Blockchair request to {path} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!(
                "Blockchair returned HTTP {} for {}: {}",
                status.as_u16(),
                path,
                body
            ));
        }

        response
            .json::<Value>()
            .await
            .wrap_err("failed to parse Blockchair response JSON")
    }

    /// Fetches balance and transaction count for `address`.
    ///
    /// # Errors
    /// Returns error on transport or HTTP failure.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_address_summary(&self, address: &str) -> Result<Option<AddressSummary>> {
        let body = self
            .get_json(&format!("dashboards/address/{address}"), &[])
            .await?;
        let summary = parse_address_summary(&body, address);
        if summary.is_some() {
            info!(address, "address summary fetched");
        }
        Ok(summary)
    }

    async fn fetch_address_page(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRef>> {
        debug!(address, offset, limit, "fetching address transaction page");
        let body = self
            .get_json(
                &format!("dashboards/address/{address}"),
                &[
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                    ("transaction_details", "true".to_string()),
                ],
            )
            .await?;
        Ok(parse_address_transactions(&body, address))
    }

    /// Fetches inputs, outputs and fee for one transaction, using the cache
    /// when possible.
    ///
    /// # Errors
    /// Returns error on transport or HTTP failure.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_transaction(&self, hash: &str) -> Result<Option<TransactionSummary>> {
        if let Some(cached) = self.tx_cache.get(hash) {
            debug!(hash, "transaction detail served from cache");
            return Ok(Some(cached.clone()));
        }

        let body = self
            .get_json(&format!("dashboards/transaction/{hash}"), &[])
            .await?;
        let detail = parse_transaction_detail(&body, hash);
        match &detail {
            Some(tx) => {
                self.tx_cache.insert(hash.to_string(), tx.clone());
            }
            None => warn!(hash, "no detail returned for transaction"),
        }
        Ok(detail)
    }

    /// Pages through the address dashboard collecting confirmed transactions
    /// at or after `start_block`, up to `max_records`.
    ///
    /// A failure after the first page keeps what was already collected and
    /// marks the page truncated, so callers see the history as incomplete.
    ///
    /// # Errors
    /// Returns error when the first dashboard page cannot be fetched.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> Result<TransactionPage> {
        let mut transactions: Vec<TransactionSummary> = Vec::new();
        let mut offset = 0usize;
        let mut incomplete = false;

        'pages: while offset < max_records {
            let limit = PAGE_LIMIT.min(max_records - offset);
            let refs = match self.fetch_address_page(address, offset, limit).await {
                Ok(refs) => refs,
                Err(e) if offset == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        address,
                        offset,
                        collected = transactions.len(),
                        error = %e,
                        "dashboard page failed, keeping partial history"
                    );
                    incomplete = true;
                    break;
                }
            };
            if refs.is_empty() {
                break;
            }

            let scan = scan_page(&refs, start_block);
            for hash in &scan.hashes {
                match self.fetch_transaction(hash).await {
                    Ok(Some(detail)) => transactions.push(detail),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            address,
                            hash = %hash,
                            collected = transactions.len(),
                            error = %e,
                            "transaction detail failed, keeping partial history"
                        );
                        incomplete = true;
                        break 'pages;
                    }
                }
                if transactions.len() >= max_records {
                    break 'pages;
                }
            }

            if scan.reached_older {
                debug!(address, start_block, "reached transactions older than start block");
                break;
            }
            if refs.len() < limit {
                break;
            }
            offset += limit;
        }

        transactions.sort_by_key(|tx| tx.block_height);
        let truncated = incomplete || transactions.len() >= max_records;
        info!(
            address,
            start_block,
            collected = transactions.len(),
            truncated,
            "transactions collected"
        );
        Ok(TransactionPage {
            transactions,
            truncated,
        })
    }
}

/// Hashes worth a detail request from one dashboard page.
#[derive(Debug, Default, PartialEq)]
pub struct PageScan {
    /// Confirmed transactions at or after the start block, in page order.
    pub hashes: Vec<String>,
    /// The page listed a transaction older than the start block; later pages
    /// are older still.
    pub reached_older: bool,
}

/// Walks a newest-first dashboard page: unconfirmed entries are skipped and
/// the walk stops at the first confirmed entry below `start_block`.
pub fn scan_page(refs: &[TxRef], start_block: u64) -> PageScan {
    let mut scan = PageScan::default();
    for tx_ref in refs {
        match tx_ref.block_id {
            None => debug!(hash = %tx_ref.hash, "skipping unconfirmed transaction"),
            Some(block_id) if block_id < start_block => {
                scan.reached_older = true;
                break;
            }
            Some(_) => scan.hashes.push(tx_ref.hash.clone()),
        }
    }
    scan
}

impl TransactionDataSource for BlockchairClient {
    async fn get_address_summary(&self, address: &str) -> Option<AddressSummary> {
        match self.fetch_address_summary(address).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(address, error = %e, "failed to fetch address summary");
                None
            }
        }
    }

    async fn get_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> TransactionPage {
        match self
            .fetch_transactions_from_block(address, start_block, max_records)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(address, start_block, error = %e, "failed to fetch transactions");
                TransactionPage::default()
            }
        }
    }
}

/// Parses `data.<address>.address` of an address dashboard.
pub fn parse_address_summary(body: &Value, address: &str) -> Option<AddressSummary> {
    let info = body.get("data")?.get(address)?.get("address")?;
    Some(AddressSummary {
        address: address.to_string(),
        balance_sat: info.get("balance").and_then(Value::as_i64).unwrap_or(0),
        tx_count: info
            .get("transaction_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

/// Parses the transaction list of an address dashboard requested with
/// `transaction_details=true`.
///
/// Unconfirmed transactions carry a negative `block_id` and map to `None`.
pub fn parse_address_transactions(body: &Value, address: &str) -> Vec<TxRef> {
    let Some(list) = body
        .get("data")
        .and_then(|data| data.get(address))
        .and_then(|entry| entry.get("transactions"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|item| {
            let hash = item.get("hash")?.as_str()?.to_string();
            let block_id = item
                .get("block_id")
                .and_then(Value::as_i64)
                .and_then(|id| u64::try_from(id).ok());
            Some(TxRef { hash, block_id })
        })
        .collect()
}

/// Parses `data.<hash>` of a transaction dashboard into a [`TransactionSummary`].
///
/// Returns `None` for unconfirmed transactions or malformed payloads.
pub fn parse_transaction_detail(body: &Value, hash: &str) -> Option<TransactionSummary> {
    let entry = body.get("data")?.get(hash)?;
    let tx = entry.get("transaction")?;

    let block_height = u64::try_from(tx.get("block_id")?.as_i64()?).ok()?;
    let timestamp = parse_blockchair_time(tx.get("time")?.as_str()?)?;
    let fee_sat = tx.get("fee").and_then(Value::as_u64).unwrap_or(0);

    let inputs = entry
        .get("inputs")
        .and_then(Value::as_array)
        .map(|inputs| {
            inputs
                .iter()
                .filter_map(|input| input.get("recipient")?.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let outputs = entry
        .get("outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|output| {
                    Some(TxOutput {
                        address: output.get("recipient")?.as_str()?.to_string(),
                        value_sat: output.get("value").and_then(Value::as_u64).unwrap_or(0),
                        value_usd: output.get("value_usd").and_then(Value::as_f64).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TransactionSummary {
        hash: hash.to_string(),
        block_height,
        timestamp,
        fee_sat,
        inputs,
        outputs,
    })
}

/// Parses a Blockchair UTC timestamp.
pub fn parse_blockchair_time(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, BLOCKCHAIR_TIME_FORMAT).ok()
}

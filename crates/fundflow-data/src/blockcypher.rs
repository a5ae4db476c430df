//! # BlockCypher Client
//!
//! Alternative [`TransactionDataSource`] backed by BlockCypher's address
//! endpoints. `/addrs/{addr}/full` returns transactions with inputs and
//! outputs inline, so a block-filtered history costs one request per 50
//! transactions instead of one per transaction.
//!
//! ## Rate Limits
//!
//! The free tier allows 3 requests per second. Calls are spaced at least
//! 340 ms apart by a client-side gate; a 429 is reported as an error without
//! retrying.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime};
use dashmap::DashMap;
use eyre::{eyre, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::source::TransactionDataSource;
use crate::types::{AddressSummary, TransactionPage, TransactionSummary, TxOutput};

/// BlockCypher Bitcoin mainnet base URL.
pub const BLOCKCYPHER_BASE_URL: &str = "https://api.blockcypher.com/v1/btc/main";

/// Minimum spacing between two requests.
const MIN_CALL_INTERVAL: Duration = Duration::from_millis(340);

/// Maximum transactions BlockCypher returns per `/full` request.
const FULL_PAGE_LIMIT: usize = 50;

/// HTTP client for BlockCypher with request spacing and a response cache.
pub struct BlockCypherClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    last_call: Mutex<Option<Instant>>,
    page_cache: DashMap<String, (Vec<TransactionSummary>, bool)>,
}

impl BlockCypherClient {
    /// Creates a client against the public endpoint.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: BLOCKCYPHER_BASE_URL.to_string(),
            token,
            last_call: Mutex::new(None),
            page_cache: DashMap::new(),
        })
    }

    /// Points the client at a different base URL.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn wait_for_rate_limit(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < MIN_CALL_INTERVAL {
                let wait = MIN_CALL_INTERVAL - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "rate limit: waiting");
                tokio::time::sleep(wait).await;
            }
        }
        *last_call = Some(Instant::now());
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        self.wait_for_rate_limit().await;

        let url = format!("{}/{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = params.to_vec();
        if let Some(token) = &self.token {
            query.push(("token", token.clone()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .wrap_err_with(|| format!("BlockCypher request to {path} failed"))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(path, "BlockCypher rate limit exceeded");
            return Err(eyre!("BlockCypher rate limit exceeded for {path}"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!(
                "BlockCypher returned HTTP {} for {}: {}",
                status.as_u16(),
                path,
                body
            ));
        }

        response
            .json::<Value>()
            .await
            .wrap_err("failed to parse BlockCypher response JSON")
    }

    /// Fetches balance and transaction count for `address`.
    ///
    /// # Errors
    /// Returns error on transport or HTTP failure.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_address_summary(&self, address: &str) -> Result<Option<AddressSummary>> {
        let body = self.get_json(&format!("addrs/{address}/balance"), &[]).await?;
        Ok(parse_balance(&body, address))
    }

    /// Fetches one page of full transactions strictly after block `after`
    /// and, when given, strictly below block `before`, newest first.
    async fn fetch_full_page(
        &self,
        address: &str,
        after: u64,
        before: Option<u64>,
    ) -> Result<(Vec<TransactionSummary>, bool)> {
        let cache_key = format!("{address}_{after}_{before:?}");
        if let Some(cached) = self.page_cache.get(&cache_key) {
            debug!(address, after, ?before, "full page served from cache");
            return Ok(cached.clone());
        }

        let mut params = vec![
            ("after", after.to_string()),
            ("limit", FULL_PAGE_LIMIT.to_string()),
        ];
        if let Some(before) = before {
            params.push(("before", before.to_string()));
        }

        let body = self
            .get_json(&format!("addrs/{address}/full"), &params)
            .await?;
        let page = parse_full_transactions(&body);
        self.page_cache.insert(cache_key, page.clone());
        Ok(page)
    }

    /// Collects confirmed transactions at or after `start_block`, paging
    /// backwards with `before` until exhausted or `max_records` is reached.
    ///
    /// A failure after the first page keeps what was already collected and
    /// marks the page truncated.
    ///
    /// # Errors
    /// Returns error when the first page cannot be fetched.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> Result<TransactionPage> {
        let after = start_block.saturating_sub(1);
        let mut before: Option<u64> = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut transactions: Vec<TransactionSummary> = Vec::new();
        let mut incomplete = false;

        loop {
            let (page, has_more) = match self.fetch_full_page(address, after, before).await {
                Ok(page) => page,
                Err(e) if before.is_none() => return Err(e),
                Err(e) => {
                    warn!(
                        address,
                        ?before,
                        collected = transactions.len(),
                        error = %e,
                        "full page failed, keeping partial history"
                    );
                    incomplete = true;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            let lowest = page.iter().map(|tx| tx.block_height).min();
            for tx in page {
                if tx.block_height < start_block || !seen.insert(tx.hash.clone()) {
                    continue;
                }
                transactions.push(tx);
                if transactions.len() >= max_records {
                    break;
                }
            }

            if !has_more || transactions.len() >= max_records {
                break;
            }
            match lowest.and_then(|lowest| next_before(lowest, before)) {
                Some(next) => before = Some(next),
                None => {
                    warn!(
                        address,
                        ?before,
                        "page limit filled by a single block, history cut short"
                    );
                    incomplete = true;
                    break;
                }
            }
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

/// Next `before` bound once a page bottomed out at block `lowest`.
///
/// `before` excludes its own height, so the bound sits one above `lowest`
/// and the next page repeats that block; the page limit may have cut it
/// short. Repeats are dropped by txid. `None` when the walk cannot advance.
pub fn next_before(lowest: u64, before: Option<u64>) -> Option<u64> {
    let next = lowest.saturating_add(1);
    (before != Some(next)).then_some(next)
}

impl TransactionDataSource for BlockCypherClient {
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

/// Parses an `/addrs/{addr}/balance` response.
pub fn parse_balance(body: &Value, address: &str) -> Option<AddressSummary> {
    let balance = body.get("balance")?.as_i64()?;
    Some(AddressSummary {
        address: address.to_string(),
        balance_sat: balance,
        tx_count: body.get("n_tx").and_then(Value::as_u64).unwrap_or(0),
    })
}

/// Parses an `/addrs/{addr}/full` response into confirmed transactions and
/// the `hasMore` flag.
pub fn parse_full_transactions(body: &Value) -> (Vec<TransactionSummary>, bool) {
    let has_more = body.get("hasMore").and_then(Value::as_bool).unwrap_or(false);
    let txs = body
        .get("txs")
        .and_then(Value::as_array)
        .map(|txs| txs.iter().filter_map(parse_full_tx).collect())
        .unwrap_or_default();
    (txs, has_more)
}

fn parse_full_tx(tx: &Value) -> Option<TransactionSummary> {
    let hash = tx.get("hash")?.as_str()?.to_string();
    let block_height = u64::try_from(tx.get("block_height")?.as_i64()?).ok()?;
    let timestamp = parse_blockcypher_time(tx.get("confirmed")?.as_str()?)?;

    let inputs = tx
        .get("inputs")
        .and_then(Value::as_array)
        .map(|inputs| inputs.iter().filter_map(first_address).collect())
        .unwrap_or_default();

    let outputs = tx
        .get("outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs
                .iter()
                .map(|output| TxOutput {
                    address: first_address(output).unwrap_or_else(|| {
                        output
                            .get("script_type")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string()
                    }),
                    value_sat: output.get("value").and_then(Value::as_u64).unwrap_or(0),
                    value_usd: 0.0,
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TransactionSummary {
        hash,
        block_height,
        timestamp,
        fee_sat: tx.get("fees").and_then(Value::as_u64).unwrap_or(0),
        inputs,
        outputs,
    })
}

fn first_address(entry: &Value) -> Option<String> {
    entry
        .get("addresses")?
        .as_array()?
        .first()?
        .as_str()
        .map(str::to_string)
}

/// Parses an RFC 3339 confirmation time into naive UTC.
pub fn parse_blockcypher_time(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc())
}

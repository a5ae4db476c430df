//! Shared test doubles and factories for the integration tests.
//!
//! `FakeSource` serves a fixed set of transactions; `FakeWallets` serves a
//! fixed cluster map. Both count the calls the tracer makes so tests can
//! assert on traversal and memoisation.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use eyre::{eyre, Result};
use fundflow_analysis::cache::ClassificationCache;
use fundflow_analysis::classify::ClusterClassifier;
use fundflow_analysis::config::TraceConfig;
use fundflow_analysis::tracer::FlowTracer;
use fundflow_data::source::{TransactionDataSource, WalletLookup};
use fundflow_data::types::{
    AddressSummary, TransactionPage, TransactionSummary, TxOutput, WalletAddressPage,
    WalletLookupResult, WalletTransaction, WalletTxPage, SAT_PER_BTC,
};

pub const SEED: &str = "1SeedXXXXXXXXXXXXXXXXXXXXXXXXXXXXX";
pub const START_BLOCK: u64 = 1000;

/// Converts whole-number hundredths of a BTC to satoshi, so test amounts stay exact.
pub fn centi_btc(hundredths: u64) -> u64 {
    hundredths * SAT_PER_BTC / 100
}

/// 2021-05-02 10:00:00 UTC plus one minute per block past `START_BLOCK`.
pub fn block_time(block: u64) -> NaiveDateTime {
    let base = NaiveDateTime::parse_from_str("2021-05-02 10:00:00", "%Y-%m-%d %H:%M:%S")
        .expect("valid timestamp");
    base + chrono::Duration::minutes(block.saturating_sub(START_BLOCK) as i64)
}

/// A confirmed transaction spending from `inputs` into `outputs`.
pub fn tx(
    hash: &str,
    block: u64,
    fee_sat: u64,
    inputs: &[&str],
    outputs: &[(&str, u64)],
) -> TransactionSummary {
    TransactionSummary {
        hash: hash.to_string(),
        block_height: block,
        timestamp: block_time(block),
        fee_sat,
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs
            .iter()
            .map(|(address, value_sat)| TxOutput {
                address: address.to_string(),
                value_sat: *value_sat,
                value_usd: 0.0,
            })
            .collect(),
    }
}

/// Funding transaction paying `value_sat` to `to` in `block`.
pub fn funding(to: &str, block: u64, value_sat: u64) -> TransactionSummary {
    tx(&format!("fund-{to}-{block}"), block, 0, &["1Funder"], &[(to, value_sat)])
}

/// In-memory chain. Every address that appears in a transaction has a
/// summary unless removed with [`FakeSource::without_summary`].
#[derive(Default)]
pub struct FakeSource {
    transactions: Vec<TransactionSummary>,
    missing_summaries: HashSet<String>,
    fetched: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(transactions: Vec<TransactionSummary>) -> Self {
        Self {
            transactions,
            ..Self::default()
        }
    }

    pub fn without_summary(mut self, address: &str) -> Self {
        self.missing_summaries.insert(address.to_string());
        self
    }

    /// Addresses whose transactions were requested, in request order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("lock not poisoned").clone()
    }

    fn touches(tx: &TransactionSummary, address: &str) -> bool {
        tx.has_input(address) || tx.outputs.iter().any(|o| o.address == address)
    }
}

impl TransactionDataSource for FakeSource {
    async fn get_address_summary(&self, address: &str) -> Option<AddressSummary> {
        if self.missing_summaries.contains(address) {
            return None;
        }
        let txs: Vec<&TransactionSummary> = self
            .transactions
            .iter()
            .filter(|tx| Self::touches(tx, address))
            .collect();
        if txs.is_empty() {
            return None;
        }
        let received: u64 = txs.iter().map(|tx| tx.received_by(address)).sum();
        Some(AddressSummary {
            address: address.to_string(),
            balance_sat: received as i64,
            tx_count: txs.len() as u64,
        })
    }

    async fn get_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> TransactionPage {
        self.fetched
            .lock()
            .expect("lock not poisoned")
            .push(address.to_string());

        let mut matching: Vec<TransactionSummary> = self
            .transactions
            .iter()
            .filter(|tx| tx.block_height >= start_block && Self::touches(tx, address))
            .cloned()
            .collect();
        matching.sort_by_key(|tx| tx.block_height);

        let truncated = matching.len() > max_records;
        matching.truncate(max_records);
        TransactionPage {
            transactions: matching,
            truncated,
        }
    }
}

/// In-memory cluster provider. Unknown addresses are unclustered.
#[derive(Default)]
pub struct FakeWallets {
    addresses: HashMap<String, WalletLookupResult>,
    pages: HashMap<String, (Vec<WalletTransaction>, u64, u64)>,
    failing: HashSet<String>,
    pub lookup_calls: AtomicUsize,
    pub page_calls: AtomicUsize,
}

impl FakeWallets {
    pub fn with_label(mut self, address: &str, wallet_id: &str, label: &str) -> Self {
        self.addresses.insert(
            address.to_string(),
            WalletLookupResult {
                found: true,
                wallet_id: Some(wallet_id.to_string()),
                label: Some(label.to_string()),
            },
        );
        self
    }

    /// Puts `address` in an unlabelled cluster with the given sampled history.
    pub fn with_cluster(
        mut self,
        address: &str,
        wallet_id: &str,
        txs: Vec<WalletTransaction>,
        txs_count: u64,
        addresses_count: u64,
    ) -> Self {
        self.addresses.insert(
            address.to_string(),
            WalletLookupResult {
                found: true,
                wallet_id: Some(wallet_id.to_string()),
                label: None,
            },
        );
        self.pages
            .insert(wallet_id.to_string(), (txs, txs_count, addresses_count));
        self
    }

    pub fn failing_for(mut self, address: &str) -> Self {
        self.failing.insert(address.to_string());
        self
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

impl WalletLookup for FakeWallets {
    async fn lookup(&self, address: &str) -> Result<WalletLookupResult> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(address) {
            return Err(eyre!("connection reset by peer"));
        }
        Ok(self.addresses.get(address).cloned().unwrap_or_default())
    }

    async fn get_wallet_transactions(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<Option<WalletTxPage>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages.get(wallet_id).map(|(txs, txs_count, _)| WalletTxPage {
            txs: txs
                .iter()
                .skip(offset as usize)
                .take(count as usize)
                .cloned()
                .collect(),
            txs_count: *txs_count,
        }))
    }

    async fn get_wallet_addresses(
        &self,
        wallet_id: &str,
        _offset: u32,
        _count: u32,
    ) -> Result<WalletAddressPage> {
        Ok(WalletAddressPage {
            addresses_count: self.pages.get(wallet_id).map_or(0, |(_, _, count)| *count),
        })
    }
}

/// Tracer over borrowed fakes so tests can inspect call counts afterwards.
pub fn tracer<'a>(
    source: &'a FakeSource,
    wallets: &'a FakeWallets,
    config: TraceConfig,
) -> FlowTracer<&'a FakeSource, &'a FakeWallets> {
    let classifier = ClusterClassifier::new(wallets, Arc::new(ClassificationCache::new()));
    FlowTracer::new(source, classifier, config).expect("test config is valid")
}

//! Heuristic cluster classification.
//!
//! An address is resolved to its owning wallet cluster through a
//! [`WalletLookup`]. Labelled clusters are categorised by keyword; unlabelled
//! ones by aggregate patterns over a bounded sample of their activity.
//!
//! # Accuracy
//! The pattern heuristics only see the first page (at most
//! [`WALLET_SAMPLE_SIZE`] transactions) of a cluster's history. Ratios and
//! means are estimates over that sample, not exact cluster statistics.

use std::collections::HashSet;
use std::sync::Arc;

use eyre::Result;
use fundflow_data::source::WalletLookup;
use fundflow_data::types::{ClusterType, WalletTransaction, WalletTxKind};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::ClassificationCache;

/// Page size used when sampling a cluster's transactions and addresses.
pub const WALLET_SAMPLE_SIZE: u32 = 100;

/// Keyword table for provider labels, in priority order. Keywords are
/// matched as lowercase substrings of the lowercased label.
pub const LABEL_MAPPINGS: [(ClusterType, &[&str]); 5] = [
    (
        ClusterType::Exchange,
        &[
            "binance", "coinbase", "kraken", "bitfinex", "bitstamp", "huobi", "okex", "bittrex",
            "poloniex",
        ],
    ),
    (
        ClusterType::Mining,
        &["pool", "f2pool", "antpool", "btc.com", "slushpool", "viabtc", "mining"],
    ),
    (
        ClusterType::Mixer,
        &["wasabi", "samourai", "chipmixer", "blender", "bitcoin fog", "coinjoinmess"],
    ),
    (ClusterType::Gambling, &["satoshidice", "primedice", "bustabit"]),
    (ClusterType::Darknet, &["silk road", "alphabay", "hydra"]),
];

/// Categorised, confidence-scored view of an address's cluster.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub cluster_type: ClusterType,
    pub wallet_id: Option<String>,
    /// Confidence score in [0, 1].
    pub confidence: f64,
    pub label: Option<String>,
    /// Free-text rationale for the decision.
    pub description: String,
}

impl ClassificationResult {
    fn new(
        cluster_type: ClusterType,
        confidence: f64,
        wallet_id: &str,
        description: String,
    ) -> Self {
        Self {
            cluster_type,
            wallet_id: Some(wallet_id.to_string()),
            confidence,
            label: None,
            description,
        }
    }

    fn unclustered() -> Self {
        Self {
            cluster_type: ClusterType::Unclustered,
            wallet_id: None,
            confidence: 0.0,
            label: None,
            description: "Address does not belong to any known cluster".to_string(),
        }
    }

    fn unknown(wallet_id: &str) -> Self {
        Self::new(
            ClusterType::Unknown,
            0.0,
            wallet_id,
            "Could not fetch cluster data".to_string(),
        )
    }

    fn error(message: &str) -> Self {
        Self {
            cluster_type: ClusterType::Error,
            wallet_id: None,
            confidence: 0.0,
            label: None,
            description: format!("Error: {message}"),
        }
    }
}

/// Sampled activity of one cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WalletSample {
    /// First page of the cluster's transactions.
    pub txs: Vec<WalletTransaction>,
    /// Total transactions reported by the provider.
    pub txs_count: u64,
    /// Total addresses reported by the provider.
    pub addresses_count: u64,
}

/// Aggregates computed over a [`WalletSample`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterMetrics {
    pub sampled: usize,
    pub received: usize,
    pub sent: usize,
    pub ratio_received: f64,
    /// Mean BTC amount of sampled sent transactions.
    pub mean_sent_btc: f64,
    /// Mean output count over sampled sent transactions that list outputs.
    pub mean_outputs_per_sent: f64,
    /// Distinct counterparty wallets across the sample.
    pub unique_wallets: usize,
}

impl ClusterMetrics {
    pub fn from_sample(txs: &[WalletTransaction]) -> Self {
        let sampled = txs.len();
        let received = txs
            .iter()
            .filter(|tx| tx.kind == WalletTxKind::Received)
            .count();
        let sent_txs: Vec<&WalletTransaction> = txs
            .iter()
            .filter(|tx| tx.kind == WalletTxKind::Sent)
            .collect();

        let ratio_received = if sampled > 0 {
            received as f64 / sampled as f64
        } else {
            0.0
        };

        let mean_sent_btc = if sent_txs.is_empty() {
            0.0
        } else {
            sent_txs.iter().map(|tx| tx.amount_btc).sum::<f64>() / sent_txs.len() as f64
        };

        let with_outputs: Vec<&&WalletTransaction> =
            sent_txs.iter().filter(|tx| !tx.outputs.is_empty()).collect();
        let mean_outputs_per_sent = if with_outputs.is_empty() {
            0.0
        } else {
            with_outputs.iter().map(|tx| tx.outputs.len()).sum::<usize>() as f64
                / with_outputs.len() as f64
        };

        let unique_wallets = txs
            .iter()
            .filter_map(|tx| tx.wallet_id.as_deref())
            .collect::<HashSet<&str>>()
            .len();

        Self {
            sampled,
            received,
            sent: sent_txs.len(),
            ratio_received,
            mean_sent_btc,
            mean_outputs_per_sent,
            unique_wallets,
        }
    }
}

/// Classifies a cluster from its provider label.
///
/// The first category of [`LABEL_MAPPINGS`] with a keyword contained in the
/// label wins. Unmatched labels still identify a known entity.
pub fn classify_label(wallet_id: &str, label: &str) -> ClassificationResult {
    let lowered = label.to_lowercase();

    let matched = LABEL_MAPPINGS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
        .map(|(cluster_type, _)| *cluster_type);

    let mut result = match matched {
        Some(cluster_type) => {
            info!(label, %cluster_type, "label mapped to category");
            ClassificationResult::new(
                cluster_type,
                0.95,
                wallet_id,
                format!("Identified by WalletExplorer: {label}"),
            )
        }
        None => {
            debug!(label, "label not mapped, classifying as labeled_entity");
            ClassificationResult::new(
                ClusterType::LabeledEntity,
                0.9,
                wallet_id,
                format!("Labeled entity: {label}"),
            )
        }
    };
    result.label = Some(label.to_string());
    result
}

/// Applies the pattern heuristics to an unlabelled cluster.
///
/// Rules are checked in priority order and the first match wins:
/// 1. no sampled transactions: `inactive` (0.9)
/// 2. mostly received, tiny sends, many counterparties, busy: `mixer` (0.75)
/// 3. huge address or transaction count: `exchange` (0.85)
/// 4. many outputs per send and frequent sends: `payout_service` (0.70)
/// 5. mostly sent and busy: `mining_or_consolidation` (0.65)
/// 6. medium address or transaction count: `entity` (0.50)
/// 7. otherwise: `personal_wallet` (0.60)
pub fn analyze_cluster_patterns(wallet_id: &str, sample: &WalletSample) -> ClassificationResult {
    let total_txs = sample.txs_count;
    let total_addresses = sample.addresses_count;

    if sample.txs.is_empty() {
        warn!(wallet_id, "cluster has no recorded transactions");
        return ClassificationResult::new(
            ClusterType::Inactive,
            0.9,
            wallet_id,
            "Cluster has no recorded transactions".to_string(),
        );
    }

    let m = ClusterMetrics::from_sample(&sample.txs);
    debug!(
        wallet_id,
        received = m.received,
        sent = m.sent,
        ratio_received = m.ratio_received,
        mean_outputs = m.mean_outputs_per_sent,
        unique_wallets = m.unique_wallets,
        mean_sent_btc = m.mean_sent_btc,
        "cluster metrics"
    );

    if m.ratio_received > 0.7 && m.mean_sent_btc < 0.01 && m.unique_wallets > 50 && total_txs > 500
    {
        return ClassificationResult::new(
            ClusterType::Mixer,
            0.75,
            wallet_id,
            format!(
                "Mixer pattern: {:.1}% received, {} wallets",
                m.ratio_received * 100.0,
                m.unique_wallets
            ),
        );
    }

    if total_addresses > 50_000 || total_txs > 10_000 {
        return ClassificationResult::new(
            ClusterType::Exchange,
            0.85,
            wallet_id,
            format!("Very large cluster: {total_addresses} addresses, {total_txs} txs"),
        );
    }

    if m.mean_outputs_per_sent > 10.0 && m.sent > 20 {
        return ClassificationResult::new(
            ClusterType::PayoutService,
            0.70,
            wallet_id,
            format!(
                "Payout pattern: avg {:.1} outputs/tx",
                m.mean_outputs_per_sent
            ),
        );
    }

    if m.ratio_received < 0.3 && total_txs > 100 {
        return ClassificationResult::new(
            ClusterType::MiningOrConsolidation,
            0.65,
            wallet_id,
            format!("Mining pattern: {:.1}% received", m.ratio_received * 100.0),
        );
    }

    if total_addresses > 50 || total_txs > 100 {
        return ClassificationResult::new(
            ClusterType::Entity,
            0.50,
            wallet_id,
            format!("Entity with {total_addresses} addresses, {total_txs} txs"),
        );
    }

    ClassificationResult::new(
        ClusterType::PersonalWallet,
        0.60,
        wallet_id,
        format!("Small cluster: {total_addresses} addresses, {total_txs} txs"),
    )
}

/// Resolves addresses to clusters and classifies them, memoising per wallet.
pub struct ClusterClassifier<W> {
    lookup: W,
    cache: Arc<ClassificationCache>,
}

impl<W: WalletLookup> ClusterClassifier<W> {
    pub fn new(lookup: W, cache: Arc<ClassificationCache>) -> Self {
        Self { lookup, cache }
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    /// Classifies the cluster owning `address`.
    ///
    /// Never fails: lookup errors become an `error` result, which is not
    /// memoised.
    pub async fn classify(&self, address: &str) -> ClassificationResult {
        match self.try_classify(address).await {
            Ok(result) => result,
            Err(err) => {
                error!(address, error = %err, "classification failed");
                ClassificationResult::error(&format!("{err:#}"))
            }
        }
    }

    /// Classifies an unlabelled cluster by wallet id.
    pub async fn classify_cluster(&self, wallet_id: &str) -> ClassificationResult {
        match self.try_classify_cluster(wallet_id).await {
            Ok(result) => result,
            Err(err) => {
                error!(wallet_id, error = %err, "cluster classification failed");
                ClassificationResult::error(&format!("{err:#}"))
            }
        }
    }

    async fn try_classify(&self, address: &str) -> Result<ClassificationResult> {
        let lookup = self.lookup.lookup(address).await?;

        let wallet_id = match lookup.wallet_id {
            Some(wallet_id) if lookup.found => wallet_id,
            _ => {
                warn!(address, "address does not belong to any known cluster");
                return Ok(ClassificationResult::unclustered());
            }
        };

        if let Some(cached) = self.cache.get(&wallet_id) {
            debug!(address, wallet_id = %wallet_id, "classification served from cache");
            return Ok(cached);
        }

        match lookup.label {
            Some(label) => {
                let result = classify_label(&wallet_id, &label);
                Ok(self.cache.insert_if_absent(&wallet_id, result))
            }
            None => self.try_classify_cluster(&wallet_id).await,
        }
    }

    async fn try_classify_cluster(&self, wallet_id: &str) -> Result<ClassificationResult> {
        if let Some(cached) = self.cache.get(wallet_id) {
            info!(wallet_id, "cluster classification served from cache");
            return Ok(cached);
        }

        let Some(page) = self
            .lookup
            .get_wallet_transactions(wallet_id, 0, WALLET_SAMPLE_SIZE)
            .await?
        else {
            warn!(wallet_id, "no transaction data for cluster");
            return Ok(ClassificationResult::unknown(wallet_id));
        };

        let addresses = self
            .lookup
            .get_wallet_addresses(wallet_id, 0, WALLET_SAMPLE_SIZE)
            .await?;

        let sample = WalletSample {
            txs: page.txs,
            txs_count: page.txs_count,
            addresses_count: addresses.addresses_count,
        };
        let result = analyze_cluster_patterns(wallet_id, &sample);
        info!(
            wallet_id,
            cluster_type = %result.cluster_type,
            confidence = result.confidence,
            "cluster classified"
        );
        Ok(self.cache.insert_if_absent(wallet_id, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use eyre::eyre;
    use fundflow_data::types::{
        WalletAddressPage, WalletLookupResult, WalletTxOutput, WalletTxPage,
    };

    fn wallet_tx(
        kind: WalletTxKind,
        amount_btc: f64,
        outputs: usize,
        wallet_id: Option<&str>,
    ) -> WalletTransaction {
        WalletTransaction {
            txid: format!("tx-{amount_btc}"),
            kind,
            amount_btc,
            outputs: (0..outputs)
                .map(|i| WalletTxOutput {
                    address: format!("1Out{i}"),
                    amount_btc: 0.001,
                })
                .collect(),
            wallet_id: wallet_id.map(str::to_string),
        }
    }

    fn sample(txs: Vec<WalletTransaction>, txs_count: u64, addresses_count: u64) -> WalletSample {
        WalletSample {
            txs,
            txs_count,
            addresses_count,
        }
    }

    #[derive(Default)]
    struct FakeWallets {
        lookups: HashMap<String, WalletLookupResult>,
        pages: HashMap<String, WalletTxPage>,
        address_counts: HashMap<String, u64>,
        failing: HashSet<String>,
        page_calls: AtomicUsize,
    }

    impl FakeWallets {
        fn with_address(mut self, address: &str, wallet_id: &str, label: Option<&str>) -> Self {
            self.lookups.insert(
                address.to_string(),
                WalletLookupResult {
                    found: true,
                    wallet_id: Some(wallet_id.to_string()),
                    label: label.map(str::to_string),
                },
            );
            self
        }

        fn with_page(
            mut self,
            wallet_id: &str,
            txs: Vec<WalletTransaction>,
            txs_count: u64,
            addresses: u64,
        ) -> Self {
            self.pages
                .insert(wallet_id.to_string(), WalletTxPage { txs, txs_count });
            self.address_counts.insert(wallet_id.to_string(), addresses);
            self
        }
    }

    impl WalletLookup for FakeWallets {
        async fn lookup(&self, address: &str) -> Result<WalletLookupResult> {
            if self.failing.contains(address) {
                return Err(eyre!("connection reset"));
            }
            Ok(self.lookups.get(address).cloned().unwrap_or_default())
        }

        async fn get_wallet_transactions(
            &self,
            wallet_id: &str,
            _offset: u32,
            _count: u32,
        ) -> Result<Option<WalletTxPage>> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(wallet_id).cloned())
        }

        async fn get_wallet_addresses(
            &self,
            wallet_id: &str,
            _offset: u32,
            _count: u32,
        ) -> Result<WalletAddressPage> {
            Ok(WalletAddressPage {
                addresses_count: self.address_counts.get(wallet_id).copied().unwrap_or(0),
            })
        }
    }

    fn classifier(wallets: FakeWallets) -> ClusterClassifier<FakeWallets> {
        ClusterClassifier::new(wallets, Arc::new(ClassificationCache::new()))
    }

    #[test]
    fn label_matching_is_case_insensitive_substring() {
        let result = classify_label("w1", "Binance Cold Wallet 2");
        assert_eq!(result.cluster_type, ClusterType::Exchange);
        assert!((result.confidence - 0.95).abs() < 1e-12);
        assert_eq!(result.label.as_deref(), Some("Binance Cold Wallet 2"));

        assert_eq!(classify_label("w", "ViaBTC.com").cluster_type, ClusterType::Mining);
        assert_eq!(classify_label("w", "CoinJoinMess").cluster_type, ClusterType::Mixer);
        assert_eq!(classify_label("w", "SatoshiDice.com").cluster_type, ClusterType::Gambling);
        assert_eq!(classify_label("w", "AlphaBayMarket").cluster_type, ClusterType::Darknet);
    }

    #[test]
    fn earlier_category_wins_when_keywords_overlap() {
        // "pool" (mining) and "poloniex" (exchange) both match; exchange is first.
        assert_eq!(
            classify_label("w", "Poloniex pool").cluster_type,
            ClusterType::Exchange
        );
    }

    #[test]
    fn unmatched_label_is_labeled_entity() {
        let result = classify_label("w1", "LocalBitcoins.com-old");
        assert_eq!(result.cluster_type, ClusterType::LabeledEntity);
        assert!((result.confidence - 0.9).abs() < 1e-12);
        assert_eq!(result.description, "Labeled entity: LocalBitcoins.com-old");
    }

    #[test]
    fn empty_sample_is_inactive_regardless_of_totals() {
        let result = analyze_cluster_patterns("w1", &sample(vec![], 999_999, 999_999));
        assert_eq!(result.cluster_type, ClusterType::Inactive);
        assert!((result.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn mixer_pattern() {
        let mut txs: Vec<WalletTransaction> = (0..80)
            .map(|i| wallet_tx(WalletTxKind::Received, 0.5, 0, Some(&format!("peer{i}"))))
            .collect();
        txs.extend((0..20).map(|_| wallet_tx(WalletTxKind::Sent, 0.005, 2, None)));

        let result = analyze_cluster_patterns("w1", &sample(txs, 600, 80_000));
        assert_eq!(result.cluster_type, ClusterType::Mixer);
        assert_eq!(result.description, "Mixer pattern: 80.0% received, 80 wallets");
    }

    #[test]
    fn exchange_pattern_by_size() {
        let txs = vec![wallet_tx(WalletTxKind::Received, 1.0, 0, None)];
        let by_addresses = analyze_cluster_patterns("w1", &sample(txs.clone(), 10, 50_001));
        assert_eq!(by_addresses.cluster_type, ClusterType::Exchange);

        let by_txs = analyze_cluster_patterns("w1", &sample(txs, 10_001, 3));
        assert_eq!(by_txs.cluster_type, ClusterType::Exchange);
        assert_eq!(by_txs.description, "Very large cluster: 3 addresses, 10001 txs");
    }

    #[test]
    fn payout_pattern() {
        let mut txs: Vec<WalletTransaction> = (0..25)
            .map(|_| wallet_tx(WalletTxKind::Sent, 1.0, 12, None))
            .collect();
        txs.extend((0..25).map(|_| wallet_tx(WalletTxKind::Received, 1.0, 0, None)));

        let result = analyze_cluster_patterns("w1", &sample(txs, 50, 10));
        assert_eq!(result.cluster_type, ClusterType::PayoutService);
        assert!((result.confidence - 0.70).abs() < 1e-12);
    }

    #[test]
    fn mining_or_consolidation_pattern() {
        let mut txs: Vec<WalletTransaction> = (0..8)
            .map(|_| wallet_tx(WalletTxKind::Sent, 1.0, 1, None))
            .collect();
        txs.extend((0..2).map(|_| wallet_tx(WalletTxKind::Received, 1.0, 0, None)));

        let result = analyze_cluster_patterns("w1", &sample(txs, 101, 10));
        assert_eq!(result.cluster_type, ClusterType::MiningOrConsolidation);
    }

    #[test]
    fn entity_and_personal_wallet_fallbacks() {
        let balanced = vec![
            wallet_tx(WalletTxKind::Received, 1.0, 0, None),
            wallet_tx(WalletTxKind::Sent, 1.0, 1, None),
        ];

        let entity = analyze_cluster_patterns("w1", &sample(balanced.clone(), 20, 51));
        assert_eq!(entity.cluster_type, ClusterType::Entity);

        let personal = analyze_cluster_patterns("w1", &sample(balanced, 20, 3));
        assert_eq!(personal.cluster_type, ClusterType::PersonalWallet);
        assert!((personal.confidence - 0.60).abs() < 1e-12);
        assert_eq!(personal.description, "Small cluster: 3 addresses, 20 txs");
    }

    #[test]
    fn metrics_ignore_sends_without_outputs() {
        let txs = vec![
            wallet_tx(WalletTxKind::Sent, 0.2, 4, Some("a")),
            wallet_tx(WalletTxKind::Sent, 0.4, 0, Some("a")),
            wallet_tx(WalletTxKind::Received, 1.0, 0, Some("b")),
            wallet_tx(WalletTxKind::Other, 0.0, 0, None),
        ];
        let m = ClusterMetrics::from_sample(&txs);
        assert_eq!(m.sampled, 4);
        assert_eq!(m.sent, 2);
        assert_eq!(m.received, 1);
        assert!((m.ratio_received - 0.25).abs() < 1e-12);
        assert!((m.mean_sent_btc - 0.3).abs() < 1e-12);
        assert!((m.mean_outputs_per_sent - 4.0).abs() < 1e-12);
        assert_eq!(m.unique_wallets, 2);
    }

    #[tokio::test]
    async fn unknown_address_is_unclustered() {
        let result = classifier(FakeWallets::default()).classify("1Nobody").await;
        assert_eq!(result.cluster_type, ClusterType::Unclustered);
        assert_eq!(result.confidence, 0.0);
        assert!(result.wallet_id.is_none());
    }

    #[tokio::test]
    async fn wallet_memo_is_shared_across_addresses() {
        let wallets = FakeWallets::default()
            .with_address("1A", "w1", Some("Binance"))
            .with_address("1B", "w1", Some("Some Forum"));
        let classifier = classifier(wallets);

        let first = classifier.classify("1A").await;
        let second = classifier.classify("1B").await;
        assert_eq!(first.cluster_type, ClusterType::Exchange);
        assert_eq!(second, first);
        assert_eq!(classifier.cache().len(), 1);
    }

    #[tokio::test]
    async fn unlabelled_cluster_is_sampled_once() {
        let wallets = FakeWallets::default()
            .with_address("1A", "w2", None)
            .with_address("1B", "w2", None)
            .with_page("w2", vec![wallet_tx(WalletTxKind::Received, 1.0, 0, None)], 3, 2);
        let classifier = classifier(wallets);

        let first = classifier.classify("1A").await;
        let second = classifier.classify("1B").await;
        let direct = classifier.classify_cluster("w2").await;

        assert_eq!(first.cluster_type, ClusterType::PersonalWallet);
        assert_eq!(second, first);
        assert_eq!(direct, first);
        assert_eq!(classifier.lookup.page_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classify_cluster_on_empty_history_is_inactive() {
        let wallets = FakeWallets::default().with_page("w3", vec![], 0, 12);
        let result = classifier(wallets).classify_cluster("w3").await;
        assert_eq!(result.cluster_type, ClusterType::Inactive);
        assert!((result.confidence - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_wallet_data_is_unknown_and_not_memoised() {
        let classifier = classifier(FakeWallets::default().with_address("1A", "w4", None));
        let result = classifier.classify("1A").await;
        assert_eq!(result.cluster_type, ClusterType::Unknown);
        assert_eq!(result.wallet_id.as_deref(), Some("w4"));
        assert!(classifier.cache().is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_becomes_error_result() {
        let mut wallets = FakeWallets::default();
        wallets.failing.insert("1Broken".to_string());
        let classifier = classifier(wallets);

        let result = classifier.classify("1Broken").await;
        assert_eq!(result.cluster_type, ClusterType::Error);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.description, "Error: connection reset");
        assert!(classifier.cache().is_empty());
    }
}

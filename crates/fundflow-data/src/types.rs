//! Type definitions for chain data, wallet lookups and the fund-flow ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use eyre::{eyre, Report};
use serde::{Deserialize, Serialize};

/// Satoshis in one bitcoin.
pub const SAT_PER_BTC: u64 = 100_000_000;

/// Converts a satoshi amount to BTC.
pub fn sat_to_btc(sat: u64) -> f64 {
    sat as f64 / SAT_PER_BTC as f64
}

/// Balance and activity summary for one address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressSummary {
    /// Address the summary belongs to.
    pub address: String,
    /// Confirmed balance in satoshi.
    pub balance_sat: i64,
    /// Total number of transactions touching the address.
    pub tx_count: u64,
}

/// One output of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Recipient address (or a script-type placeholder for non-standard outputs).
    pub address: String,
    /// Output value in satoshi.
    pub value_sat: u64,
    /// Output value in USD at confirmation time, when the provider reports it.
    pub value_usd: f64,
}

impl TxOutput {
    /// Output value in BTC.
    pub fn value_btc(&self) -> f64 {
        sat_to_btc(self.value_sat)
    }
}

/// Confirmed transaction with the detail needed for flow allocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Transaction hash.
    pub hash: String,
    /// Height of the confirming block.
    pub block_height: u64,
    /// Confirmation time in UTC.
    pub timestamp: NaiveDateTime,
    /// Fee paid in satoshi.
    pub fee_sat: u64,
    /// Addresses spending into the transaction.
    pub inputs: Vec<String>,
    /// Outputs in transaction order.
    pub outputs: Vec<TxOutput>,
}

impl TransactionSummary {
    /// True if `address` is one of the spending inputs.
    pub fn has_input(&self, address: &str) -> bool {
        self.inputs.iter().any(|input| input == address)
    }

    /// Total satoshi paid to `address` by this transaction.
    pub fn received_by(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter(|output| output.address == address)
            .map(|output| output.value_sat)
            .sum()
    }

    /// Total USD value paid to `address` by this transaction.
    pub fn received_usd_by(&self, address: &str) -> f64 {
        self.outputs
            .iter()
            .filter(|output| output.address == address)
            .map(|output| output.value_usd)
            .sum()
    }

    /// Sum of all output values in satoshi.
    pub fn total_output_sat(&self) -> u64 {
        self.outputs.iter().map(|output| output.value_sat).sum()
    }
}

/// Transactions returned for one address, filtered by block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionPage {
    /// Transactions at or after the requested start block.
    pub transactions: Vec<TransactionSummary>,
    /// True when the record cap was reached and older activity may be missing.
    pub truncated: bool,
}

/// Result of resolving an address to its owning wallet cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletLookupResult {
    /// Whether the provider knows a cluster for the address.
    pub found: bool,
    /// Cluster identifier.
    pub wallet_id: Option<String>,
    /// Human label attached to the cluster, if any.
    pub label: Option<String>,
}

/// Direction of a wallet-level transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTxKind {
    /// Funds entered the wallet.
    Received,
    /// Funds left the wallet.
    Sent,
    /// Any other provider tag (e.g. internal moves).
    Other,
}

/// Output of a wallet-level sent transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletTxOutput {
    /// Receiving address.
    pub address: String,
    /// Amount in BTC.
    pub amount_btc: f64,
}

/// Transaction as seen from a wallet cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Transaction hash.
    pub txid: String,
    /// Whether the wallet received or sent.
    pub kind: WalletTxKind,
    /// Amount moved in BTC.
    pub amount_btc: f64,
    /// Outputs (populated for sent transactions).
    pub outputs: Vec<WalletTxOutput>,
    /// Counterparty wallet, when the provider resolves one.
    pub wallet_id: Option<String>,
}

/// One page of a wallet's transaction history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletTxPage {
    /// Sampled transactions (bounded by the page size).
    pub txs: Vec<WalletTransaction>,
    /// Total transaction count of the wallet.
    pub txs_count: u64,
}

/// Address-count information for a wallet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletAddressPage {
    /// Total number of addresses in the cluster.
    pub addresses_count: u64,
}

/// Category assigned to a wallet cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Exchange,
    Mining,
    Mixer,
    Gambling,
    Darknet,
    LabeledEntity,
    Inactive,
    PayoutService,
    MiningOrConsolidation,
    Entity,
    PersonalWallet,
    Unclustered,
    Unknown,
    Error,
}

impl ClusterType {
    /// Every category, in declaration order.
    pub const ALL: [ClusterType; 14] = [
        ClusterType::Exchange,
        ClusterType::Mining,
        ClusterType::Mixer,
        ClusterType::Gambling,
        ClusterType::Darknet,
        ClusterType::LabeledEntity,
        ClusterType::Inactive,
        ClusterType::PayoutService,
        ClusterType::MiningOrConsolidation,
        ClusterType::Entity,
        ClusterType::PersonalWallet,
        ClusterType::Unclustered,
        ClusterType::Unknown,
        ClusterType::Error,
    ];

    /// Stable snake_case tag used in CSV, SQLite and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Exchange => "exchange",
            ClusterType::Mining => "mining",
            ClusterType::Mixer => "mixer",
            ClusterType::Gambling => "gambling",
            ClusterType::Darknet => "darknet",
            ClusterType::LabeledEntity => "labeled_entity",
            ClusterType::Inactive => "inactive",
            ClusterType::PayoutService => "payout_service",
            ClusterType::MiningOrConsolidation => "mining_or_consolidation",
            ClusterType::Entity => "entity",
            ClusterType::PersonalWallet => "personal_wallet",
            ClusterType::Unclustered => "unclustered",
            ClusterType::Unknown => "unknown",
            ClusterType::Error => "error",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ClusterType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| eyre!("unknown cluster category '{s}'"))
    }
}

/// Direction of a ledger movement relative to the traced case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementType {
    #[serde(rename = "OUT")]
    Out,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Out => "OUT",
        }
    }
}

impl FromStr for MovementType {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUT" => Ok(MovementType::Out),
            other => Err(eyre!("unknown movement type '{other}'")),
        }
    }
}

/// One edge of the traced flow: a followed or rejected candidate output.
///
/// Records are produced once by the tracer and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundFlowRecord {
    /// Root address of the case.
    pub seed_case: String,
    /// Lineage identifier of the path this edge belongs to.
    pub path_id: u64,
    /// Hop number of the sending address (1 = root).
    pub hop: u32,
    /// Whether traversal continued into `output`.
    pub follow: bool,
    /// Sending address.
    pub input: String,
    /// Receiving address.
    pub output: String,
    /// Cluster of the receiving address.
    pub wallet_id: Option<String>,
    /// Category of the receiving cluster.
    pub wallet_classification: ClusterType,
    /// Provider label of the receiving cluster.
    pub wallet_label: String,
    /// Transaction carrying the movement.
    pub txid: String,
    /// Confirmation time in the reporting timezone.
    pub event_time: Option<DateTime<FixedOffset>>,
    /// Movement direction.
    pub mov_type: MovementType,
    /// BTC moved on this edge.
    pub btc: f64,
    /// Free-text movement classification.
    pub classification: String,
    /// Reserved; always zero.
    pub btc_added_to_flow_from_others: f64,
    /// BTC left untraced at this hop because it was below threshold.
    pub btc_not_followed: f64,
    /// Stop reason or other remarks.
    pub notes: String,
}

//! Depth-first fund-flow traversal.
//!
//! Starting from a seed address and the block it received the funds in, the
//! tracer allocates each address's spending with [`OutputAllocator`],
//! classifies every followed recipient and keeps descending until a path
//! reaches the hop limit or a stop-listed cluster.
//!
//! ## Case total
//! The amount the seed received in exactly `start_block` is fixed once, when
//! the root frame is expanded, and is the denominator of every threshold test
//! at every depth. Funds the seed received in later blocks are deliberately
//! left out: the case tracks the amount in play at the block of interest.
//!
//! ## Traversal
//! Frames live on an explicit stack. Children of a frame are pushed in reverse
//! rank order so the largest output is explored first, matching a recursive
//! depth-first walk without growing the call stack.

use std::collections::HashSet;

use fundflow_data::source::{TransactionDataSource, WalletLookup};
use fundflow_data::types::{
    sat_to_btc, ClusterType, FundFlowRecord, MovementType, TransactionSummary, SAT_PER_BTC,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::allocator::{OutputAllocator, OutputCandidate};
use crate::classify::ClusterClassifier;
use crate::config::{PathNumbering, TraceConfig};

/// Frozen parameters of one trace.
///
/// Built once from the root frame; nothing can change it afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CaseContext {
    root_address: String,
    start_block: u64,
    case_total_sat: u64,
    threshold: f64,
    max_hops: u32,
    stop_list: HashSet<ClusterType>,
}

impl CaseContext {
    fn new(
        root_address: &str,
        start_block: u64,
        case_total_sat: u64,
        config: &TraceConfig,
    ) -> Self {
        Self {
            root_address: root_address.to_string(),
            start_block,
            case_total_sat,
            threshold: config.threshold,
            max_hops: config.max_hops,
            stop_list: config.stop_list.clone(),
        }
    }

    pub fn root_address(&self) -> &str {
        &self.root_address
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    pub fn case_total_sat(&self) -> u64 {
        self.case_total_sat
    }

    pub fn case_total_btc(&self) -> f64 {
        sat_to_btc(self.case_total_sat)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    pub fn stops_at(&self, cluster_type: ClusterType) -> bool {
        self.stop_list.contains(&cluster_type)
    }
}

/// One address waiting to be expanded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraversalFrame {
    pub address: String,
    /// Hop of this address, 1 for the seed.
    pub hop: u32,
    pub path_id: u64,
    /// Inclusive lower bound of the transactions considered.
    pub start_block: u64,
    /// Pool this hop is accountable for, in satoshi.
    pub inbound_sat: u64,
}

/// Hands out path ids when a hop branches.
#[derive(Clone, Debug)]
pub struct PathAllocator {
    mode: PathNumbering,
    last_issued: u64,
}

impl PathAllocator {
    pub fn new(mode: PathNumbering) -> Self {
        Self {
            mode,
            last_issued: 0,
        }
    }

    /// Path id for the followed output at `rank` of a frame on `parent`.
    /// Rank 0 always continues the parent path.
    pub fn child_path(&mut self, parent: u64, rank: usize) -> u64 {
        if rank == 0 {
            return parent;
        }
        match self.mode {
            PathNumbering::Offset => parent + rank as u64,
            PathNumbering::Global => {
                self.last_issued += 1;
                self.last_issued
            }
        }
    }
}

/// Raised when an address fetch hit the transaction cap and may be missing
/// activity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompletenessWarning {
    pub address: String,
    pub hop: u32,
    pub path_id: u64,
    pub max_records: usize,
}

/// An output spent after its hop's pool was exhausted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AfterFlowEntry {
    pub path_id: u64,
    pub hop: u32,
    /// Spending address.
    pub input: String,
    pub tx_hash: String,
    pub recipient: String,
    pub btc: f64,
    pub block_height: u64,
}

impl AfterFlowEntry {
    fn new(frame: &TraversalFrame, candidate: &OutputCandidate) -> Self {
        Self {
            path_id: frame.path_id,
            hop: frame.hop,
            input: frame.address.clone(),
            tx_hash: candidate.tx_hash.clone(),
            recipient: candidate.recipient.clone(),
            btc: candidate.value_btc(),
            block_height: candidate.block_height,
        }
    }
}

/// Everything one trace produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TraceReport {
    pub root_address: String,
    pub start_block: u64,
    /// Case total fixed at hop 1; zero when the seed could not be expanded.
    pub case_total_btc: f64,
    /// Ledger rows in discovery order.
    pub records: Vec<FundFlowRecord>,
    pub warnings: Vec<CompletenessWarning>,
    pub after_flow: Vec<AfterFlowEntry>,
}

impl TraceReport {
    /// Records ordered by path, then hop.
    pub fn sorted_records(&self) -> Vec<FundFlowRecord> {
        let mut records = self.records.clone();
        records.sort_by(|a, b| a.path_id.cmp(&b.path_id).then(a.hop.cmp(&b.hop)));
        records
    }

    pub fn followed_count(&self) -> usize {
        self.records.iter().filter(|r| r.follow).count()
    }

    pub fn max_hop(&self) -> u32 {
        self.records.iter().map(|r| r.hop).max().unwrap_or(0)
    }
}

/// Walks the flow of funds out of a seed address.
pub struct FlowTracer<S, W> {
    source: S,
    classifier: ClusterClassifier<W>,
    config: TraceConfig,
    allocator: OutputAllocator,
}

impl<S: TransactionDataSource, W: WalletLookup> FlowTracer<S, W> {
    /// Creates a tracer after validating `config`.
    ///
    /// # Errors
    /// Returns error if the configuration is out of range.
    pub fn new(
        source: S,
        classifier: ClusterClassifier<W>,
        config: TraceConfig,
    ) -> eyre::Result<Self> {
        config.validate()?;
        let allocator = OutputAllocator::new(config.threshold, config.timezone);
        Ok(Self {
            source,
            classifier,
            config,
            allocator,
        })
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ClusterClassifier<W> {
        &self.classifier
    }

    /// Traces the funds `root_address` received in `start_block`.
    ///
    /// Never fails: unavailable data ends the affected branch and the rest of
    /// the trace carries on.
    #[tracing::instrument(skip(self))]
    pub async fn trace(&self, root_address: &str, start_block: u64) -> TraceReport {
        let mut report = TraceReport {
            root_address: root_address.to_string(),
            start_block,
            ..TraceReport::default()
        };

        let mut root = TraversalFrame {
            address: root_address.to_string(),
            hop: 1,
            path_id: 0,
            start_block,
            inbound_sat: 0,
        };

        let Some(root_txs) = self.fetch_frame(&root, &mut report).await else {
            warn!(root_address, "seed address could not be expanded");
            return report;
        };

        let case = CaseContext::new(
            root_address,
            start_block,
            case_total_received(&root_txs, root_address, start_block),
            &self.config,
        );
        report.case_total_btc = case.case_total_btc();
        info!(
            root_address,
            start_block,
            case_total_btc = case.case_total_btc(),
            case_total_usd = case_total_received_usd(&root_txs, root_address, start_block),
            "case total fixed"
        );
        if case.case_total_sat() == 0 {
            warn!(
                root_address,
                start_block,
                "seed received nothing in the start block, nothing to follow"
            );
        }
        root.inbound_sat = case.case_total_sat();

        let mut paths = PathAllocator::new(self.config.path_numbering);
        let mut stack = self.expand(&case, &root, &root_txs, &mut paths, &mut report).await;
        stack.reverse();

        while let Some(frame) = stack.pop() {
            let Some(txs) = self.fetch_frame(&frame, &mut report).await else {
                continue;
            };
            let mut children = self.expand(&case, &frame, &txs, &mut paths, &mut report).await;
            children.reverse();
            stack.extend(children);
        }

        info!(
            root_address,
            records = report.records.len(),
            followed = report.followed_count(),
            warnings = report.warnings.len(),
            "trace complete"
        );
        report
    }

    /// Fetches the summary and transactions of a frame's address. `None`
    /// ends the branch.
    async fn fetch_frame(
        &self,
        frame: &TraversalFrame,
        report: &mut TraceReport,
    ) -> Option<Vec<TransactionSummary>> {
        info!(path = frame.path_id, hop = frame.hop, address = %frame.address, "tracing address");

        let Some(summary) = self.source.get_address_summary(&frame.address).await else {
            warn!(
                path = frame.path_id,
                hop = frame.hop,
                address = %frame.address,
                "address summary unavailable"
            );
            return None;
        };
        debug!(
            address = %frame.address,
            balance_btc = summary.balance_sat as f64 / SAT_PER_BTC as f64,
            tx_count = summary.tx_count,
            "address summary"
        );

        let page = self
            .source
            .get_transactions_from_block(&frame.address, frame.start_block, self.config.max_records)
            .await;

        if page.truncated {
            warn!(
                path = frame.path_id,
                hop = frame.hop,
                address = %frame.address,
                max_records = self.config.max_records,
                "transaction cap reached, activity may be incomplete"
            );
            report.warnings.push(CompletenessWarning {
                address: frame.address.clone(),
                hop: frame.hop,
                path_id: frame.path_id,
                max_records: self.config.max_records,
            });
        }

        if page.transactions.is_empty() {
            warn!(
                path = frame.path_id,
                hop = frame.hop,
                address = %frame.address,
                start_block = frame.start_block,
                "no transactions after start block"
            );
            return None;
        }

        Some(page.transactions)
    }

    /// Allocates a frame's spending, records every followed edge and returns
    /// the child frames to explore, in rank order.
    async fn expand(
        &self,
        case: &CaseContext,
        frame: &TraversalFrame,
        transactions: &[TransactionSummary],
        paths: &mut PathAllocator,
        report: &mut TraceReport,
    ) -> Vec<TraversalFrame> {
        let allocation = self.allocator.allocate(
            transactions,
            &frame.address,
            case.case_total_sat(),
            frame.inbound_sat,
        );
        let btc_not_followed = allocation.below_threshold_btc();

        info!(
            path = frame.path_id,
            hop = frame.hop,
            followed = allocation.followed.len(),
            after_flow = allocation.after_flow.len(),
            btc_not_followed,
            "hop allocated"
        );

        report.after_flow.extend(
            allocation
                .after_flow
                .iter()
                .map(|candidate| AfterFlowEntry::new(frame, candidate)),
        );

        let mut children = Vec::new();
        for (rank, candidate) in allocation.followed.iter().enumerate() {
            let child_path = paths.child_path(frame.path_id, rank);
            let classification = self.classifier.classify(&candidate.recipient).await;
            info!(
                path = frame.path_id,
                hop = frame.hop,
                recipient = %candidate.recipient,
                cluster_type = %classification.cluster_type,
                confidence = classification.confidence,
                "recipient classified"
            );

            let within_hops = frame.hop < case.max_hops();
            let stop_listed = case.stops_at(classification.cluster_type);
            let follow = within_hops && !stop_listed;

            let notes = if follow {
                String::new()
            } else if stop_listed {
                format!("not followed: {}", classification.cluster_type)
            } else {
                "not followed: max hops reached".to_string()
            };

            if follow {
                info!(
                    path = child_path,
                    hop = frame.hop,
                    recipient = %candidate.recipient,
                    btc = candidate.value_btc(),
                    tx = %candidate.tx_hash,
                    from_block = candidate.block_height,
                    "following output"
                );
                children.push(TraversalFrame {
                    address: candidate.recipient.clone(),
                    hop: frame.hop + 1,
                    path_id: child_path,
                    start_block: candidate.block_height,
                    inbound_sat: candidate.value_sat,
                });
            } else {
                info!(
                    path = child_path,
                    hop = frame.hop,
                    recipient = %candidate.recipient,
                    reason = %notes,
                    "path stops"
                );
            }

            report.records.push(FundFlowRecord {
                seed_case: case.root_address().to_string(),
                path_id: child_path,
                hop: frame.hop,
                follow,
                input: frame.address.clone(),
                output: candidate.recipient.clone(),
                wallet_id: classification.wallet_id,
                wallet_classification: classification.cluster_type,
                wallet_label: classification.label.unwrap_or_default(),
                txid: candidate.tx_hash.clone(),
                event_time: Some(candidate.event_time),
                mov_type: MovementType::Out,
                btc: candidate.value_btc(),
                classification: String::new(),
                btc_added_to_flow_from_others: 0.0,
                btc_not_followed,
                notes,
            });
        }

        children
    }
}

/// Satoshi paid to `address` by transactions confirmed exactly in
/// `start_block`.
pub fn case_total_received(
    transactions: &[TransactionSummary],
    address: &str,
    start_block: u64,
) -> u64 {
    transactions
        .iter()
        .filter(|tx| tx.block_height == start_block)
        .map(|tx| tx.received_by(address))
        .sum()
}

/// USD value at confirmation of the same receipts as [`case_total_received`].
pub fn case_total_received_usd(
    transactions: &[TransactionSummary],
    address: &str,
    start_block: u64,
) -> f64 {
    transactions
        .iter()
        .filter(|tx| tx.block_height == start_block)
        .map(|tx| tx.received_usd_by(address))
        .sum()
}

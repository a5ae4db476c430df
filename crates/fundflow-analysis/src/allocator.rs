//! Per-hop output allocation.
//!
//! Incoming value at an address is treated as a fungible pool that is drained
//! by the address's outgoing transactions in block order. Every output of a
//! transaction spending from the address lands in exactly one bucket:
//!
//! - **followed**: inside the pool and above the threshold fraction of the
//!   case total, so a traversal candidate;
//! - **below threshold**: inside the pool but too small to follow, only
//!   summed;
//! - **after flow**: spent once the pool was already exhausted, kept for audit
//!   and never followed.
//!
//! Fees of spending transactions drain the pool before their outputs count.
//! Once the pool is exhausted it stays exhausted for the rest of the hop.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use fundflow_data::types::{sat_to_btc, TransactionSummary};
use tracing::debug;

/// One output of a spending transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputCandidate {
    pub tx_hash: String,
    pub recipient: String,
    pub value_sat: u64,
    pub value_usd: f64,
    /// Block the spending transaction confirmed in.
    pub block_height: u64,
    /// Confirmation time in the reporting timezone.
    pub event_time: DateTime<FixedOffset>,
}

impl OutputCandidate {
    pub fn value_btc(&self) -> f64 {
        sat_to_btc(self.value_sat)
    }
}

/// Result of allocating one hop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Allocation {
    /// Followed outputs, descending by value.
    pub followed: Vec<OutputCandidate>,
    /// Outputs inside the pool that did not pass the threshold.
    pub below_threshold: Vec<OutputCandidate>,
    /// Outputs spent after the pool was exhausted, in block order.
    pub after_flow: Vec<OutputCandidate>,
    /// Fees of the spending transactions.
    pub fees_sat: u64,
}

impl Allocation {
    pub fn below_threshold_sat(&self) -> u64 {
        self.below_threshold.iter().map(|c| c.value_sat).sum()
    }

    /// BTC left untraced at this hop because it was below threshold.
    pub fn below_threshold_btc(&self) -> f64 {
        sat_to_btc(self.below_threshold_sat())
    }

    pub fn followed_sat(&self) -> u64 {
        self.followed.iter().map(|c| c.value_sat).sum()
    }

    pub fn after_flow_sat(&self) -> u64 {
        self.after_flow.iter().map(|c| c.value_sat).sum()
    }

    /// Sum of every allocated output, whatever its bucket.
    pub fn total_sat(&self) -> u64 {
        self.followed_sat() + self.below_threshold_sat() + self.after_flow_sat()
    }
}

/// Splits a hop's outgoing value into followed, below-threshold and
/// after-flow buckets.
#[derive(Clone, Debug)]
pub struct OutputAllocator {
    threshold: f64,
    timezone: Tz,
}

impl OutputAllocator {
    pub fn new(threshold: f64, timezone: Tz) -> Self {
        Self {
            threshold,
            timezone,
        }
    }

    /// Allocates every output of the transactions in which `address` is an
    /// input.
    ///
    /// `case_total_sat` is the denominator of every threshold test and
    /// `inbound_sat` is the size of the pool this hop is accountable for.
    /// When `case_total_sat` is zero nothing can be compared against the
    /// threshold and every output is placed in `after_flow`.
    pub fn allocate(
        &self,
        transactions: &[TransactionSummary],
        address: &str,
        case_total_sat: u64,
        inbound_sat: u64,
    ) -> Allocation {
        let mut ordered: Vec<&TransactionSummary> = transactions.iter().collect();
        ordered.sort_by_key(|tx| tx.block_height);

        let mut allocation = Allocation::default();
        let mut tally_sat: u64 = 0;
        let mut exhausted = case_total_sat == 0;

        for tx in ordered.into_iter().filter(|tx| tx.has_input(address)) {
            allocation.fees_sat += tx.fee_sat;
            let event_time = self.localize(tx.timestamp);
            let bound = i128::from(inbound_sat) - i128::from(allocation.fees_sat);

            for output in &tx.outputs {
                let candidate = OutputCandidate {
                    tx_hash: tx.hash.clone(),
                    recipient: output.address.clone(),
                    value_sat: output.value_sat,
                    value_usd: output.value_usd,
                    block_height: tx.block_height,
                    event_time,
                };

                if !exhausted && i128::from(tally_sat) > bound {
                    debug!(
                        tx = %tx.hash,
                        tally_btc = sat_to_btc(tally_sat),
                        "pool exhausted, remaining outputs are after-flow"
                    );
                    exhausted = true;
                }

                if exhausted {
                    debug!(
                        recipient = %candidate.recipient,
                        btc = candidate.value_btc(),
                        "after-flow output"
                    );
                    allocation.after_flow.push(candidate);
                    continue;
                }

                let ratio = output.value_sat as f64 / case_total_sat as f64;
                if ratio > self.threshold {
                    debug!(
                        recipient = %candidate.recipient,
                        btc = candidate.value_btc(),
                        ratio,
                        "output followed"
                    );
                    allocation.followed.push(candidate);
                } else {
                    debug!(
                        recipient = %candidate.recipient,
                        btc = candidate.value_btc(),
                        ratio,
                        "output below threshold"
                    );
                    allocation.below_threshold.push(candidate);
                }
                tally_sat += output.value_sat;
            }
        }

        allocation
            .followed
            .sort_by(|a, b| b.value_sat.cmp(&a.value_sat));
        allocation
    }

    fn localize(&self, utc: NaiveDateTime) -> DateTime<FixedOffset> {
        self.timezone.from_utc_datetime(&utc).fixed_offset()
    }
}

//! Benchmarks for the per-hop output allocator.
//!
//! Uses synthetic in-memory transactions (no provider calls).
//! Run with: `cargo bench --package fundflow-analysis`

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fundflow_analysis::allocator::OutputAllocator;
use fundflow_data::types::{TransactionSummary, TxOutput};

const TRACKED: &str = "1TrackedAddress";

/// Generates `count` spending transactions with `outputs` outputs each, in
/// shuffled block order.
fn sample_txs(count: u64, outputs: u64) -> Vec<TransactionSummary> {
    let timestamp = NaiveDateTime::parse_from_str("2021-05-02 10:00:00", "%Y-%m-%d %H:%M:%S")
        .unwrap_or_default();
    (0..count)
        .map(|i| TransactionSummary {
            hash: format!("{:064x}", i),
            block_height: 700_000 + (i * 7919) % count,
            timestamp,
            fee_sat: 1_000,
            inputs: vec![TRACKED.to_string()],
            outputs: (0..outputs)
                .map(|o| TxOutput {
                    address: format!("1Out{i}x{o}"),
                    value_sat: 100_000 + (o * 37_000) % 5_000_000,
                    value_usd: 0.0,
                })
                .collect(),
        })
        .collect()
}

/// Benchmark: allocate a full page of 100 transactions with 10 outputs each.
fn bench_allocate_100_txs(c: &mut Criterion) {
    let allocator = OutputAllocator::new(0.05, Tz::CET);
    let txs = sample_txs(100, 10);

    c.bench_function("allocate_100_txs", |b| {
        b.iter(|| {
            allocator.allocate(
                black_box(&txs),
                black_box(TRACKED),
                black_box(10_000_000),
                black_box(50_000_000),
            )
        })
    });
}

/// Benchmark: a single wide payout transaction.
fn bench_allocate_wide_tx(c: &mut Criterion) {
    let allocator = OutputAllocator::new(0.01, Tz::UTC);
    let txs = sample_txs(1, 2_000);

    c.bench_function("allocate_wide_tx", |b| {
        b.iter(|| {
            allocator.allocate(
                black_box(&txs),
                black_box(TRACKED),
                black_box(1_000_000_000),
                black_box(1_000_000_000),
            )
        })
    });
}

criterion_group!(benches, bench_allocate_100_txs, bench_allocate_wide_tx);
criterion_main!(benches);

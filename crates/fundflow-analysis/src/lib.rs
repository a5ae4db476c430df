//! fundflow-analysis crate
//!
//! Fund-flow tracing: per-hop output allocation, cluster classification,
//! the depth-first tracer, and the CSV and graph outputs built from its
//! ledger.

pub mod allocator;
pub mod cache;
pub mod classify;
pub mod config;
pub mod export;
pub mod flow_graph;
pub mod tracer;

pub use allocator::{Allocation, OutputAllocator, OutputCandidate};
pub use cache::ClassificationCache;
pub use classify::{ClassificationResult, ClusterClassifier};
pub use config::{PathNumbering, TraceConfig};
pub use tracer::{FlowTracer, TraceReport};

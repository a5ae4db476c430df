//! fundflow-data crate
//!
//! Wire types, collaborator traits, provider clients and the SQLite trace
//! cache shared by the analysis crate and the CLI.

pub mod blockchair;
pub mod blockcypher;
pub mod source;
pub mod store;
pub mod types;
pub mod walletexplorer;

#[cfg(test)]
mod test_support;

pub use source::{TransactionDataSource, WalletLookup};
pub use types::{
    AddressSummary, ClusterType, FundFlowRecord, MovementType, TransactionPage,
    TransactionSummary, TxOutput, WalletLookupResult,
};

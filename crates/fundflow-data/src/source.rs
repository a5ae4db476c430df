//! Collaborator seams consumed by the tracer and the cluster classifier.
//!
//! Provider clients implement these traits; tests substitute in-memory fakes.
//! `TransactionDataSource` implementations swallow their own transport and
//! parse failures (logging them) and report "nothing usable" instead, while
//! `WalletLookup` failures are returned so the classifier can turn them into
//! an `error` classification.

use eyre::Result;

use crate::types::{
    AddressSummary, TransactionPage, WalletAddressPage, WalletLookupResult, WalletTxPage,
};

/// Supplies address summaries and block-filtered transaction detail.
#[allow(async_fn_in_trait)]
pub trait TransactionDataSource {
    /// Balance and transaction count, or `None` when the address is unknown
    /// or the provider failed.
    async fn get_address_summary(&self, address: &str) -> Option<AddressSummary>;

    /// Up to `max_records` confirmed transactions at or after `start_block`.
    ///
    /// `truncated` is set when the cap was reached.
    async fn get_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> TransactionPage;
}

/// Resolves addresses to wallet clusters and samples cluster activity.
#[allow(async_fn_in_trait)]
pub trait WalletLookup {
    /// Cluster membership for `address`.
    async fn lookup(&self, address: &str) -> Result<WalletLookupResult>;

    /// Page of the wallet's transaction history; `None` when the provider has
    /// no data for the wallet.
    async fn get_wallet_transactions(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<Option<WalletTxPage>>;

    /// Address count of the wallet.
    async fn get_wallet_addresses(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<WalletAddressPage>;
}

impl<T: TransactionDataSource + ?Sized> TransactionDataSource for &T {
    async fn get_address_summary(&self, address: &str) -> Option<AddressSummary> {
        (**self).get_address_summary(address).await
    }

    async fn get_transactions_from_block(
        &self,
        address: &str,
        start_block: u64,
        max_records: usize,
    ) -> TransactionPage {
        (**self)
            .get_transactions_from_block(address, start_block, max_records)
            .await
    }
}

impl<T: WalletLookup + ?Sized> WalletLookup for &T {
    async fn lookup(&self, address: &str) -> Result<WalletLookupResult> {
        (**self).lookup(address).await
    }

    async fn get_wallet_transactions(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<Option<WalletTxPage>> {
        (**self).get_wallet_transactions(wallet_id, offset, count).await
    }

    async fn get_wallet_addresses(
        &self,
        wallet_id: &str,
        offset: u32,
        count: u32,
    ) -> Result<WalletAddressPage> {
        (**self).get_wallet_addresses(wallet_id, offset, count).await
    }
}

//! Per-wallet classification memo.

use dashmap::DashMap;

use crate::classify::ClassificationResult;

/// Wallet id to classification map shared by every classify call of a
/// session.
///
/// An entry is written at most once: later inserts for the same wallet are
/// ignored and the first result keeps being served.
#[derive(Debug, Default)]
pub struct ClassificationCache {
    entries: DashMap<String, ClassificationResult>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, wallet_id: &str) -> Option<ClassificationResult> {
        self.entries.get(wallet_id).map(|entry| entry.value().clone())
    }

    /// Stores `result` unless the wallet already has an entry, and returns
    /// whichever result is now cached.
    pub fn insert_if_absent(
        &self,
        wallet_id: &str,
        result: ClassificationResult,
    ) -> ClassificationResult {
        self.entries
            .entry(wallet_id.to_string())
            .or_insert(result)
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

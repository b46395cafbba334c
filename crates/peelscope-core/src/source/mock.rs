use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Script, Txid};

use crate::error::CoreError;
use crate::types::{BlockHeight, ResolvedTransaction, SourceTier};

use super::TransactionSource;

/// A call observed by a [`MockSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Fetch(Txid),
    BlockHeight(BlockHash),
    FindSpender(OutPoint),
    Probe,
}

/// An in-memory [`TransactionSource`] for tests. Serves canned data from
/// maps populated via the builder, records every call, and can be switched
/// offline at runtime.
pub struct MockSource {
    tier: SourceTier,
    transactions: HashMap<Txid, ResolvedTransaction>,
    spends: HashMap<OutPoint, Txid>,
    block_heights: HashMap<BlockHash, BlockHeight>,
    available: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
}

impl MockSource {
    pub fn builder(tier: SourceTier) -> MockSourceBuilder {
        MockSourceBuilder {
            tier,
            transactions: HashMap::new(),
            spends: HashMap::new(),
            block_heights: HashMap::new(),
            available: true,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: MockCall) -> Result<(), CoreError> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::SourceUnavailable {
                tier: self.tier,
                detail: "mock source offline".to_owned(),
            })
        }
    }
}

pub struct MockSourceBuilder {
    tier: SourceTier,
    transactions: HashMap<Txid, ResolvedTransaction>,
    spends: HashMap<OutPoint, Txid>,
    block_heights: HashMap<BlockHash, BlockHeight>,
    available: bool,
}

impl MockSourceBuilder {
    pub fn with_tx(mut self, tx: ResolvedTransaction) -> Self {
        self.transactions.insert(tx.txid, tx);
        self
    }

    pub fn with_spend(mut self, outpoint: OutPoint, spender: Txid) -> Self {
        self.spends.insert(outpoint, spender);
        self
    }

    pub fn with_block_height(mut self, hash: BlockHash, height: u32) -> Self {
        self.block_heights.insert(hash, BlockHeight(height));
        self
    }

    pub fn offline(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn build(self) -> MockSource {
        MockSource {
            tier: self.tier,
            transactions: self.transactions,
            spends: self.spends,
            block_heights: self.block_heights,
            available: AtomicBool::new(self.available),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TransactionSource for MockSource {
    fn tier(&self) -> SourceTier {
        self.tier
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_transaction(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        self.record(MockCall::Fetch(*txid))?;
        self.transactions
            .get(txid)
            .cloned()
            .ok_or(CoreError::TxNotFound(*txid))
    }

    async fn fetch_block_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError> {
        self.record(MockCall::BlockHeight(*block_hash))?;
        Ok(self.block_heights.get(block_hash).copied())
    }

    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
        _script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        self.record(MockCall::FindSpender(*outpoint))?;
        Ok(self.spends.get(outpoint).copied())
    }

    async fn probe(&self) -> Result<(), CoreError> {
        self.record(MockCall::Probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{make_outputs, make_tx, txid_from_byte};

    #[tokio::test]
    async fn offline_mock_fails_as_unavailable_and_still_records() {
        let txid = txid_from_byte(1);
        let source = MockSource::builder(SourceTier::Primary)
            .with_tx(make_tx(txid, Vec::new(), make_outputs(&[5])))
            .offline()
            .build();

        let err = source.fetch_transaction(&txid).await.expect_err("offline");
        assert!(err.is_unavailable());

        source.set_available(true);
        assert!(source.fetch_transaction(&txid).await.is_ok());
        assert_eq!(source.count(|c| matches!(c, MockCall::Fetch(_))), 2);
    }

    #[tokio::test]
    async fn unknown_tx_is_not_found() {
        let source = MockSource::builder(SourceTier::Tertiary).build();
        let err = source
            .fetch_transaction(&txid_from_byte(9))
            .await
            .expect_err("empty mock");
        assert!(err.is_not_found());
    }
}

//! Graph store contract: persisted transactions and the outpoints they
//! create and spend.
//!
//! The orchestrator reads from the store before touching the network, and
//! the CLI writes resolved transactions into it. [`MemoryGraphStore`] is
//! the bundled implementation.

mod jsonl;
mod memory;

pub use memory::MemoryGraphStore;

use async_trait::async_trait;
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{BlockHeight, ResolvedInput, ResolvedOutput, ResolvedTransaction};

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<StoredTransaction>, CoreError>;

    /// Recorded spend edge of `outpoint`, if the store knows one.
    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<Txid>, CoreError>;

    /// Insert or update a transaction, the outpoints it creates, and the
    /// spend marks on the outpoints it consumes.
    async fn put_transaction(&self, tx: &ResolvedTransaction) -> Result<(), CoreError>;

    /// Remove the transaction node only. Returns whether it existed.
    async fn delete_transaction(&self, txid: &Txid) -> Result<bool, CoreError>;

    /// Remove one outpoint node. Returns whether it existed.
    async fn delete_outpoint(&self, outpoint: &OutPoint) -> Result<bool, CoreError>;

    /// Remove the transaction together with every outpoint it spends or
    /// creates. Returns whether the transaction existed.
    async fn delete_transaction_and_outpoints(&self, txid: &Txid) -> Result<bool, CoreError>;
}

// ==============================================================================
// Outpoint Ids
// ==============================================================================

/// `"<txid>:<vout>"`.
pub fn outpoint_id(outpoint: &OutPoint) -> String {
    outpoint.to_string()
}

/// Id used for the synthetic input of a coinbase transaction.
pub fn coinbase_input_id(txid: &Txid) -> String {
    format!("coinbase:{txid}")
}

pub fn parse_outpoint_id(id: &str) -> Result<OutPoint, CoreError> {
    id.parse()
        .map_err(|e| CoreError::InvalidTxData(format!("invalid outpoint id `{id}`: {e}")))
}

// ==============================================================================
// Stored Records
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInput {
    pub outpoint_id: String,
    /// `None` for the coinbase input.
    pub prevout: Option<OutPoint>,
    pub value: Option<Amount>,
    pub address: Option<String>,
    pub creation_time: Option<u64>,
    pub days_held: Option<i64>,
    pub coin_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub outpoint_id: String,
    pub index: u32,
    pub value: Option<Amount>,
    pub address: Option<String>,
    pub script_pub_key: Option<ScriptBuf>,
    pub is_spent: bool,
    pub spending_txid: Option<Txid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub txid: Txid,
    pub observed_time: Option<u64>,
    pub block_hash: Option<BlockHash>,
    pub block_height: Option<BlockHeight>,
    pub coinbase: bool,
    pub input_value_total: Option<Amount>,
    pub inputs: Vec<StoredInput>,
    pub outputs: Vec<StoredOutput>,
}

impl StoredTransaction {
    /// Complete records can be served without touching the network: every
    /// non-coinbase input has a value, there is at least one output, and
    /// every output has a value.
    pub fn is_complete(&self) -> bool {
        let inputs_valued = self
            .inputs
            .iter()
            .all(|input| input.prevout.is_none() || input.value.is_some());
        let outputs_valued =
            !self.outputs.is_empty() && self.outputs.iter().all(|o| o.value.is_some());
        inputs_valued && outputs_valued
    }

    /// The resolved view, `None` if the record is incomplete.
    pub fn to_resolved(&self) -> Option<ResolvedTransaction> {
        if !self.is_complete() {
            return None;
        }
        let inputs = self
            .inputs
            .iter()
            .map(|input| ResolvedInput {
                prevout: input.prevout,
                value: input.value,
                address: input.address.clone(),
                creation_time: input.creation_time,
            })
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|output| {
                Some(ResolvedOutput {
                    index: output.index,
                    value: output.value?,
                    address: output.address.clone(),
                    script_pub_key: output.script_pub_key.clone(),
                    is_spent: output.is_spent,
                    spending_txid: output.spending_txid,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(ResolvedTransaction {
            txid: self.txid,
            observed_time: self.observed_time,
            block_hash: self.block_hash,
            block_height: self.block_height,
            input_value_total: self.input_value_total,
            inputs,
            outputs,
        })
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::metrics::days_between;
use crate::types::ResolvedTransaction;

use super::jsonl::{export_snapshot, parse_snapshot, OutpointRecord, TxRecord};
use super::{
    coinbase_input_id, outpoint_id, GraphStore, StoredInput, StoredOutput, StoredTransaction,
};

#[derive(Default)]
struct Graph {
    transactions: HashMap<Txid, TxRecord>,
    outpoints: HashMap<OutPoint, OutpointRecord>,
}

/// In-memory transaction/outpoint graph.
///
/// When opened with a snapshot path, every mutation rewrites the JSONL
/// snapshot before returning.
pub struct MemoryGraphStore {
    graph: RwLock<Graph>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            snapshot_path: None,
        }
    }

    /// Load `path` if it exists, and persist to it from then on.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let graph = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let snapshot = parse_snapshot(&content)?;
                info!(
                    path = %path.display(),
                    transactions = snapshot.transactions.len(),
                    outpoints = snapshot.outpoints.len(),
                    "graph store loaded"
                );
                Graph {
                    transactions: snapshot.transactions,
                    outpoints: snapshot.outpoints,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Graph::default(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        Ok(Self {
            graph: RwLock::new(graph),
            snapshot_path: Some(path),
        })
    }

    pub async fn transaction_count(&self) -> usize {
        self.graph.read().await.transactions.len()
    }

    fn persist(&self, graph: &Graph) -> Result<(), CoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let content = export_snapshot(&graph.transactions, &graph.outpoints)?;
        write_atomically(path, &content)?;
        debug!(path = %path.display(), bytes = content.len(), "graph store snapshot written");
        Ok(())
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_atomically(path: &Path, content: &str) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn stored_view(graph: &Graph, tx: &TxRecord) -> StoredTransaction {
    let inputs = tx
        .inputs
        .iter()
        .map(|prevout| {
            let Some(prevout) = prevout else {
                return StoredInput {
                    outpoint_id: coinbase_input_id(&tx.txid),
                    prevout: None,
                    value: None,
                    address: None,
                    creation_time: None,
                    days_held: None,
                    coin_days: None,
                };
            };
            let record = graph.outpoints.get(prevout);
            let value = record.and_then(|r| r.value);
            let creation_time = record.and_then(|r| r.creation_time);
            let days_held = creation_time
                .zip(tx.observed_time)
                .map(|(created, spent)| days_between(created, spent));
            let coin_days = value
                .zip(days_held)
                .map(|(value, days)| value.to_btc() * days as f64);
            StoredInput {
                outpoint_id: outpoint_id(prevout),
                prevout: Some(*prevout),
                value,
                address: record.and_then(|r| r.address.clone()),
                creation_time,
                days_held,
                coin_days,
            }
        })
        .collect();

    let outputs = tx
        .outputs
        .iter()
        .map(|&index| {
            let outpoint = OutPoint::new(tx.txid, index);
            let record = graph.outpoints.get(&outpoint);
            StoredOutput {
                outpoint_id: outpoint_id(&outpoint),
                index,
                value: record.and_then(|r| r.value),
                address: record.and_then(|r| r.address.clone()),
                script_pub_key: record.and_then(|r| r.script_pub_key.clone()),
                is_spent: record.is_some_and(|r| r.is_spent),
                spending_txid: record.and_then(|r| r.spending_txid),
            }
        })
        .collect();

    StoredTransaction {
        txid: tx.txid,
        observed_time: tx.observed_time,
        block_hash: tx.block_hash,
        block_height: tx.block_height,
        coinbase: tx.coinbase,
        input_value_total: tx.input_value_total,
        inputs,
        outputs,
    }
}

fn blank_outpoint(outpoint: OutPoint) -> OutpointRecord {
    OutpointRecord {
        outpoint,
        value: None,
        address: None,
        script_pub_key: None,
        creation_time: None,
        is_spent: false,
        spending_txid: None,
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<StoredTransaction>, CoreError> {
        let graph = self.graph.read().await;
        Ok(graph.transactions.get(txid).map(|tx| stored_view(&graph, tx)))
    }

    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
    ) -> Result<Option<Txid>, CoreError> {
        let graph = self.graph.read().await;
        Ok(graph.outpoints.get(outpoint).and_then(|r| r.spending_txid))
    }

    async fn put_transaction(&self, tx: &ResolvedTransaction) -> Result<(), CoreError> {
        let mut graph = self.graph.write().await;

        for input in &tx.inputs {
            let Some(prevout) = input.prevout else {
                continue;
            };
            let record = graph
                .outpoints
                .entry(prevout)
                .or_insert_with(|| blank_outpoint(prevout));
            record.is_spent = true;
            record.spending_txid = Some(tx.txid);
            if input.value.is_some() {
                record.value = input.value;
            }
            if input.address.is_some() {
                record.address.clone_from(&input.address);
            }
            if input.creation_time.is_some() {
                record.creation_time = input.creation_time;
            }
        }

        for output in &tx.outputs {
            let outpoint = OutPoint::new(tx.txid, output.index);
            let record = graph
                .outpoints
                .entry(outpoint)
                .or_insert_with(|| blank_outpoint(outpoint));
            record.value = Some(output.value);
            record.address.clone_from(&output.address);
            if output.script_pub_key.is_some() {
                record.script_pub_key.clone_from(&output.script_pub_key);
            }
            record.creation_time = tx.observed_time;
            // A spend learned earlier (from the spender's own insertion)
            // is kept even when the source reports the output unspent.
            if output.is_spent {
                record.is_spent = true;
            }
            if output.spending_txid.is_some() {
                record.spending_txid = output.spending_txid;
            }
        }

        graph.transactions.insert(
            tx.txid,
            TxRecord {
                txid: tx.txid,
                observed_time: tx.observed_time,
                block_hash: tx.block_hash,
                block_height: tx.block_height,
                coinbase: tx.is_coinbase(),
                input_value_total: tx.input_value_total,
                inputs: tx.inputs.iter().map(|i| i.prevout).collect(),
                outputs: tx.outputs.iter().map(|o| o.index).collect(),
            },
        );
        debug!(txid = %tx.txid, inputs = tx.inputs.len(), outputs = tx.outputs.len(), "stored transaction");
        self.persist(&graph)
    }

    async fn delete_transaction(&self, txid: &Txid) -> Result<bool, CoreError> {
        let mut graph = self.graph.write().await;
        let existed = graph.transactions.remove(txid).is_some();
        if existed {
            self.persist(&graph)?;
        }
        Ok(existed)
    }

    async fn delete_outpoint(&self, outpoint: &OutPoint) -> Result<bool, CoreError> {
        let mut graph = self.graph.write().await;
        let existed = graph.outpoints.remove(outpoint).is_some();
        if existed {
            self.persist(&graph)?;
        }
        Ok(existed)
    }

    async fn delete_transaction_and_outpoints(&self, txid: &Txid) -> Result<bool, CoreError> {
        let mut graph = self.graph.write().await;
        let Some(tx) = graph.transactions.remove(txid) else {
            return Ok(false);
        };
        for prevout in tx.inputs.iter().flatten() {
            graph.outpoints.remove(prevout);
        }
        for index in &tx.outputs {
            graph.outpoints.remove(&OutPoint::new(tx.txid, *index));
        }
        self.persist(&graph)?;
        Ok(true)
    }
}

//! JSONL snapshots of a [`MemoryGraphStore`](super::MemoryGraphStore).
//!
//! One record per line, tagged by `kind`. Transactions come first, sorted
//! by txid, then outpoints sorted by outpoint, so snapshots diff cleanly.

use std::collections::HashMap;

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::BlockHeight;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct TxRecord {
    pub(super) txid: Txid,
    pub(super) observed_time: Option<u64>,
    pub(super) block_hash: Option<BlockHash>,
    pub(super) block_height: Option<BlockHeight>,
    pub(super) coinbase: bool,
    pub(super) input_value_total: Option<Amount>,
    /// Spent outpoints in input order; `None` for the coinbase input.
    pub(super) inputs: Vec<Option<OutPoint>>,
    /// Indices of the outputs this transaction creates.
    pub(super) outputs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct OutpointRecord {
    pub(super) outpoint: OutPoint,
    pub(super) value: Option<Amount>,
    pub(super) address: Option<String>,
    pub(super) script_pub_key: Option<ScriptBuf>,
    /// Block time of the creating transaction.
    pub(super) creation_time: Option<u64>,
    pub(super) is_spent: bool,
    pub(super) spending_txid: Option<Txid>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SnapshotLine {
    Transaction(TxRecord),
    Outpoint(OutpointRecord),
}

#[derive(Debug, Default)]
pub(super) struct Snapshot {
    pub(super) transactions: HashMap<Txid, TxRecord>,
    pub(super) outpoints: HashMap<OutPoint, OutpointRecord>,
}

/// Parse snapshot content, skipping blank lines. A later line for the same
/// key replaces the earlier one.
pub(super) fn parse_snapshot(content: &str) -> Result<Snapshot, CoreError> {
    content
        .lines()
        .enumerate()
        .try_fold(Snapshot::default(), |mut snapshot, (line_num, line)| {
            let line = line.trim();
            if line.is_empty() {
                return Ok(snapshot);
            }
            let record: SnapshotLine = serde_json::from_str(line).map_err(|e| {
                CoreError::Store(format!("snapshot line {}: {e}", line_num + 1))
            })?;
            let replaced = match record {
                SnapshotLine::Transaction(tx) => snapshot.transactions.insert(tx.txid, tx).is_some(),
                SnapshotLine::Outpoint(op) => snapshot.outpoints.insert(op.outpoint, op).is_some(),
            };
            if replaced {
                tracing::warn!(line = line_num + 1, "duplicate snapshot entry overwrites previous value");
            }
            Ok(snapshot)
        })
}

pub(super) fn export_snapshot(
    transactions: &HashMap<Txid, TxRecord>,
    outpoints: &HashMap<OutPoint, OutpointRecord>,
) -> Result<String, CoreError> {
    let mut txs: Vec<_> = transactions.values().collect();
    txs.sort_by_key(|tx| tx.txid);
    let mut ops: Vec<_> = outpoints.values().collect();
    ops.sort_by_key(|op| op.outpoint);

    let lines = txs
        .into_iter()
        .map(|tx| serde_json::to_string(&SnapshotLine::Transaction(tx.clone())))
        .chain(
            ops.into_iter()
                .map(|op| serde_json::to_string(&SnapshotLine::Outpoint(op.clone()))),
        );

    let mut out = String::new();
    for line in lines {
        let line = line.map_err(|e| CoreError::Store(format!("encode snapshot: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::txid_from_byte;

    fn outpoint_record(txid: Txid, vout: u32, sats: u64) -> OutpointRecord {
        OutpointRecord {
            outpoint: OutPoint::new(txid, vout),
            value: Some(Amount::from_sat(sats)),
            address: Some("bc1qexample".to_owned()),
            script_pub_key: None,
            creation_time: Some(1_700_000_000),
            is_spent: true,
            spending_txid: Some(txid_from_byte(9)),
        }
    }

    #[test]
    fn snapshot_lines_are_tagged_and_sorted() {
        let txid = txid_from_byte(2);
        let transactions = HashMap::from([(
            txid,
            TxRecord {
                txid,
                observed_time: None,
                block_hash: None,
                block_height: None,
                coinbase: false,
                input_value_total: None,
                inputs: vec![Some(OutPoint::new(txid_from_byte(1), 0))],
                outputs: vec![0, 1],
            },
        )]);
        let outpoints = HashMap::from([
            (OutPoint::new(txid, 1), outpoint_record(txid, 1, 20)),
            (OutPoint::new(txid, 0), outpoint_record(txid, 0, 10)),
        ]);

        let content = export_snapshot(&transactions, &outpoints).expect("encodes");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(r#""kind":"transaction""#));
        assert!(lines[1].contains(&format!("{txid}:0")));
        assert!(lines[2].contains(&format!("{txid}:1")));

        let parsed = parse_snapshot(&content).expect("parses back");
        assert_eq!(parsed.transactions, transactions);
        assert_eq!(parsed.outpoints, outpoints);
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = parse_snapshot("\n{\"kind\":\"outpoint\"}\n").expect_err("missing fields");
        assert!(err.to_string().contains("line 2"));
    }
}

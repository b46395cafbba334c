//! Shared test helpers for `peelscope-core` unit tests.
//!
//! Builders for resolved transactions, inputs and outputs so tests across
//! modules construct dummy chains the same way.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Txid};

use crate::error::CoreError;
use crate::orchestrator::TransactionResolver;
use crate::types::{
    BlockHeight, ResolvedInput, ResolvedOutput, ResolvedTransaction, SourceTier,
};

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
/// Useful for building small test graphs where txids only need to be unique.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// Minimal valid P2WPKH scriptPubKey (`OP_0 PUSH20 <hash>`), with the last
/// byte of the hash set to `tag` so scripts can be told apart.
pub fn p2wpkh_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![
        0x00, 0x14, // OP_0, PUSH20
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10, 0x11, 0x12, 0x13, 0x14,
    ];
    bytes[21] = tag;
    ScriptBuf::from_bytes(bytes)
}

// ==============================================================================
// Transaction Builders
// ==============================================================================

/// A coinbase input (no prevout, no value).
pub fn coinbase_input() -> ResolvedInput {
    ResolvedInput {
        prevout: None,
        value: None,
        address: None,
        creation_time: None,
    }
}

/// An input spending `funding_txid:vout`. `value` is in satoshis.
pub fn make_input(value: Option<u64>, funding_txid: Txid, vout: u32) -> ResolvedInput {
    ResolvedInput {
        prevout: Some(OutPoint::new(funding_txid, vout)),
        value: value.map(Amount::from_sat),
        address: None,
        creation_time: None,
    }
}

/// An unspent P2WPKH output at `index`.
pub fn make_output(index: u32, sats: u64) -> ResolvedOutput {
    ResolvedOutput {
        index,
        value: Amount::from_sat(sats),
        address: None,
        script_pub_key: Some(p2wpkh_script(index as u8)),
        is_spent: false,
        spending_txid: None,
    }
}

/// Outputs numbered from 0 with the given satoshi values.
pub fn make_outputs(sats: &[u64]) -> Vec<ResolvedOutput> {
    sats.iter()
        .enumerate()
        .map(|(i, v)| make_output(i as u32, *v))
        .collect()
}

/// Build a confirmed `ResolvedTransaction` with sane defaults.
/// Override individual fields after construction when needed.
pub fn make_tx(
    txid: Txid,
    inputs: Vec<ResolvedInput>,
    outputs: Vec<ResolvedOutput>,
) -> ResolvedTransaction {
    ResolvedTransaction {
        txid,
        observed_time: Some(1_700_000_000),
        block_hash: None,
        block_height: Some(BlockHeight(100)),
        input_value_total: None,
        inputs,
        outputs,
    }
}

// ==============================================================================
// Fixture Resolver
// ==============================================================================

/// A [`TransactionResolver`] over fixed maps. Counts resolve calls so tests
/// can assert how much work a walk did.
#[derive(Default)]
pub struct FixtureResolver {
    transactions: HashMap<Txid, ResolvedTransaction>,
    spends: HashMap<OutPoint, Txid>,
    failing_spends: HashSet<OutPoint>,
    resolve_calls: AtomicUsize,
}

impl FixtureResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tx(mut self, tx: ResolvedTransaction) -> Self {
        self.transactions.insert(tx.txid, tx);
        self
    }

    pub fn with_spend(mut self, outpoint: OutPoint, spender: Txid) -> Self {
        self.spends.insert(outpoint, spender);
        self
    }

    /// Spend lookups for `outpoint` fail as if every source were down.
    pub fn with_failing_spend(mut self, outpoint: OutPoint) -> Self {
        self.failing_spends.insert(outpoint);
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionResolver for FixtureResolver {
    async fn resolve(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| CoreError::Unresolved {
                txid: *txid,
                reason: "not in fixture".to_owned(),
            })
    }

    async fn find_spender(
        &self,
        outpoint: &OutPoint,
        _script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        if self.failing_spends.contains(outpoint) {
            return Err(CoreError::SourceUnavailable {
                tier: SourceTier::Secondary,
                detail: "fixture outage".to_owned(),
            });
        }
        Ok(self.spends.get(outpoint).copied())
    }
}

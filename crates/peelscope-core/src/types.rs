//! Domain types for peelscope's transaction resolution and chain tracing.
//!
//! Contains the source-agnostic transaction view (`ResolvedTransaction`,
//! `ResolvedInput`, `ResolvedOutput`), the source tiering model
//! (`SourceTier`, `SourceState`), and the peeling-chain result types
//! (`PeelStep`, `ChainTrace`, `ChainStats`, `Termination`, `TraceLimits`).

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::metrics::AnomalyReport;

// ==============================================================================
// Source Tiers
// ==============================================================================

/// Trust tiers of the transaction sources, highest trust first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Locally-run, trusted node.
    Primary,
    /// Electrum-protocol server, consulted for spend lookups only.
    Secondary,
    /// Public HTTP block explorer.
    Tertiary,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Tertiary => write!(f, "tertiary"),
        }
    }
}

/// Fallback state owned by one `SourceOrchestrator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub authoritative: SourceTier,
    /// Operations served while `authoritative != Primary` since the last
    /// recovery attempt.
    pub degraded_step_count: u32,
}

impl SourceState {
    pub fn is_degraded(&self) -> bool {
        self.authoritative != SourceTier::Primary
    }
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            authoritative: SourceTier::Primary,
            degraded_step_count: 0,
        }
    }
}

// ==============================================================================
// Block Height
// ==============================================================================

/// A Bitcoin block height, wrapped for type safety.
///
/// `#[serde(transparent)]` keeps the JSON representation a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u32);

impl From<u32> for BlockHeight {
    fn from(h: u32) -> Self {
        Self(h)
    }
}

impl std::ops::Deref for BlockHeight {
    type Target = u32;
    fn deref(&self) -> &u32 {
        &self.0
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Resolved Transaction
// ==============================================================================

/// Normalized view of a transaction, independent of which source produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTransaction {
    pub txid: Txid,
    /// Block time (unix seconds). `None` for unconfirmed transactions.
    pub observed_time: Option<u64>,
    pub block_hash: Option<BlockHash>,
    pub block_height: Option<BlockHeight>,
    /// Sum of input values when the source supplied it pre-aggregated.
    pub input_value_total: Option<Amount>,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<ResolvedOutput>,
}

impl ResolvedTransaction {
    /// A coinbase transaction has exactly one input whose prevout is `None`.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_none()
    }

    /// Height of the containing block, `0` when unconfirmed.
    pub fn containing_block_height(&self) -> u32 {
        self.block_height.map(|h| h.0).unwrap_or(0)
    }

    pub fn output(&self, vout: u32) -> Option<&ResolvedOutput> {
        self.outputs.iter().find(|o| o.index == vout)
    }

    /// Sum of output values, `None` if it overflows.
    pub fn total_output_value(&self) -> Option<Amount> {
        checked_total(self.outputs.iter().map(|o| o.value))
    }

    /// Sum of resolved input values. `None` if any non-coinbase input is
    /// missing its value.
    pub fn resolved_input_total(&self) -> Option<Amount> {
        if let Some(total) = self.input_value_total {
            return Some(total);
        }
        self.inputs
            .iter()
            .filter(|input| !input.is_coinbase())
            .try_fold(Amount::ZERO, |acc, input| acc.checked_add(input.value?))
    }
}

/// Sum of `values`, `None` on overflow.
pub fn checked_total(values: impl IntoIterator<Item = Amount>) -> Option<Amount> {
    values
        .into_iter()
        .try_fold(Amount::ZERO, |acc, value| acc.checked_add(value))
}

/// Sum of `values`, clamped at `u64::MAX` satoshis.
pub fn saturating_total(values: impl IntoIterator<Item = Amount>) -> Amount {
    Amount::from_sat(
        values
            .into_iter()
            .fold(0u64, |acc, value| acc.saturating_add(value.to_sat())),
    )
}

/// A transaction input. For coinbase inputs, `prevout` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub prevout: Option<OutPoint>,
    /// Value of the spent output; `None` when not yet resolved.
    pub value: Option<Amount>,
    pub address: Option<String>,
    /// Block time of the transaction that created the spent output.
    pub creation_time: Option<u64>,
}

impl ResolvedInput {
    pub fn is_coinbase(&self) -> bool {
        self.prevout.is_none()
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    pub index: u32,
    pub value: Amount,
    pub address: Option<String>,
    /// Locking script; required for Electrum spend lookups. Graph-store
    /// records may omit it.
    pub script_pub_key: Option<ScriptBuf>,
    pub is_spent: bool,
    pub spending_txid: Option<Txid>,
}

// ==============================================================================
// Peeling Chain
// ==============================================================================

/// One hop of a peeling chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeelStep {
    pub txid: Txid,
    pub input_total_value: Amount,
    pub peeled_value: Amount,
    pub change_value: Amount,
    /// `peeled_value / input_total_value * 100`, `0.0` when the input total
    /// is zero. Not clamped: a peel larger than the resolved input total
    /// (inputs left unresolved) reports above 100.
    pub peeled_percentage: f64,
    pub observed_time: Option<u64>,
    pub peeled_vout: u32,
    pub change_vout: u32,
    /// Inputs whose value could not be resolved and were left out of
    /// `input_total_value`.
    pub unresolved_inputs: usize,
}

/// Why a trace stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// The change output of the last step is unspent.
    ChainEnd,
    /// The current transaction has fewer than two outputs.
    NotPeelingShaped { txid: Txid, output_count: usize },
    /// No source could resolve the current transaction.
    NoData { txid: Txid, reason: String },
    /// The spender of the change output could not be looked up.
    SpendLookupFailed { txid: Txid, reason: String },
    /// A transaction was reached twice.
    Cycle { txid: Txid },
    /// The hop ceiling was reached with more chain left to walk.
    HopLimit { max_hops: usize },
}

impl Termination {
    /// Whether the trace stopped because data was missing rather than
    /// because the chain's structure ended it.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::NoData { .. } | Self::SpendLookupFailed { .. })
    }
}

/// Aggregate statistics over a chain's steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainStats {
    pub chain_length: usize,
    pub total_peeled_value: Amount,
    pub total_value_processed: Amount,
    /// Percentage statistics only consider steps with a non-zero input total.
    pub min_peeled_percentage: f64,
    pub max_peeled_percentage: f64,
    pub mean_peeled_percentage: f64,
    pub largest_peel: Amount,
    pub smallest_peel: Amount,
    pub mean_transaction_size: Amount,
}

/// Result of one tracer invocation. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTrace {
    pub start_txid: Txid,
    pub steps: Vec<PeelStep>,
    pub stats: ChainStats,
    pub anomalies: AnomalyReport,
    pub termination: Termination,
}

/// Configurable limits for chain walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceLimits {
    pub max_hops: usize,
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self { max_hops: 100 }
    }
}

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::orchestrator::{SourceOrchestrator, TransactionResolver};
use crate::types::{ResolvedOutput, TraceLimits};

/// One stored hop of a value path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub txid: Txid,
    /// Output followed out of this transaction, `None` on the last hop
    /// when the walk stopped before choosing one.
    pub followed_vout: Option<u32>,
    pub followed_value: Option<Amount>,
    pub output_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathEnd {
    /// The highest-value output of the last hop is unspent.
    UnspentTip { outpoint: OutPoint, value: Amount },
    /// A hop could not be resolved by any source.
    Unresolved { txid: Txid, reason: String },
    /// The last hop has no outputs to follow.
    NoOutputs { txid: Txid },
    SpendLookupFailed { outpoint: OutPoint, reason: String },
    Cycle { txid: Txid },
    StepLimit { max_steps: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathTrace {
    pub start_txid: Txid,
    pub hops: Vec<PathHop>,
    pub end: PathEnd,
}

/// Follow the largest output forward from `start`, storing every
/// transaction on the way.
///
/// Stops after `max_steps` stored transactions, or at the tracer's hop
/// ceiling when no limit is given. Graph store write failures abort the
/// walk; everything else ends it with a [`PathEnd`].
pub async fn trace_path(
    orchestrator: &SourceOrchestrator,
    start: Txid,
    max_steps: Option<usize>,
) -> Result<PathTrace, CoreError> {
    let max_steps = max_steps.unwrap_or(TraceLimits::default().max_hops);
    info!(txid = %start, max_steps, "tracing value path");

    let mut hops = Vec::new();
    let mut visited = HashSet::new();
    let mut current = start;

    let end = loop {
        if !visited.insert(current) {
            break PathEnd::Cycle { txid: current };
        }

        let tx = match orchestrator.store_transaction(&current).await {
            Ok(tx) => tx,
            Err(e @ CoreError::Unresolved { .. }) => {
                warn!(txid = %current, error = %e, "path hop unresolved");
                break PathEnd::Unresolved {
                    txid: current,
                    reason: e.to_string(),
                };
            }
            Err(e) => return Err(e),
        };

        if hops.len() + 1 >= max_steps {
            hops.push(PathHop {
                txid: tx.txid,
                followed_vout: None,
                followed_value: None,
                output_count: tx.outputs.len(),
            });
            break PathEnd::StepLimit { max_steps };
        }

        let Some(largest) = largest_output(&tx.outputs) else {
            hops.push(PathHop {
                txid: tx.txid,
                followed_vout: None,
                followed_value: None,
                output_count: 0,
            });
            break PathEnd::NoOutputs { txid: tx.txid };
        };
        hops.push(PathHop {
            txid: tx.txid,
            followed_vout: Some(largest.index),
            followed_value: Some(largest.value),
            output_count: tx.outputs.len(),
        });

        let outpoint = OutPoint::new(tx.txid, largest.index);
        let spender = match largest.spending_txid {
            Some(spender) => Ok(Some(spender)),
            None => {
                orchestrator
                    .find_spender(&outpoint, largest.script_pub_key.as_deref())
                    .await
            }
        };
        match spender {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                break PathEnd::UnspentTip {
                    outpoint,
                    value: largest.value,
                }
            }
            Err(e) => {
                break PathEnd::SpendLookupFailed {
                    outpoint,
                    reason: e.to_string(),
                }
            }
        }
    };

    info!(txid = %start, hops = hops.len(), ?end, "value path traced");
    Ok(PathTrace {
        start_txid: start,
        hops,
        end,
    })
}

/// Highest-value output; the first one wins a tie.
fn largest_output(outputs: &[ResolvedOutput]) -> Option<&ResolvedOutput> {
    outputs
        .iter()
        .reduce(|best, o| if o.value > best.value { o } else { best })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::orchestrator::{DenyFallback, OrchestratorConfig, SourceSet};
    use crate::source::mock::MockSource;
    use crate::store::{GraphStore, MemoryGraphStore};
    use crate::test_util::{make_input, make_outputs, make_tx, txid_from_byte};
    use crate::types::SourceTier;

    fn orchestrator(primary: MockSource, electrum: MockSource) -> (SourceOrchestrator, Arc<MemoryGraphStore>) {
        let store = Arc::new(MemoryGraphStore::new());
        let orchestrator = SourceOrchestrator::new(
            SourceSet {
                primary: Arc::new(primary),
                electrum: Some(Arc::new(electrum)),
                public_api: None,
            },
            store.clone(),
            Arc::new(DenyFallback),
            OrchestratorConfig::default(),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn follows_largest_output_to_an_unspent_tip() {
        let a = make_tx(
            txid_from_byte(1),
            vec![make_input(Some(100_000), txid_from_byte(90), 0)],
            make_outputs(&[30_000, 60_000, 5_000]),
        );
        let b = make_tx(
            txid_from_byte(2),
            vec![make_input(Some(60_000), a.txid, 1)],
            make_outputs(&[59_000]),
        );
        let primary = MockSource::builder(SourceTier::Primary)
            .with_tx(a.clone())
            .with_tx(b.clone())
            .build();
        let electrum = MockSource::builder(SourceTier::Secondary)
            .with_spend(OutPoint::new(a.txid, 1), b.txid)
            .build();
        let (orchestrator, store) = orchestrator(primary, electrum);

        let path = trace_path(&orchestrator, a.txid, None).await.expect("walk");

        assert_eq!(path.hops.len(), 2);
        assert_eq!(path.hops[0].followed_vout, Some(1));
        assert_eq!(
            path.end,
            PathEnd::UnspentTip {
                outpoint: OutPoint::new(b.txid, 0),
                value: Amount::from_sat(59_000),
            }
        );
        assert!(store.get_transaction(&a.txid).await.expect("read").is_some());
        assert!(store.get_transaction(&b.txid).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn step_limit_stops_after_storing() {
        let a = make_tx(
            txid_from_byte(1),
            vec![make_input(Some(10_000), txid_from_byte(90), 0)],
            make_outputs(&[9_000]),
        );
        let primary = MockSource::builder(SourceTier::Primary).with_tx(a.clone()).build();
        let electrum = MockSource::builder(SourceTier::Secondary).build();
        let (orchestrator, store) = orchestrator(primary, electrum);

        let path = trace_path(&orchestrator, a.txid, Some(1)).await.expect("walk");

        assert_eq!(path.end, PathEnd::StepLimit { max_steps: 1 });
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_start_is_unresolved() {
        let (orchestrator, _) = orchestrator(
            MockSource::builder(SourceTier::Primary).build(),
            MockSource::builder(SourceTier::Secondary).build(),
        );
        let path = trace_path(&orchestrator, txid_from_byte(5), None).await.expect("walk");
        assert!(path.hops.is_empty());
        assert!(matches!(path.end, PathEnd::Unresolved { .. }));
    }

    #[test]
    fn first_largest_output_wins_ties() {
        let outputs = make_outputs(&[10, 70, 70, 3]);
        assert_eq!(largest_output(&outputs).map(|o| o.index), Some(1));
        assert!(largest_output(&[]).is_none());
    }
}

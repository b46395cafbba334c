use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, Txid};
use tracing::{debug, info, warn};

use crate::metrics::{detect_anomalies, mean};
use crate::orchestrator::TransactionResolver;
use crate::types::{
    saturating_total, ChainStats, ChainTrace, PeelStep, ResolvedOutput, ResolvedTransaction,
    Termination, TraceLimits,
};

// ==============================================================================
// Peeling Chain Tracer
// ==============================================================================

/// Follow a peeling chain forward from `start`.
///
/// Each hop splits its outputs into the smallest ("peeled") and the largest
/// ("change") by value, records a [`PeelStep`], and moves on to whichever
/// transaction spends the change output. The walk is strictly sequential
/// and always returns a trace; how it stopped is reported in
/// [`ChainTrace::termination`].
///
/// The smallest/largest split is a heuristic. Equal-valued outputs make it
/// ambiguous, which is logged but not treated as a failure.
pub async fn trace_peeling_chain(
    resolver: &dyn TransactionResolver,
    start: Txid,
    limits: &TraceLimits,
) -> ChainTrace {
    info!(txid = %start, max_hops = limits.max_hops, "tracing peeling chain");

    let mut steps: Vec<PeelStep> = Vec::new();
    let mut visited: HashSet<Txid> = HashSet::new();
    let mut current = start;

    let termination = loop {
        if steps.len() >= limits.max_hops {
            break Termination::HopLimit {
                max_hops: limits.max_hops,
            };
        }
        if !visited.insert(current) {
            warn!(txid = %current, "peeling chain revisits a transaction");
            break Termination::Cycle { txid: current };
        }

        let tx = match resolver.resolve(&current).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(txid = %current, error = %e, "peeling chain hop unresolved");
                break Termination::NoData {
                    txid: current,
                    reason: e.to_string(),
                };
            }
        };

        let Some((peeled, change)) = split_peel_and_change(&tx) else {
            break Termination::NotPeelingShaped {
                txid: current,
                output_count: tx.outputs.len(),
            };
        };

        let (input_total, unresolved_inputs) = input_total(resolver, &tx).await;
        let step = PeelStep {
            txid: tx.txid,
            input_total_value: input_total,
            peeled_value: peeled.value,
            change_value: change.value,
            peeled_percentage: percentage_of(peeled.value, input_total),
            observed_time: tx.observed_time,
            peeled_vout: peeled.index,
            change_vout: change.index,
            unresolved_inputs,
        };
        debug!(
            hop = steps.len(),
            txid = %step.txid,
            peeled = step.peeled_value.to_sat(),
            change = step.change_value.to_sat(),
            pct = step.peeled_percentage,
            "peel step"
        );
        steps.push(step);

        let change_outpoint = OutPoint::new(tx.txid, change.index);
        let spender = match change.spending_txid {
            Some(spender) => Ok(Some(spender)),
            None => {
                resolver
                    .find_spender(&change_outpoint, change.script_pub_key.as_deref())
                    .await
            }
        };
        match spender {
            Ok(Some(next)) => current = next,
            Ok(None) => break Termination::ChainEnd,
            Err(e) => {
                warn!(outpoint = %change_outpoint, error = %e, "change spend lookup failed");
                break Termination::SpendLookupFailed {
                    txid: tx.txid,
                    reason: e.to_string(),
                };
            }
        }
    };

    let percentages: Vec<f64> = steps.iter().map(|s| s.peeled_percentage).collect();
    let anomalies = detect_anomalies(&percentages);
    let stats = chain_stats(&steps);

    if termination.is_partial() {
        warn!(txid = %start, steps = steps.len(), ?termination, "peeling chain trace is partial");
    } else {
        info!(txid = %start, steps = steps.len(), anomalies = anomalies.count(), "peeling chain traced");
    }

    ChainTrace {
        start_txid: start,
        steps,
        stats,
        anomalies,
        termination,
    }
}

/// Smallest and largest output by value, `None` below two outputs.
///
/// The sort is stable, so among equal values the peel is the first output
/// and the change the last.
fn split_peel_and_change(tx: &ResolvedTransaction) -> Option<(&ResolvedOutput, &ResolvedOutput)> {
    if tx.outputs.len() < 2 {
        return None;
    }
    let mut sorted: Vec<&ResolvedOutput> = tx.outputs.iter().collect();
    sorted.sort_by_key(|o| o.value);
    let peeled = *sorted.first()?;
    let change = *sorted.last()?;
    if peeled.value == change.value {
        warn!(
            txid = %tx.txid,
            value = peeled.value.to_sat(),
            "peel and change outputs have equal value, split is arbitrary"
        );
    }
    Some((peeled, change))
}

/// Total value entering `tx`, with the number of inputs that could not be
/// valued and were left out.
async fn input_total(resolver: &dyn TransactionResolver, tx: &ResolvedTransaction) -> (Amount, usize) {
    if let Some(total) = tx.input_value_total {
        return (total, 0);
    }

    let mut total = Amount::ZERO;
    let mut unresolved = 0;
    for input in &tx.inputs {
        let Some(prevout) = input.prevout else {
            continue;
        };
        let value = match input.value {
            Some(value) => Some(value),
            None => resolve_prevout_value(resolver, &prevout).await,
        };
        let Some(value) = value else {
            warn!(txid = %tx.txid, prevout = %prevout, "input value unresolved, skipped");
            unresolved += 1;
            continue;
        };
        match total.checked_add(value) {
            Some(sum) => total = sum,
            None => {
                warn!(txid = %tx.txid, prevout = %prevout, value = value.to_sat(), "input value overflows total, skipped");
                unresolved += 1;
            }
        }
    }
    (total, unresolved)
}

async fn resolve_prevout_value(
    resolver: &dyn TransactionResolver,
    prevout: &OutPoint,
) -> Option<Amount> {
    let funding = resolver.resolve(&prevout.txid).await.ok()?;
    funding.output(prevout.vout).map(|o| o.value)
}

fn percentage_of(part: Amount, whole: Amount) -> f64 {
    if whole == Amount::ZERO {
        return 0.0;
    }
    part.to_sat() as f64 / whole.to_sat() as f64 * 100.0
}

fn chain_stats(steps: &[PeelStep]) -> ChainStats {
    if steps.is_empty() {
        return ChainStats::default();
    }

    let total_peeled_value = saturating_total(steps.iter().map(|s| s.peeled_value));
    let total_value_processed = saturating_total(steps.iter().map(|s| s.input_total_value));
    let percentages: Vec<f64> = steps
        .iter()
        .filter(|s| s.input_total_value > Amount::ZERO)
        .map(|s| s.peeled_percentage)
        .collect();

    ChainStats {
        chain_length: steps.len(),
        total_peeled_value,
        total_value_processed,
        min_peeled_percentage: percentages.iter().copied().reduce(f64::min).unwrap_or(0.0),
        max_peeled_percentage: percentages.iter().copied().reduce(f64::max).unwrap_or(0.0),
        mean_peeled_percentage: mean(&percentages).unwrap_or(0.0),
        largest_peel: steps.iter().map(|s| s.peeled_value).max().unwrap_or(Amount::ZERO),
        smallest_peel: steps.iter().map(|s| s.peeled_value).min().unwrap_or(Amount::ZERO),
        mean_transaction_size: Amount::from_sat(
            total_value_processed.to_sat() / steps.len() as u64,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        coinbase_input, make_input, make_outputs, make_tx, txid_from_byte, FixtureResolver,
    };

    /// Build a chain of `peels.len()` hops. Hop `i` spends the change
    /// (vout 1) of hop `i - 1` and splits its input into the peel at vout 0
    /// and the remaining change at vout 1. The final change is unspent.
    fn chain(start_value: u64, peels: &[u64]) -> (FixtureResolver, Vec<Txid>) {
        let mut resolver = FixtureResolver::new();
        let mut txids = Vec::new();
        let mut funding = (txid_from_byte(200), 0u32);
        let mut value = start_value;

        for (i, peel) in peels.iter().enumerate() {
            let txid = txid_from_byte(i as u8 + 1);
            let change = value - peel;
            let tx = make_tx(
                txid,
                vec![make_input(Some(value), funding.0, funding.1)],
                make_outputs(&[*peel, change]),
            );
            if i > 0 {
                resolver = resolver.with_spend(OutPoint::new(funding.0, funding.1), txid);
            }
            resolver = resolver.with_tx(tx);
            txids.push(txid);
            funding = (txid, 1);
            value = change;
        }
        (resolver, txids)
    }

    #[tokio::test]
    async fn overflowing_input_values_do_not_abort_the_trace() {
        let half = u64::MAX / 2 + 1;
        let txid = txid_from_byte(1);
        let tx = make_tx(
            txid,
            vec![
                make_input(Some(half), txid_from_byte(50), 0),
                make_input(Some(half), txid_from_byte(51), 0),
            ],
            make_outputs(&[1_000, 2_000]),
        );
        let resolver = FixtureResolver::new().with_tx(tx);

        let trace = trace_peeling_chain(&resolver, txid, &TraceLimits::default()).await;

        assert_eq!(trace.termination, Termination::ChainEnd);
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].input_total_value, Amount::from_sat(half));
        assert_eq!(trace.steps[0].unresolved_inputs, 1);
        assert_eq!(trace.stats.total_value_processed, Amount::from_sat(half));
    }

    #[test]
    fn stats_saturate_instead_of_overflowing() {
        let step = |input: u64| PeelStep {
            txid: txid_from_byte(1),
            input_total_value: Amount::from_sat(input),
            peeled_value: Amount::from_sat(10),
            change_value: Amount::from_sat(20),
            peeled_percentage: 0.0,
            observed_time: None,
            peeled_vout: 0,
            change_vout: 1,
            unresolved_inputs: 0,
        };
        let stats = chain_stats(&[step(u64::MAX - 1), step(u64::MAX - 1)]);
        assert_eq!(stats.total_value_processed, Amount::from_sat(u64::MAX));
        assert_eq!(stats.total_peeled_value, Amount::from_sat(20));
    }

    #[tokio::test]
    async fn three_hop_chain_ends_at_unspent_change() {
        let (resolver, txids) = chain(1_000_000, &[100_000, 90_000, 80_000]);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.termination, Termination::ChainEnd);
        assert_eq!(trace.steps.len(), 3);
        let walked: Vec<Txid> = trace.steps.iter().map(|s| s.txid).collect();
        assert_eq!(walked, txids);
        for pair in trace.steps.windows(2) {
            // The next hop consumes exactly the previous change.
            assert_eq!(pair[1].input_total_value, pair[0].change_value);
        }
        assert_eq!(trace.steps[0].peeled_vout, 0);
        assert_eq!(trace.steps[0].change_vout, 1);
        assert!((trace.steps[0].peeled_percentage - 10.0).abs() < 1e-9);

        assert_eq!(trace.stats.chain_length, 3);
        assert_eq!(trace.stats.total_peeled_value, Amount::from_sat(270_000));
        assert_eq!(trace.stats.largest_peel, Amount::from_sat(100_000));
        assert_eq!(trace.stats.smallest_peel, Amount::from_sat(80_000));
        assert!(trace.anomalies.positions.is_empty());
        assert!(!trace.termination.is_partial());
    }

    #[tokio::test]
    async fn fewer_than_two_outputs_is_not_peeling_shaped() {
        for outputs in [vec![], vec![5_000_000u64]] {
            let tx = make_tx(
                txid_from_byte(1),
                vec![make_input(Some(9_000_000), txid_from_byte(9), 0)],
                make_outputs(&outputs),
            );
            let resolver = FixtureResolver::new().with_tx(tx);

            let trace =
                trace_peeling_chain(&resolver, txid_from_byte(1), &TraceLimits::default()).await;

            assert_eq!(
                trace.termination,
                Termination::NotPeelingShaped {
                    txid: txid_from_byte(1),
                    output_count: outputs.len(),
                }
            );
            assert!(trace.steps.is_empty());
        }
    }

    #[tokio::test]
    async fn unresolvable_start_is_partial_no_data() {
        let resolver = FixtureResolver::new();
        let trace = trace_peeling_chain(&resolver, txid_from_byte(1), &TraceLimits::default()).await;
        assert!(matches!(trace.termination, Termination::NoData { .. }));
        assert!(trace.termination.is_partial());
        assert_eq!(trace.stats, ChainStats::default());
    }

    #[tokio::test]
    async fn missing_next_hop_keeps_earlier_steps() {
        let (resolver, txids) = chain(1_000_000, &[100_000]);
        let resolver = resolver.with_spend(OutPoint::new(txids[0], 1), txid_from_byte(77));

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 1);
        assert!(matches!(
            trace.termination,
            Termination::NoData { txid, .. } if txid == txid_from_byte(77)
        ));
    }

    #[tokio::test]
    async fn failed_spend_lookup_is_reported() {
        let (resolver, txids) = chain(1_000_000, &[100_000]);
        let resolver = resolver.with_failing_spend(OutPoint::new(txids[0], 1));

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 1);
        assert!(matches!(trace.termination, Termination::SpendLookupFailed { .. }));
        assert!(trace.termination.is_partial());
    }

    #[tokio::test]
    async fn self_spending_change_is_a_cycle() {
        let (resolver, txids) = chain(1_000_000, &[100_000]);
        let resolver = resolver.with_spend(OutPoint::new(txids[0], 1), txids[0]);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.termination, Termination::Cycle { txid: txids[0] });
    }

    #[tokio::test]
    async fn hop_ceiling_stops_long_chains() {
        let (resolver, txids) = chain(1_000_000, &[1_000; 5]);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits { max_hops: 3 }).await;

        assert_eq!(trace.steps.len(), 3);
        assert_eq!(trace.termination, Termination::HopLimit { max_hops: 3 });
    }

    #[tokio::test]
    async fn recorded_spend_edge_skips_lookup() {
        let (resolver, txids) = chain(1_000_000, &[100_000, 50_000]);
        // Drop the resolver's edge and carry it on the output instead.
        let mut first = resolver.resolve(&txids[0]).await.expect("fixture");
        first.outputs[1].is_spent = true;
        first.outputs[1].spending_txid = Some(txids[1]);
        let second = resolver.resolve(&txids[1]).await.expect("fixture");
        let resolver = FixtureResolver::new().with_tx(first).with_tx(second);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.termination, Termination::ChainEnd);
    }

    #[tokio::test]
    async fn missing_input_values_are_resolved_on_demand() {
        let funding = make_tx(txid_from_byte(50), vec![coinbase_input()], make_outputs(&[40_000, 60_000]));
        let tx = make_tx(
            txid_from_byte(1),
            vec![
                make_input(None, funding.txid, 1),
                make_input(None, txid_from_byte(99), 0),
            ],
            make_outputs(&[6_000, 50_000]),
        );
        let resolver = FixtureResolver::new().with_tx(funding).with_tx(tx);

        let trace = trace_peeling_chain(&resolver, txid_from_byte(1), &TraceLimits::default()).await;

        let step = &trace.steps[0];
        assert_eq!(step.input_total_value, Amount::from_sat(60_000));
        assert_eq!(step.unresolved_inputs, 1);
        assert!((step.peeled_percentage - 10.0).abs() < 1e-9);
        // start + funding + the unknown parent
        assert_eq!(resolver.resolve_calls(), 3);
    }

    #[tokio::test]
    async fn percentages_stay_in_range_when_inputs_cover_outputs() {
        let (resolver, txids) = chain(10_000_000, &[1, 2_000_000, 40_000, 3_333_333]);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 4);
        for step in &trace.steps {
            assert!((0.0..=100.0).contains(&step.peeled_percentage), "{step:?}");
        }
    }

    #[tokio::test]
    async fn outlying_peel_is_flagged() {
        // Three 1% peels followed by a large one.
        let (resolver, txids) = chain(10_000_000, &[100_000, 99_000, 98_010, 4_000_000]);

        let trace = trace_peeling_chain(&resolver, txids[0], &TraceLimits::default()).await;

        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.anomalies.positions, vec![3]);
    }

    #[test]
    fn equal_outputs_split_first_and_last() {
        let tx = make_tx(txid_from_byte(1), Vec::new(), make_outputs(&[500, 500, 500]));
        let (peeled, change) = split_peel_and_change(&tx).expect("three outputs");
        assert_eq!(peeled.index, 0);
        assert_eq!(change.index, 2);
    }

    #[test]
    fn zero_input_total_has_zero_percentage() {
        assert_eq!(percentage_of(Amount::from_sat(5), Amount::ZERO), 0.0);
    }
}

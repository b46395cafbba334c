//! Fan-in and fan-out analyzers.
//!
//! Both work on one resolved transaction and reduce it to the statistics in
//! [`crate::metrics`]. Fan-in fills missing input values and creation times
//! through a [`TransactionResolver`]; fan-out only looks at the outputs.

use bitcoin::{Amount, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::metrics::{
    categorize_values, coin_days_destroyed, distribution_uniformity, mean, std_dev,
    CoinDaysReport, InputCoinDays, Uniformity, ValueBuckets,
};
use crate::orchestrator::TransactionResolver;
use crate::types::{ResolvedInput, ResolvedTransaction};

const SECONDS_PER_HOUR: u64 = 3_600;
const SECONDS_PER_DAY: u64 = 86_400;

// ==============================================================================
// Fan-In
// ==============================================================================

/// Input counts by how long the spent output was held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeDistribution {
    pub up_to_30_days: usize,
    pub up_to_90_days: usize,
    pub up_to_365_days: usize,
    pub over_365_days: usize,
}

impl AgeDistribution {
    fn record(&mut self, days_held: i64) {
        match days_held {
            d if d <= 30 => self.up_to_30_days += 1,
            d if d <= 90 => self.up_to_90_days += 1,
            d if d <= 365 => self.up_to_365_days += 1,
            _ => self.over_365_days += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInReport {
    pub txid: Txid,
    pub input_count: usize,
    pub output_count: usize,
    pub total_input_value: Amount,
    /// `None` when the output values overflow.
    pub total_output_value: Option<Amount>,
    /// `None` when the outputs exceed the resolved inputs.
    pub fee: Option<Amount>,
    pub coin_days: CoinDaysReport,
    pub avg_coin_days_per_input: f64,
    pub age_distribution: AgeDistribution,
    /// Inputs by the UTC hour their spent output was created in.
    pub hourly_distribution: [usize; 24],
    /// Smallest output, the likely payment.
    pub likely_payment_vout: Option<u32>,
    /// Largest output, the likely change. Absent below two outputs.
    pub likely_change_vout: Option<u32>,
    /// Inputs whose value or creation time stayed unknown.
    pub unresolved_inputs: usize,
}

/// Consolidation profile of `tx`.
///
/// Missing input values and creation times are resolved through the
/// funding transactions; inputs that stay unknown count as zero value and
/// zero days held.
pub async fn analyze_fan_in(
    resolver: &dyn TransactionResolver,
    tx: &ResolvedTransaction,
) -> FanInReport {
    let (inputs, mut unresolved_inputs) = complete_inputs(resolver, tx).await;

    let mut total_input_value = Amount::ZERO;
    for value in inputs.iter().filter_map(|i| i.value) {
        match total_input_value.checked_add(value) {
            Some(sum) => total_input_value = sum,
            None => {
                warn!(txid = %tx.txid, value = value.to_sat(), "input value overflows total, skipped");
                unresolved_inputs += 1;
            }
        }
    }
    let total_output_value = tx.total_output_value();

    let coin_days = match tx.observed_time {
        Some(spend_time) => coin_days_destroyed(&inputs, spend_time),
        None => CoinDaysReport {
            total: 0.0,
            per_input: vec![
                InputCoinDays {
                    days_held: 0,
                    coin_days: 0.0,
                };
                inputs.len()
            ],
        },
    };

    let mut age_distribution = AgeDistribution::default();
    for input in &coin_days.per_input {
        age_distribution.record(input.days_held);
    }

    let mut hourly_distribution = [0usize; 24];
    for created in inputs.iter().filter_map(|i| i.creation_time) {
        hourly_distribution[((created % SECONDS_PER_DAY) / SECONDS_PER_HOUR) as usize] += 1;
    }

    let mut by_value: Vec<_> = tx.outputs.iter().collect();
    by_value.sort_by_key(|o| o.value);
    let likely_payment_vout = by_value.first().map(|o| o.index);
    let likely_change_vout = (by_value.len() >= 2)
        .then(|| by_value.last().map(|o| o.index))
        .flatten();

    let avg_coin_days_per_input = if inputs.is_empty() {
        0.0
    } else {
        coin_days.total / inputs.len() as f64
    };

    FanInReport {
        txid: tx.txid,
        input_count: inputs.len(),
        output_count: tx.outputs.len(),
        total_input_value,
        total_output_value,
        fee: total_output_value.and_then(|outputs| total_input_value.checked_sub(outputs)),
        coin_days,
        avg_coin_days_per_input,
        age_distribution,
        hourly_distribution,
        likely_payment_vout,
        likely_change_vout,
        unresolved_inputs,
    }
}

/// Copy of the inputs with value and creation time filled from the funding
/// transactions where missing.
async fn complete_inputs(
    resolver: &dyn TransactionResolver,
    tx: &ResolvedTransaction,
) -> (Vec<ResolvedInput>, usize) {
    let mut inputs = tx.inputs.clone();
    let mut unresolved = 0;
    for input in &mut inputs {
        let Some(prevout) = input.prevout else {
            continue;
        };
        if input.value.is_some() && input.creation_time.is_some() {
            continue;
        }
        match resolver.resolve(&prevout.txid).await {
            Ok(funding) => {
                if input.value.is_none() {
                    input.value = funding.output(prevout.vout).map(|o| o.value);
                }
                if input.creation_time.is_none() {
                    input.creation_time = funding.observed_time;
                }
            }
            Err(e) => debug!(prevout = %prevout, error = %e, "funding transaction unresolved"),
        }
        if input.value.is_none() || input.creation_time.is_none() {
            unresolved += 1;
        }
    }
    if unresolved > 0 {
        warn!(txid = %tx.txid, unresolved, "fan-in analysis has incomplete inputs");
    }
    (inputs, unresolved)
}

// ==============================================================================
// Fan-Out
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutScale {
    /// More than 50 outputs per input, e.g. airdrops or faucets.
    Mass,
    /// More than 10 outputs per input, e.g. batched withdrawals.
    Batch,
    Limited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionShape {
    Uniform,
    Mixed,
    Unequal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variability {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutInterpretation {
    pub scale: FanOutScale,
    pub distribution: DistributionShape,
    pub variability: Variability,
}

impl FanOutInterpretation {
    fn new(ratio: f64, uniformity_score: f64, cv: f64) -> Self {
        let scale = if ratio > 50.0 {
            FanOutScale::Mass
        } else if ratio > 10.0 {
            FanOutScale::Batch
        } else {
            FanOutScale::Limited
        };
        let distribution = if uniformity_score > 80.0 {
            DistributionShape::Uniform
        } else if uniformity_score > 50.0 {
            DistributionShape::Mixed
        } else {
            DistributionShape::Unequal
        };
        let variability = if cv < 20.0 {
            Variability::Low
        } else if cv < 50.0 {
            Variability::Medium
        } else {
            Variability::High
        };
        Self {
            scale,
            distribution,
            variability,
        }
    }
}

impl std::fmt::Display for FanOutInterpretation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scale = match self.scale {
            FanOutScale::Mass => "high fan-out, mass distribution (faucet or airdrop)",
            FanOutScale::Batch => "medium fan-out, payout or batched withdrawal",
            FanOutScale::Limited => "low fan-out, ordinary transaction",
        };
        let distribution = match self.distribution {
            DistributionShape::Uniform => "uniform output values",
            DistributionShape::Mixed => "mix of large and small outputs",
            DistributionShape::Unequal => "highly unequal output values",
        };
        let variability = match self.variability {
            Variability::Low => "low variability",
            Variability::Medium => "medium variability",
            Variability::High => "high variability",
        };
        write!(f, "{scale} | {distribution} | {variability}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub txid: Txid,
    pub input_count: usize,
    pub output_count: usize,
    pub fan_out_ratio: f64,
    /// `None` when some input value is unknown.
    pub total_input_value: Option<Amount>,
    pub total_output_value: Amount,
    pub fee: Option<Amount>,
    /// Output value statistics, in BTC.
    pub mean_output_value: f64,
    pub std_output_value: f64,
    pub min_output_value: f64,
    pub max_output_value: f64,
    /// Standard deviation over mean, in percent.
    pub coefficient_of_variation: f64,
    pub uniformity: Option<Uniformity>,
    pub buckets: Option<ValueBuckets>,
    pub spent_outputs: usize,
    pub unspent_outputs: usize,
    pub spent_percentage: f64,
    pub interpretation: FanOutInterpretation,
}

/// Distribution profile of `tx`'s outputs.
pub fn analyze_fan_out(tx: &ResolvedTransaction) -> Result<FanOutReport, CoreError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(CoreError::InvalidTxData(format!(
            "{} needs at least one input and one output for fan-out analysis",
            tx.txid
        )));
    }

    let values: Vec<f64> = tx.outputs.iter().map(|o| o.value.to_btc()).collect();
    let mean_output_value = mean(&values).unwrap_or(0.0);
    let std_output_value = std_dev(&values).unwrap_or(0.0);
    let coefficient_of_variation = if mean_output_value > 0.0 {
        std_output_value / mean_output_value * 100.0
    } else {
        0.0
    };
    let uniformity = distribution_uniformity(&values);
    let fan_out_ratio = tx.outputs.len() as f64 / tx.inputs.len() as f64;

    let spent_outputs = tx.outputs.iter().filter(|o| o.is_spent).count();
    let total_input_value = tx.resolved_input_total();
    let total_output_value = tx.total_output_value().ok_or_else(|| {
        CoreError::InvalidTxData(format!("{} output values overflow", tx.txid))
    })?;

    Ok(FanOutReport {
        txid: tx.txid,
        input_count: tx.inputs.len(),
        output_count: tx.outputs.len(),
        fan_out_ratio,
        total_input_value,
        total_output_value,
        fee: total_input_value.and_then(|total| total.checked_sub(total_output_value)),
        mean_output_value,
        std_output_value,
        min_output_value: values.iter().copied().reduce(f64::min).unwrap_or(0.0),
        max_output_value: values.iter().copied().reduce(f64::max).unwrap_or(0.0),
        coefficient_of_variation,
        uniformity,
        buckets: categorize_values(&values),
        spent_outputs,
        unspent_outputs: tx.outputs.len() - spent_outputs,
        spent_percentage: spent_outputs as f64 / tx.outputs.len() as f64 * 100.0,
        interpretation: FanOutInterpretation::new(
            fan_out_ratio,
            uniformity.map(|u| u.uniformity_score).unwrap_or(0.0),
            coefficient_of_variation,
        ),
    })
}

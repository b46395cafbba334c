//! Stateless flow metrics shared by the peeling-chain tracer and the
//! fan-in / fan-out analyzers.
//!
//! Every function here is pure. Degenerate inputs (too few samples, all
//! zeros) yield `None` or an empty report instead of an error.

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::types::ResolvedInput;

const SECONDS_PER_DAY: i64 = 86_400;

/// Minimum number of samples before IQR anomaly detection runs.
pub const MIN_ANOMALY_SAMPLES: usize = 4;

/// Tukey fence multiplier.
const IQR_FENCE: f64 = 1.5;

// ==============================================================================
// Basic Statistics
// ==============================================================================

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divides by `n`).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Percentile of an ascending-sorted slice using linear interpolation
/// between closest ranks. `p` is in `[0, 100]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let fraction = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * fraction)
}

// ==============================================================================
// Anomaly Detection
// ==============================================================================

/// Positions flagged outside the Tukey fences, plus the fences themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub positions: Vec<usize>,
    /// `None` when detection did not run (fewer than
    /// [`MIN_ANOMALY_SAMPLES`] values).
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

impl AnomalyReport {
    pub fn count(&self) -> usize {
        self.positions.len()
    }
}

/// Flag values outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]`.
#[must_use]
pub fn detect_anomalies(values: &[f64]) -> AnomalyReport {
    if values.len() < MIN_ANOMALY_SAMPLES {
        return AnomalyReport::default();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (Some(q1), Some(q3)) = (percentile(&sorted, 25.0), percentile(&sorted, 75.0)) else {
        return AnomalyReport::default();
    };
    let iqr = q3 - q1;
    let lower = q1 - IQR_FENCE * iqr;
    let upper = q3 + IQR_FENCE * iqr;

    let positions = values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v < lower || **v > upper)
        .map(|(i, _)| i)
        .collect();

    AnomalyReport {
        positions,
        lower_bound: Some(lower),
        upper_bound: Some(upper),
    }
}

// ==============================================================================
// Coin Days Destroyed
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputCoinDays {
    /// Whole days between creation and spend, floored.
    pub days_held: i64,
    /// `value_btc * days_held`.
    pub coin_days: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoinDaysReport {
    pub total: f64,
    /// One entry per input, in input order.
    pub per_input: Vec<InputCoinDays>,
}

/// Whole days elapsed between two unix timestamps, floor-divided.
pub fn days_between(creation_time: u64, spend_time: u64) -> i64 {
    (spend_time as i64 - creation_time as i64).div_euclid(SECONDS_PER_DAY)
}

/// Coin-days-destroyed for a spending transaction observed at `spend_time`.
///
/// Inputs without a creation time or value contribute zero.
#[must_use]
pub fn coin_days_destroyed(inputs: &[ResolvedInput], spend_time: u64) -> CoinDaysReport {
    let per_input: Vec<InputCoinDays> = inputs
        .iter()
        .map(|input| {
            let days_held = input
                .creation_time
                .map(|created| days_between(created, spend_time))
                .unwrap_or(0);
            let value = input.value.unwrap_or(Amount::ZERO).to_btc();
            InputCoinDays {
                days_held,
                coin_days: value * days_held as f64,
            }
        })
        .collect();

    CoinDaysReport {
        total: per_input.iter().map(|c| c.coin_days).sum(),
        per_input,
    }
}

// ==============================================================================
// Distribution Uniformity
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniformityGrade {
    High,
    Medium,
    Low,
    Minimal,
}

impl UniformityGrade {
    fn from_score(score: f64) -> Self {
        if score > 80.0 {
            Self::High
        } else if score > 60.0 {
            Self::Medium
        } else if score > 40.0 {
            Self::Low
        } else {
            Self::Minimal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Uniformity {
    /// Plain Gini coefficient, `(2·Σ(i+1)·v_i)/(n·Σv) − (n+1)/n`.
    pub gini_coefficient: f64,
    /// `(1 − G')·100` where `G' = G·n/(n−1)` rescales the Gini so the most
    /// unequal distribution of `n` values scores exactly 0.
    pub uniformity_score: f64,
    pub grade: UniformityGrade,
}

/// Gini-based uniformity of a value distribution.
///
/// Returns `None` for fewer than two values or an all-zero sequence.
#[must_use]
pub fn distribution_uniformity(values: &[f64]) -> Option<Uniformity> {
    if values.len() < 2 {
        return None;
    }
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();
    let gini = (2.0 * weighted) / (n * total) - (n + 1.0) / n;
    let normalized = gini * n / (n - 1.0);
    let uniformity_score = ((1.0 - normalized) * 100.0).clamp(0.0, 100.0);

    Some(Uniformity {
        gini_coefficient: gini,
        uniformity_score,
        grade: UniformityGrade::from_score(uniformity_score),
    })
}

// ==============================================================================
// Value Buckets
// ==============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueBucket {
    pub count: usize,
    pub total_value: f64,
    /// Share of all values by count.
    pub percentage: f64,
}

/// Values split by their ratio to the mean: `< 0.5` small, `0.5..=1.5`
/// medium, `> 1.5` large.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueBuckets {
    pub small: ValueBucket,
    pub medium: ValueBucket,
    pub large: ValueBucket,
}

#[must_use]
pub fn categorize_values(values: &[f64]) -> Option<ValueBuckets> {
    let avg = mean(values)?;
    if avg <= 0.0 {
        return None;
    }

    let mut buckets = ValueBuckets::default();
    for &value in values {
        let ratio = value / avg;
        let bucket = if ratio < 0.5 {
            &mut buckets.small
        } else if ratio <= 1.5 {
            &mut buckets.medium
        } else {
            &mut buckets.large
        };
        bucket.count += 1;
        bucket.total_value += value;
    }

    let n = values.len() as f64;
    for bucket in [&mut buckets.small, &mut buckets.medium, &mut buckets.large] {
        bucket.percentage = bucket.count as f64 / n * 100.0;
    }
    Some(buckets)
}

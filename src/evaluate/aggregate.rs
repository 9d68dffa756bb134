//! Cross-case summary statistics.

use std::collections::BTreeMap;

use serde::Serialize;

use super::metrics::CaseMetrics;

/// Summary of one metric. `mean` holds the NaN-ignoring median, the key
/// name is kept for leaderboard compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub mean: f64,
    pub std: f64,
}

impl Aggregate {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            mean: nan_median(values),
            std: nan_std(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregates {
    #[serde(rename = "Dice")]
    pub dice: Aggregate,
    #[serde(rename = "Hausdorff")]
    pub hausdorff: Aggregate,
    #[serde(rename = "Volumetric_similarity")]
    pub volumetric_similarity: Aggregate,
}

impl Aggregates {
    pub fn from_cases(cases: &BTreeMap<String, CaseMetrics>) -> Self {
        let column = |f: fn(&CaseMetrics) -> f64| -> Vec<f64> { cases.values().map(f).collect() };
        Self {
            dice: Aggregate::from_values(&column(|m| m.dice)),
            hausdorff: Aggregate::from_values(&column(|m| m.hausdorff)),
            volumetric_similarity: Aggregate::from_values(&column(|m| m.volumetric_similarity)),
        }
    }
}

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| !v.is_nan()).collect()
}

/// Median of the non-NaN values, `NaN` when there are none.
pub fn nan_median(values: &[f64]) -> f64 {
    let mut kept = finite(values);
    if kept.is_empty() {
        return f64::NAN;
    }
    kept.sort_by(f64::total_cmp);
    let mid = kept.len() / 2;
    if kept.len().is_multiple_of(2) {
        (kept[mid - 1] + kept[mid]) / 2.0
    } else {
        kept[mid]
    }
}

/// Population standard deviation of the non-NaN values, `NaN` when there
/// are none.
pub fn nan_std(values: &[f64]) -> f64 {
    let kept = finite(values);
    if kept.is_empty() {
        return f64::NAN;
    }
    let n = kept.len() as f64;
    let mean = kept.iter().sum::<f64>() / n;
    let variance = kept.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}

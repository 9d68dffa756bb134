//! Overlap, surface distance and volume agreement between a predicted and a
//! ground-truth segmentation.
//!
//! Undefined results are `NaN` and end up as `null` in the metrics document.

use serde::Serialize;

use super::kdtree::KdTree;
use super::morphology::{boundary, set_indices};
use crate::error::ToolboxError;
use crate::volume::{Geometry, Volume};

/// Scores of one case, named as on the leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CaseMetrics {
    #[serde(rename = "Dice")]
    pub dice: f64,
    #[serde(rename = "Hausdorff")]
    pub hausdorff: f64,
    #[serde(rename = "Volumetric_similarity")]
    pub volumetric_similarity: f64,
}

impl CaseMetrics {
    pub fn compute(ground_truth: &Volume, prediction: &Volume) -> Result<Self, ToolboxError> {
        if ground_truth.size() != prediction.size() {
            return Err(ToolboxError::GeometryMismatch {
                prediction: prediction.size(),
                ground_truth: ground_truth.size(),
            });
        }
        Ok(Self {
            dice: dice(ground_truth, prediction),
            hausdorff: hausdorff_95(ground_truth, prediction),
            volumetric_similarity: volumetric_similarity(ground_truth, prediction),
        })
    }
}

/// Dice coefficient of the non-zero masks, `NaN` when both are empty.
pub fn dice(ground_truth: &Volume, prediction: &Volume) -> f64 {
    let (mut tt, mut tf, mut ft) = (0_u64, 0_u64, 0_u64);
    for (&a, &b) in ground_truth.voxels.iter().zip(prediction.voxels.iter()) {
        match (a != 0.0, b != 0.0) {
            (true, true) => tt += 1,
            (true, false) => tf += 1,
            (false, true) => ft += 1,
            (false, false) => {}
        }
    }
    let mismatch = (tf + ft) as f64;
    let distance = mismatch / (2.0 * tt as f64 + mismatch);
    1.0 - distance
}

/// 95th percentile symmetric surface distance in millimetres.
///
/// Surfaces are the voxels removed by a radius-1 erosion. Both surfaces are
/// placed in physical space with the ground-truth geometry. `NaN` when the
/// prediction is empty or the ground truth has no surface.
pub fn hausdorff_95(ground_truth: &Volume, prediction: &Volume) -> f64 {
    if prediction.sum() == 0.0 {
        return f64::NAN;
    }

    let geometry = &ground_truth.geometry;
    let truth_surface = surface_points(&ground_truth.mask(), geometry);
    let predicted_surface = surface_points(&prediction.mask(), geometry);
    if truth_surface.is_empty() || predicted_surface.is_empty() {
        return f64::NAN;
    }

    let to_truth = nearest_distances(&truth_surface, &predicted_surface);
    let to_prediction = nearest_distances(&predicted_surface, &truth_surface);
    percentile(&to_truth, 95.0).max(percentile(&to_prediction, 95.0))
}

fn surface_points(mask: &ndarray::Array3<bool>, geometry: &Geometry) -> Vec<[f64; 3]> {
    set_indices(&boundary(mask))
        .into_iter()
        .map(|[x, y, z]| geometry.index_to_physical([x as f64, y as f64, z as f64]))
        .collect()
}

/// Distance from every query point to the closest point of `reference`.
fn nearest_distances(reference: &[[f64; 3]], queries: &[[f64; 3]]) -> Vec<f64> {
    let tree = KdTree::new(reference);
    queries
        .iter()
        .filter_map(|q| tree.nearest_distance(q))
        .collect()
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// `1 - |ΣGT - ΣP| / (ΣGT + ΣP)` over voxel values, `NaN` when both sums
/// are zero.
pub fn volumetric_similarity(ground_truth: &Volume, prediction: &Volume) -> f64 {
    let (a, b) = (ground_truth.sum(), prediction.sum());
    let denominator = a + b;
    if denominator > 0.0 {
        1.0 - (a - b).abs() / denominator
    } else {
        f64::NAN
    }
}

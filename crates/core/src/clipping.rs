//! Per-example gradient clipping for bounded sensitivity.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};

/// Dynamic-dimensional gradient tensor.
pub type Tensor = ArrayD<f64>;

/// Neighboring relation used for sensitivity calculations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighboringRelation {
    /// Add or remove a single example.
    #[default]
    AddOrRemoveOne,
    /// Replace a single example.
    ReplaceOne,
}

impl NeighboringRelation {
    /// L2 sensitivity of a sum of gradients clipped to `clip_norm`.
    pub fn sensitivity(self, clip_norm: f64) -> f64 {
        match self {
            NeighboringRelation::AddOrRemoveOne => clip_norm,
            NeighboringRelation::ReplaceOne => 2.0 * clip_norm,
        }
    }
}

/// Outcome of clipping one gradient.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipReport {
    /// L2 norm before clipping, after non-finite entries were zeroed.
    pub original_norm: f64,
    /// Scale factor applied to the gradient.
    pub scale: f64,
}

impl ClipReport {
    /// Whether the gradient was shrunk.
    pub fn clipped(&self) -> bool {
        self.scale < 1.0
    }
}

/// L2 norm of a tensor; NaN propagates, infinities yield infinity.
pub fn l2_norm(t: &Tensor) -> f64 {
    let mut sum_sq = 0.0;
    for &v in t.iter() {
        if v.is_nan() {
            return f64::NAN;
        }
        if v.is_infinite() {
            return f64::INFINITY;
        }
        sum_sq += v * v;
    }
    sum_sq.sqrt()
}

/// Zero out NaN and infinite entries in place.
pub fn sanitize(t: &mut Tensor) {
    t.mapv_inplace(|x| if x.is_finite() { x } else { 0.0 });
}

/// Clip a per-example gradient to `clip_norm` in place.
///
/// With `rescale_to_unit_norm` the clipped gradient is further divided by
/// `clip_norm`, so the sensitivity of the sum becomes 1.
pub fn clip_gradient(grad: &mut Tensor, clip_norm: f64, rescale_to_unit_norm: bool) -> ClipReport {
    sanitize(grad);
    let norm = l2_norm(grad);

    if !clip_norm.is_finite() || clip_norm <= 0.0 || norm == 0.0 {
        grad.fill(0.0);
        return ClipReport {
            original_norm: norm,
            scale: 0.0,
        };
    }

    let mut scale = (clip_norm / norm).min(1.0);
    if rescale_to_unit_norm {
        scale /= clip_norm;
    }
    if scale != 1.0 {
        grad.mapv_inplace(|x| x * scale);
    }
    ClipReport {
        original_norm: norm,
        scale,
    }
}

/// Clip every example and return the sum plus per-example reports.
///
/// All examples must share the shape of the first one.
pub fn clip_and_sum(
    examples: &[Tensor],
    clip_norm: f64,
    rescale_to_unit_norm: bool,
) -> Result<(Tensor, Vec<ClipReport>)> {
    let first = examples
        .first()
        .ok_or_else(|| DpError::invalid("examples must be non-empty"))?;
    let mut sum = Tensor::zeros(first.raw_dim());
    let mut reports = Vec::with_capacity(examples.len());
    for example in examples {
        if example.raw_dim() != sum.raw_dim() {
            return Err(DpError::invalid(format!(
                "gradient shape {:?} does not match {:?}",
                example.shape(),
                sum.shape()
            )));
        }
        let mut grad = example.clone();
        reports.push(clip_gradient(&mut grad, clip_norm, rescale_to_unit_norm));
        sum += &grad;
    }
    Ok((sum, reports))
}

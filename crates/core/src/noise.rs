//! Gaussian noise injection and update aggregation for DP-SGD.
//!
//! Clipped per-example gradients are summed over every micro-step of a
//! virtual batch. Noise is added once per parameter update, with standard
//! deviation `noise_multiplier * sensitivity`, and the noisy sum is divided
//! by the logical batch size.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::clipping::{clip_and_sum, NeighboringRelation, Tensor};
use crate::error::{DpError, Result};

/// Add i.i.d. Gaussian noise with standard deviation `stddev` in place.
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    tensor: &mut Tensor,
    stddev: f64,
    rng: &mut R,
) -> Result<()> {
    if stddev == 0.0 {
        return Ok(());
    }
    let dist = Normal::new(0.0, stddev)
        .map_err(|e| DpError::invalid(format!("invalid noise stddev {stddev}: {e}")))?;
    tensor.mapv_inplace(|x| x + dist.sample(rng));
    Ok(())
}

/// Clip-then-noise aggregation of per-example gradients.
#[derive(Clone, Debug, PartialEq)]
pub struct DpSgdAggregator {
    /// L2 clipping norm for per-example gradients.
    pub clipping_norm: f64,
    /// Noise multiplier (noise stddev relative to sensitivity).
    pub noise_multiplier: f64,
    /// Whether clipped gradients are rescaled to unit norm.
    pub rescale_to_unit_norm: bool,
    /// Neighboring relation determining the sensitivity of the sum.
    pub neighboring_relation: NeighboringRelation,
}

/// Running sum of clipped gradients within one virtual batch.
#[derive(Clone, Debug, Default)]
pub struct AccumulatorState {
    sum: Option<Tensor>,
    num_examples: usize,
    num_micro_steps: usize,
}

impl AccumulatorState {
    /// Number of (non-padding) examples accumulated so far.
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    /// Number of micro-steps accumulated so far.
    pub fn num_micro_steps(&self) -> usize {
        self.num_micro_steps
    }
}

impl DpSgdAggregator {
    /// Create an aggregator after validating its parameters.
    pub fn new(clipping_norm: f64, noise_multiplier: f64, rescale_to_unit_norm: bool) -> Result<Self> {
        if !clipping_norm.is_finite() || clipping_norm <= 0.0 {
            return Err(DpError::invalid("clipping_norm must be positive and finite"));
        }
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid(
                "noise_multiplier must be non-negative and finite",
            ));
        }
        Ok(Self {
            clipping_norm,
            noise_multiplier,
            rescale_to_unit_norm,
            neighboring_relation: NeighboringRelation::AddOrRemoveOne,
        })
    }

    /// Use a different neighboring relation.
    pub fn with_neighboring_relation(mut self, relation: NeighboringRelation) -> Self {
        self.neighboring_relation = relation;
        self
    }

    /// L2 sensitivity of the clipped sum.
    pub fn sensitivity(&self) -> f64 {
        let bound = if self.rescale_to_unit_norm {
            1.0
        } else {
            self.clipping_norm
        };
        self.neighboring_relation.sensitivity(bound)
    }

    /// Standard deviation of the noise added to the clipped sum.
    pub fn noise_stddev(&self) -> f64 {
        self.noise_multiplier * self.sensitivity()
    }

    /// Clip one micro-batch of per-example gradients and add them to `state`.
    pub fn accumulate(&self, state: &mut AccumulatorState, per_example: &[Tensor]) -> Result<()> {
        let (sum, _) = clip_and_sum(per_example, self.clipping_norm, self.rescale_to_unit_norm)?;
        if let Some(acc) = state.sum.as_mut() {
            if acc.raw_dim() != sum.raw_dim() {
                return Err(DpError::invalid(format!(
                    "micro-batch gradient shape {:?} does not match accumulated {:?}",
                    sum.shape(),
                    acc.shape()
                )));
            }
            *acc += &sum;
        } else {
            state.sum = Some(sum);
        }
        state.num_examples += per_example.len();
        state.num_micro_steps += 1;
        Ok(())
    }

    /// Privatize the accumulated sum and normalise by the logical batch size.
    pub fn finalize<R: Rng + ?Sized>(
        &self,
        state: AccumulatorState,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        if batch_size == 0 {
            return Err(DpError::invalid("batch_size must be positive"));
        }
        let mut sum = state
            .sum
            .ok_or_else(|| DpError::invalid("no gradients were accumulated"))?;
        let stddev = self.noise_stddev();
        add_gaussian_noise(&mut sum, stddev, rng)?;
        debug!(
            micro_steps = state.num_micro_steps,
            examples = state.num_examples,
            batch_size,
            stddev,
            "applied noisy update"
        );
        let scale = 1.0 / batch_size as f64;
        sum.mapv_inplace(|x| x * scale);
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn gaussian_noise_is_deterministic_per_seed() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t1 = Array1::zeros(64).into_dyn();
        add_gaussian_noise(&mut t1, 1.0, &mut rng).expect("noise");

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut t2 = Array1::zeros(64).into_dyn();
        add_gaussian_noise(&mut t2, 1.0, &mut rng).expect("noise");

        assert_eq!(t1, t2);
    }

    #[test]
    fn gaussian_noise_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let mut t = Array1::zeros(10_000).into_dyn();
        add_gaussian_noise(&mut t, 2.0, &mut rng).expect("noise");

        let n = t.len() as f64;
        let mean = t.iter().sum::<f64>() / n;
        let var = t.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.1);
        assert!((var - 4.0).abs() < 0.3);
    }

    #[test]
    fn negative_stddev_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut t = Array1::zeros(4).into_dyn();
        assert!(add_gaussian_noise(&mut t, -1.0, &mut rng).is_err());
    }

    #[test]
    fn noiseless_update_is_clipped_mean() {
        let agg = DpSgdAggregator::new(1.0, 0.0, false).expect("aggregator");
        let mut state = AccumulatorState::default();
        agg.accumulate(&mut state, &[array![3.0, 4.0].into_dyn()])
            .expect("micro-step");
        agg.accumulate(&mut state, &[array![0.0, 0.5].into_dyn()])
            .expect("micro-step");
        assert_eq!(state.num_micro_steps(), 2);
        assert_eq!(state.num_examples(), 2);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let update = agg.finalize(state, 2, &mut rng).expect("update");
        assert!((update[[0]] - 0.3).abs() < 1e-12);
        assert!((update[[1]] - 0.65).abs() < 1e-12);
    }

    #[test]
    fn noise_scales_with_sensitivity() {
        let agg = DpSgdAggregator::new(2.0, 1.5, false).expect("aggregator");
        assert!((agg.noise_stddev() - 3.0).abs() < 1e-12);
        let agg = agg.with_neighboring_relation(NeighboringRelation::ReplaceOne);
        assert!((agg.noise_stddev() - 6.0).abs() < 1e-12);
        let unit = DpSgdAggregator::new(2.0, 1.5, true).expect("aggregator");
        assert!((unit.noise_stddev() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn finalize_without_gradients_fails() {
        let agg = DpSgdAggregator::new(1.0, 1.0, false).expect("aggregator");
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(agg.finalize(AccumulatorState::default(), 8, &mut rng).is_err());
    }
}

//! Privacy analysis of DP-SGD training runs.
//!
//! A run is described by [`DpParams`]: piecewise-constant noise and batch
//! size schedules over update steps. The schedules are interleaved into
//! constant regimes, identical regimes are merged, and each distinct
//! regime is composed once by the underlying [`Accountant`].

use std::collections::BTreeSet;

use tracing::debug;

use dpsgd_core::{DpError, Result};

use crate::accountants::{
    Accountant, AccountantConfig, CompositionSegment, DpAccountantConfig, PldAccountantConfig,
    RdpAccountantConfig,
};
use crate::rdp::RdpAccountant;
use crate::{DpParams, Schedule};

fn interleave_schedules(noise: &[(u64, f64)], batches: &[(u64, usize)]) -> Vec<(u64, f64, usize)> {
    let mut steps: BTreeSet<u64> = noise.iter().map(|(t, _)| *t).collect();
    steps.extend(batches.iter().map(|(t, _)| *t));

    let mut noise_idx = 0usize;
    let mut batch_idx = 0usize;
    let mut out = Vec::with_capacity(steps.len());

    for step in steps {
        while noise_idx + 1 < noise.len() && noise[noise_idx + 1].0 <= step {
            noise_idx += 1;
        }
        while batch_idx + 1 < batches.len() && batches[batch_idx + 1].0 <= step {
            batch_idx += 1;
        }
        out.push((step, noise[noise_idx].1, batches[batch_idx].1));
    }
    out
}

/// Interleave noise multipliers and batch sizes into `(duration, nm, bs)`
/// regimes covering steps `0..num_steps`.
///
/// A change point at step `t` applies from step `t` onwards. Regimes of zero
/// duration are omitted.
pub fn interleave_nm_and_bs(
    noise_schedule: &Schedule<f64>,
    batch_schedule: &Schedule<usize>,
    num_steps: u64,
) -> Vec<(u64, f64, usize)> {
    if num_steps == 0 {
        return Vec::new();
    }
    // Points at `num_steps` or later never take effect.
    let last = num_steps - 1;
    let noise = noise_schedule.normalize(last);
    let batches = batch_schedule.normalize(last);
    if noise.is_empty() || batches.is_empty() {
        return Vec::new();
    }

    let interleaved = interleave_schedules(&noise, &batches);
    let mut segments = Vec::with_capacity(interleaved.len());
    for pair in interleaved.windows(2) {
        let (step, nm, bs) = pair[0];
        let next_step = pair[1].0;
        if next_step > step {
            segments.push((next_step - step, nm, bs));
        }
    }
    if let Some(&(last_step, last_nm, last_bs)) = interleaved.last() {
        if num_steps > last_step {
            segments.push((num_steps - last_step, last_nm, last_bs));
        }
    }
    segments
}

/// Privacy accounting interface for training procedures.
pub trait DpTrainingAccountant {
    /// Whether the number of steps can be calibrated.
    fn can_calibrate_steps(&self) -> bool;
    /// Whether the batch size can be calibrated.
    fn can_calibrate_batch_size(&self) -> bool;
    /// Whether the noise multiplier can be calibrated.
    fn can_calibrate_noise_multipliers(&self) -> bool;

    /// Validate parameter compatibility.
    fn validate(&self, dp_params: &DpParams, num_updates: u64) -> Result<()>;

    /// Compute epsilon for the given updates and parameters.
    fn compute_epsilon_impl(&self, num_updates: u64, dp_params: &DpParams) -> Result<f64>;

    /// Compute epsilon with shared guard rails. Zero updates spend nothing.
    fn compute_epsilon(&self, num_updates: u64, dp_params: &DpParams) -> Result<f64> {
        if num_updates == 0 {
            return Ok(0.0);
        }
        self.validate(dp_params, num_updates)?;
        self.compute_epsilon_impl(num_updates, dp_params)
    }
}

/// DP-SGD accountant over Poisson-subsampled Gaussian steps.
#[derive(Clone, Debug)]
pub struct DpsgdTrainingAccountant {
    accountant: Accountant,
}

impl Default for DpsgdTrainingAccountant {
    fn default() -> Self {
        Self::new(Accountant::Rdp(RdpAccountant::new()))
    }
}

impl DpsgdTrainingAccountant {
    /// Wrap an existing accountant.
    pub fn new(accountant: Accountant) -> Self {
        Self { accountant }
    }

    /// Build from an accountant configuration.
    pub fn from_config(config: &AccountantConfig) -> Result<Self> {
        Ok(Self::new(config.create_accountant()?))
    }

    /// Use an explicit RDP accountant configuration.
    pub fn with_rdp(config: RdpAccountantConfig) -> Result<Self> {
        Ok(Self::new(Accountant::Rdp(config.create_accountant()?)))
    }

    /// Use an explicit PLD accountant configuration.
    pub fn with_pld(config: PldAccountantConfig) -> Result<Self> {
        Ok(Self::new(Accountant::Pld(config.create_accountant()?)))
    }

    /// The underlying accountant.
    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    /// Distinct `(noise multiplier, sampling probability)` regimes of a run,
    /// in order of first appearance, with their total step counts.
    ///
    /// Noise multipliers are divided by the sampler's sensitivity multiplier.
    pub fn composition_segments(
        &self,
        num_updates: u64,
        dp_params: &DpParams,
    ) -> Result<Vec<CompositionSegment>> {
        let regimes =
            interleave_nm_and_bs(&dp_params.noise_multipliers, &dp_params.batch_sizes, num_updates);
        let sensitivity_multiplier = dp_params.sampler.sensitivity_multiplier();
        let num_samples = dp_params.num_samples as f64;

        let mut segments: Vec<CompositionSegment> = Vec::with_capacity(regimes.len());
        for (duration, nm, bs) in regimes {
            let noise_multiplier = nm / sensitivity_multiplier;
            let sampling_probability = bs as f64 / num_samples;
            match segments.iter_mut().find(|s| {
                s.noise_multiplier.to_bits() == noise_multiplier.to_bits()
                    && s.sampling_probability.to_bits() == sampling_probability.to_bits()
            }) {
                Some(existing) => existing.num_steps += duration,
                None => segments.push(CompositionSegment::new(
                    noise_multiplier,
                    sampling_probability,
                    duration,
                )),
            }
        }
        Ok(segments)
    }
}

impl DpTrainingAccountant for DpsgdTrainingAccountant {
    fn can_calibrate_steps(&self) -> bool {
        true
    }

    fn can_calibrate_batch_size(&self) -> bool {
        true
    }

    fn can_calibrate_noise_multipliers(&self) -> bool {
        true
    }

    fn validate(&self, dp_params: &DpParams, _num_updates: u64) -> Result<()> {
        dp_params.validate()
    }

    fn compute_epsilon_impl(&self, num_updates: u64, dp_params: &DpParams) -> Result<f64> {
        let segments = self.composition_segments(num_updates, dp_params)?;
        if segments.is_empty() {
            return Err(DpError::invalid("training run has no accountable regimes"));
        }
        debug!(
            num_updates,
            regimes = segments.len(),
            method = self.accountant.method_name(),
            "accounting training run"
        );
        self.accountant.compose_epsilon(&segments, dp_params.delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sampler;

    #[test]
    fn test_interleave_nm_and_bs() {
        let noise = Schedule::timed(vec![(0, 1.0), (5, 2.0)]);
        let batches = Schedule::timed(vec![(0, 10), (3, 20)]);
        let segments = interleave_nm_and_bs(&noise, &batches, 10);
        assert_eq!(segments, vec![(3, 1.0, 10), (2, 1.0, 20), (5, 2.0, 20)]);
    }

    #[test]
    fn change_points_beyond_horizon_are_ignored() {
        let noise = Schedule::constant(1.0);
        let batches = Schedule::timed(vec![(0, 10), (10, 20)]);
        assert_eq!(interleave_nm_and_bs(&noise, &batches, 10), vec![(10, 1.0, 10)]);
        assert!(interleave_nm_and_bs(&noise, &batches, 0).is_empty());
    }

    #[test]
    fn test_dpsgd_accountant_runs() {
        let params = DpParams::new(1.0, 1000, 10, 1e-5).expect("valid params");
        let accountant = DpsgdTrainingAccountant::default();
        let eps = accountant.compute_epsilon(10, &params).expect("epsilon");
        assert!(eps.is_finite());
        assert_eq!(accountant.compute_epsilon(0, &params).expect("zero"), 0.0);
    }

    #[test]
    fn repeated_regimes_are_merged() {
        let params = DpParams::new(1.0, 1000, 10, 1e-5)
            .and_then(|p| p.with_batch_sizes(Schedule::timed(vec![(0, 10), (5, 20), (8, 10)])))
            .expect("valid params");
        let accountant = DpsgdTrainingAccountant::default();
        let segments = accountant.composition_segments(12, &params).expect("segments");
        assert_eq!(
            segments,
            vec![
                CompositionSegment::new(1.0, 0.01, 9),
                CompositionSegment::new(1.0, 0.02, 3),
            ]
        );
    }

    #[test]
    fn scheduled_run_matches_manual_composition() {
        let params = DpParams::new(1.5, 10_000, 64, 1e-5)
            .and_then(|p| p.with_batch_sizes(Schedule::timed(vec![(0, 64), (100, 128)])))
            .expect("valid params");
        let accountant = DpsgdTrainingAccountant::default();
        let eps = accountant.compute_epsilon(300, &params).expect("epsilon");
        let manual = accountant
            .accountant()
            .compose_epsilon(
                &[
                    CompositionSegment::new(1.5, 0.0064, 100),
                    CompositionSegment::new(1.5, 0.0128, 200),
                ],
                1e-5,
            )
            .expect("manual");
        assert!((eps - manual).abs() < 1e-12);
    }

    #[test]
    fn fixed_sampler_halves_noise() {
        let poisson = DpParams::new(2.0, 1000, 10, 1e-5).expect("valid params");
        let fixed = poisson.clone().with_sampler(Sampler::Fixed);
        let accountant = DpsgdTrainingAccountant::default();
        let eps_poisson = accountant.compute_epsilon(100, &poisson).expect("poisson");
        let eps_fixed = accountant.compute_epsilon(100, &fixed).expect("fixed");
        assert!(eps_fixed > eps_poisson);
        let halved = DpParams::new(1.0, 1000, 10, 1e-5).expect("valid params");
        let eps_halved = accountant.compute_epsilon(100, &halved).expect("halved");
        assert!((eps_fixed - eps_halved).abs() < 1e-12);
    }
}

//! Resolved DP-SGD training setup.
//!
//! [`DpTrainingSetup`] turns a [`DpTrainingConfig`] into the pieces a
//! training loop needs: validated virtual batching, a noise multiplier that
//! meets the privacy budget, an accountant for reporting spent epsilon, and
//! a clip-then-noise aggregator.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{info, warn};

use dpsgd_accounting::{
    calibrate_noise_multiplier_for_params, DpParams, DpTrainingAccountant,
    DpsgdTrainingAccountant, Schedule,
};
use dpsgd_core::{AccumulatorState, DpError, DpSgdAggregator, Result, Tensor, VirtualBatching};

use crate::config::DpTrainingConfig;

/// Everything a DP-SGD training loop needs, resolved from a config.
#[derive(Clone, Debug)]
pub struct DpTrainingSetup {
    config: DpTrainingConfig,
    batching: VirtualBatching,
    accountant: DpsgdTrainingAccountant,
    params: DpParams,
    noise_multiplier: f64,
    planned_epsilon: f64,
}

impl DpTrainingSetup {
    /// Validate `config`, build its batching and accountant, and resolve the
    /// noise multiplier.
    ///
    /// Without a fixed noise multiplier, the smallest one meeting the budget
    /// over `num_updates` is calibrated. A fixed noise multiplier that would
    /// overspend the budget is rejected.
    pub fn from_config(config: &DpTrainingConfig) -> Result<Self> {
        config.validate()?;
        let batching = config.batching.build()?;
        let accountant = DpsgdTrainingAccountant::from_config(&config.accountant)?;
        let budget = config.budget;

        let params = DpParams::new(1.0, config.num_samples, batching.batch_size_init(), budget.delta())?
            .with_batch_sizes(Schedule::from(batching.schedule()))?
            .with_sampler(config.sampler);

        let noise_multiplier = match config.noise_multiplier {
            Some(noise_multiplier) => noise_multiplier,
            None => calibrate_noise_multiplier_for_params(
                budget.epsilon(),
                &accountant,
                &params,
                config.num_updates,
                &config.calibration,
            )?,
        };
        let params = params.with_noise_schedule(Schedule::constant(noise_multiplier))?;
        let planned_epsilon = accountant.compute_epsilon(config.num_updates, &params)?;

        if planned_epsilon > budget.epsilon() {
            warn!(
                noise_multiplier,
                planned_epsilon,
                target_epsilon = budget.epsilon(),
                "noise multiplier overspends the privacy budget"
            );
            return Err(DpError::invalid(format!(
                "noise multiplier {noise_multiplier} spends epsilon {planned_epsilon} over {} \
                 updates, exceeding the budget {}",
                config.num_updates,
                budget.epsilon()
            )));
        }

        info!(
            method = accountant.accountant().method_name(),
            noise_multiplier,
            planned_epsilon,
            delta = budget.delta(),
            num_updates = config.num_updates,
            batch_size_init = batching.batch_size_init(),
            "training setup ready"
        );

        Ok(Self {
            config: config.clone(),
            batching,
            accountant,
            params,
            noise_multiplier,
            planned_epsilon,
        })
    }

    /// The configuration this setup was built from.
    pub fn config(&self) -> &DpTrainingConfig {
        &self.config
    }

    /// Resolved noise multiplier.
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    /// Virtual batching of the run.
    pub fn batching(&self) -> &VirtualBatching {
        &self.batching
    }

    /// Training accountant of the run.
    pub fn accountant(&self) -> &DpsgdTrainingAccountant {
        &self.accountant
    }

    /// Accounting parameters with the resolved noise multiplier.
    pub fn params(&self) -> &DpParams {
        &self.params
    }

    /// Epsilon spent by the full run of `num_updates` updates.
    pub fn planned_epsilon(&self) -> f64 {
        self.planned_epsilon
    }

    /// Epsilon spent after `num_updates` updates.
    pub fn epsilon_spent(&self, num_updates: u64) -> Result<f64> {
        self.accountant.compute_epsilon(num_updates, &self.params)
    }

    /// Clip-then-noise aggregator using the resolved noise multiplier.
    pub fn aggregator(&self) -> Result<DpSgdAggregator> {
        DpSgdAggregator::new(
            self.config.clipping_norm,
            self.noise_multiplier(),
            self.config.rescale_to_unit_norm,
        )
    }

    /// Noise RNG seeded from the config.
    pub fn rng(&self) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(self.config.noise_seed)
    }

    /// Aggregate the micro-batches of update `step` into one noisy,
    /// batch-averaged update.
    ///
    /// Exactly `apply_update_every(step)` micro-batches are expected.
    pub fn apply_update<R: Rng + ?Sized>(
        &self,
        step: u64,
        micro_batches: &[Vec<Tensor>],
        rng: &mut R,
    ) -> Result<Tensor> {
        let expected = self.batching.apply_update_every(step);
        if micro_batches.len() != expected {
            return Err(DpError::invalid(format!(
                "update {step} expects {expected} micro-batches, got {}",
                micro_batches.len()
            )));
        }
        let aggregator = self.aggregator()?;
        let mut state = AccumulatorState::default();
        for micro_batch in micro_batches {
            aggregator.accumulate(&mut state, micro_batch)?;
        }
        aggregator.finalize(state, self.batching.batch_size(step), rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchingConfig;
    use dpsgd_accounting::PrivacyBudget;

    fn config() -> DpTrainingConfig {
        DpTrainingConfig::new(
            PrivacyBudget::new(2.0, 1e-5).expect("budget"),
            BatchingConfig::new(64, 16, 2),
            10_000,
            200,
            1.0,
        )
    }

    #[test]
    fn calibrated_setup_meets_budget() {
        let setup = DpTrainingSetup::from_config(&config()).expect("setup");
        assert!(setup.noise_multiplier() > 0.0);
        assert!(setup.planned_epsilon() <= 2.0);
        assert!(setup.planned_epsilon() > 1.9);
        assert_eq!(setup.epsilon_spent(0).expect("zero"), 0.0);
        assert!(setup.epsilon_spent(100).expect("half") < setup.planned_epsilon());
    }

    #[test]
    fn fixed_noise_multiplier_is_checked() {
        let mut cfg = config();
        cfg.noise_multiplier = Some(5.0);
        let setup = DpTrainingSetup::from_config(&cfg).expect("setup");
        assert_eq!(setup.noise_multiplier(), 5.0);

        cfg.noise_multiplier = Some(0.3);
        let err = DpTrainingSetup::from_config(&cfg).unwrap_err();
        assert!(err.is_invalid_parameter());
    }

    #[test]
    fn apply_update_checks_micro_batch_count() {
        let mut cfg = config();
        cfg.noise_multiplier = Some(5.0);
        let setup = DpTrainingSetup::from_config(&cfg).expect("setup");
        let mut rng = setup.rng();
        let micro_batch = vec![Tensor::zeros(ndarray::IxDyn(&[3])); 32];
        let err = setup
            .apply_update(0, &[micro_batch.clone()], &mut rng)
            .unwrap_err();
        assert!(err.is_invalid_parameter());
        let update = setup
            .apply_update(0, &[micro_batch.clone(), micro_batch], &mut rng)
            .expect("update");
        assert_eq!(update.shape(), &[3]);
    }
}

//! Calibration of DP hyper-parameters against a target epsilon.
//!
//! The noise multiplier is found by bisection in log space over a fixed
//! bracket. The returned value is always the end of the bracket whose
//! epsilon is at most the target, so the guarantee holds for the result
//! itself and not only for a nearby value.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dpsgd_core::{DpError, Result};

use crate::{DpParams, DpTrainingAccountant, Schedule};

/// Hard cap for the number of updates explored by [`calibrate_num_updates`].
const MAX_CALIBRATED_UPDATES: u64 = 1 << 40;

/// Search bracket and stopping rule for noise calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Smallest noise multiplier considered.
    pub lower_noise_multiplier: f64,
    /// Largest noise multiplier considered.
    pub upper_noise_multiplier: f64,
    /// Accepted relative gap between the achieved and target epsilon.
    pub relative_tolerance: f64,
    /// Bisection steps before giving up.
    pub max_iterations: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            lower_noise_multiplier: 1e-2,
            upper_noise_multiplier: 500.0,
            relative_tolerance: 1e-3,
            max_iterations: 100,
        }
    }
}

impl CalibrationConfig {
    /// Check the bracket and stopping rule.
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = (self.lower_noise_multiplier, self.upper_noise_multiplier);
        if !lo.is_finite() || !hi.is_finite() || lo <= 0.0 || hi <= lo {
            return Err(DpError::invalid(format!(
                "noise multiplier bracket must satisfy 0 < lower < upper, got [{lo}, {hi}]"
            )));
        }
        if !self.relative_tolerance.is_finite()
            || self.relative_tolerance <= 0.0
            || self.relative_tolerance >= 1.0
        {
            return Err(DpError::invalid(format!(
                "relative_tolerance must be in (0, 1), got {}",
                self.relative_tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(DpError::invalid("max_iterations must be positive"));
        }
        Ok(())
    }
}

fn validate_target(target_epsilon: f64) -> Result<()> {
    if !target_epsilon.is_finite() || target_epsilon <= 0.0 {
        return Err(DpError::invalid(format!(
            "target epsilon must be positive and finite, got {target_epsilon}"
        )));
    }
    Ok(())
}

/// Smallest noise multiplier in the bracket whose epsilon is at most
/// `target_epsilon`, up to the relative tolerance.
///
/// `epsilon_for` must be non-increasing. A numerical instability at the upper
/// end of the bracket is returned to the caller; below it, one counts as
/// infinite epsilon.
pub(crate) fn search_noise_multiplier<F>(
    epsilon_for: F,
    target_epsilon: f64,
    config: &CalibrationConfig,
) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    config.validate()?;
    validate_target(target_epsilon)?;

    let eval_end = |noise_multiplier: f64| -> Result<f64> {
        let eps = epsilon_for(noise_multiplier)?;
        if eps.is_nan() {
            return Err(DpError::numerical(format!(
                "epsilon is NaN at noise multiplier {noise_multiplier}"
            )));
        }
        Ok(eps)
    };
    // Below a noise multiplier the upper end represents, an unrepresentable
    // loss range only occurs for too little noise: epsilon is unbounded there.
    let eval_below = |noise_multiplier: f64| -> Result<f64> {
        match eval_end(noise_multiplier) {
            Err(err) if err.is_numerical_instability() => {
                debug!(noise_multiplier, %err, "treating unrepresentable epsilon as infinite");
                Ok(f64::INFINITY)
            }
            other => other,
        }
    };

    let mut lo = config.lower_noise_multiplier;
    let mut hi = config.upper_noise_multiplier;

    let mut eps_hi = eval_end(hi)?;
    if eps_hi > target_epsilon {
        warn!(target_epsilon, upper = hi, eps_hi, "target epsilon is unreachable");
        return Err(DpError::calibration(format!(
            "target epsilon {target_epsilon} is unreachable: noise multiplier {hi} \
             still spends epsilon {eps_hi}"
        )));
    }
    let eps_lo = eval_below(lo)?;
    if eps_lo <= target_epsilon {
        warn!(target_epsilon, lower = lo, eps_lo, "target epsilon is met by the smallest noise");
        return Err(DpError::calibration(format!(
            "target epsilon {target_epsilon} is already met at noise multiplier {lo} \
             (epsilon {eps_lo}); lower the bracket to calibrate"
        )));
    }

    let tolerance = config.relative_tolerance * target_epsilon;
    for iteration in 0..config.max_iterations {
        if target_epsilon - eps_hi <= tolerance {
            info!(noise_multiplier = hi, epsilon = eps_hi, iteration, "calibrated noise multiplier");
            return Ok(hi);
        }
        if hi - lo <= f64::EPSILON * hi {
            info!(
                noise_multiplier = hi,
                epsilon = eps_hi,
                iteration,
                "noise bracket collapsed; returning conservative end"
            );
            return Ok(hi);
        }
        let mid = (lo * hi).sqrt();
        let eps_mid = eval_below(mid)?;
        debug!(iteration, lo, hi, mid, eps_mid, "calibration step");
        if eps_mid <= target_epsilon {
            hi = mid;
            eps_hi = eps_mid;
        } else {
            lo = mid;
        }
    }

    if target_epsilon - eps_hi <= tolerance {
        return Ok(hi);
    }
    warn!(
        max_iterations = config.max_iterations,
        lo, hi, eps_hi, "noise calibration did not converge"
    );
    Err(DpError::calibration(format!(
        "no convergence within {} iterations; best noise multiplier {hi} spends \
         epsilon {eps_hi} against target {target_epsilon}",
        config.max_iterations
    )))
}

/// Calibrate a constant noise multiplier so that training for
/// `num_updates` steps with Poisson sampling spends at most `target_epsilon`.
pub fn calibrate_noise_multiplier<A: DpTrainingAccountant>(
    target_epsilon: f64,
    target_delta: f64,
    accountant: &A,
    batch_sizes: impl Into<Schedule<usize>>,
    num_updates: u64,
    num_samples: usize,
    config: &CalibrationConfig,
) -> Result<f64> {
    let batch_sizes = batch_sizes.into();
    let first_batch = batch_sizes
        .value_at(0)
        .ok_or_else(|| DpError::invalid("batch schedule must have a value"))?;
    let params = DpParams::new(1.0, num_samples, first_batch, target_delta)?
        .with_batch_sizes(batch_sizes)?;
    calibrate_noise_multiplier_for_params(target_epsilon, accountant, &params, num_updates, config)
}

/// Like [`calibrate_noise_multiplier`], reusing the batch schedule, dataset
/// size, delta and sampler of `params`. Its noise schedule is ignored.
pub fn calibrate_noise_multiplier_for_params<A: DpTrainingAccountant>(
    target_epsilon: f64,
    accountant: &A,
    params: &DpParams,
    num_updates: u64,
    config: &CalibrationConfig,
) -> Result<f64> {
    if !accountant.can_calibrate_noise_multipliers() {
        return Err(DpError::unsupported(
            "accountant cannot calibrate noise multipliers",
        ));
    }
    if num_updates == 0 {
        return Err(DpError::invalid("num_updates must be positive"));
    }
    params.validate()?;

    let epsilon_for = |noise_multiplier: f64| -> Result<f64> {
        let candidate = params
            .clone()
            .with_noise_schedule(Schedule::constant(noise_multiplier))?;
        accountant.compute_epsilon(num_updates, &candidate)
    };
    search_noise_multiplier(epsilon_for, target_epsilon, config)
}

/// Largest number of updates whose epsilon stays within `target_epsilon`.
///
/// The search starts from `initial_max_updates` and doubles the upper end
/// until the budget is exceeded.
pub fn calibrate_num_updates<A: DpTrainingAccountant>(
    target_epsilon: f64,
    accountant: &A,
    params: &DpParams,
    initial_max_updates: u64,
) -> Result<u64> {
    if !accountant.can_calibrate_steps() {
        return Err(DpError::unsupported("accountant cannot calibrate steps"));
    }
    validate_target(target_epsilon)?;
    params.validate()?;
    let epsilon_for = |num_updates: u64| accountant.compute_epsilon(num_updates, params);

    let eps_one = epsilon_for(1)?;
    if eps_one > target_epsilon {
        return Err(DpError::calibration(format!(
            "a single update already spends epsilon {eps_one} against target {target_epsilon}"
        )));
    }

    let mut lo = 1u64;
    let mut hi = initial_max_updates.max(2);
    loop {
        if epsilon_for(hi)? > target_epsilon {
            break;
        }
        lo = hi;
        if hi >= MAX_CALIBRATED_UPDATES {
            return Err(DpError::calibration(format!(
                "budget is not exhausted within {MAX_CALIBRATED_UPDATES} updates"
            )));
        }
        hi = hi.saturating_mul(2).min(MAX_CALIBRATED_UPDATES);
    }

    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if epsilon_for(mid)? <= target_epsilon {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    info!(num_updates = lo, target_epsilon, "calibrated number of updates");
    Ok(lo)
}

/// Largest constant batch size whose epsilon over `num_updates` stays
/// within `target_epsilon`; capped at the dataset size.
pub fn calibrate_batch_size<A: DpTrainingAccountant>(
    target_epsilon: f64,
    accountant: &A,
    params: &DpParams,
    num_updates: u64,
) -> Result<usize> {
    if !accountant.can_calibrate_batch_size() {
        return Err(DpError::unsupported("accountant cannot calibrate batch size"));
    }
    validate_target(target_epsilon)?;
    if num_updates == 0 {
        return Err(DpError::invalid("num_updates must be positive"));
    }
    let epsilon_for = |batch_size: usize| -> Result<f64> {
        let candidate = params
            .clone()
            .with_batch_sizes(Schedule::constant(batch_size))?;
        accountant.compute_epsilon(num_updates, &candidate)
    };

    let eps_one = epsilon_for(1)?;
    if eps_one > target_epsilon {
        return Err(DpError::calibration(format!(
            "batch size 1 already spends epsilon {eps_one} against target {target_epsilon}"
        )));
    }
    let max_batch = params.num_samples;
    if epsilon_for(max_batch)? <= target_epsilon {
        return Ok(max_batch);
    }

    let (mut lo, mut hi) = (1usize, max_batch);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if epsilon_for(mid)? <= target_epsilon {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    info!(batch_size = lo, target_epsilon, "calibrated batch size");
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DpsgdTrainingAccountant, PldAccountantConfig};
    use proptest::prelude::*;

    #[test]
    fn bisection_returns_conservative_end() {
        let config = CalibrationConfig::default();
        let nm = search_noise_multiplier(|nm| Ok(10.0 / nm), 4.0, &config).expect("calibrated");
        assert!(10.0 / nm <= 4.0);
        assert!(10.0 / nm >= 4.0 * (1.0 - 1e-3));
    }

    #[test]
    fn unreachable_target_fails() {
        let config = CalibrationConfig::default();
        let err = search_noise_multiplier(|nm| Ok(1_000.0 / nm), 1.0, &config).unwrap_err();
        assert!(err.is_calibration_failure());
    }

    #[test]
    fn too_loose_target_fails() {
        let config = CalibrationConfig::default();
        let err = search_noise_multiplier(|nm| Ok(0.1 / nm), 100.0, &config).unwrap_err();
        assert!(err.is_calibration_failure());
    }

    #[test]
    fn instability_counts_as_infinite_epsilon() {
        let config = CalibrationConfig::default();
        let nm = search_noise_multiplier(
            |nm| {
                if nm < 1.0 {
                    Err(DpError::numerical("grid overflow"))
                } else {
                    Ok(3.0 / nm)
                }
            },
            1.5,
            &config,
        )
        .expect("calibrated");
        assert!(3.0 / nm <= 1.5);
    }

    #[test]
    fn instability_at_upper_end_is_reported() {
        let config = CalibrationConfig::default();
        let err = search_noise_multiplier(|_| Err(DpError::numerical("grid overflow")), 1.0, &config)
            .unwrap_err();
        assert!(err.is_numerical_instability());

        let accountant =
            DpsgdTrainingAccountant::with_pld(PldAccountantConfig::new(1e-10)).expect("accountant");
        let err = calibrate_noise_multiplier(1.0, 1e-5, &accountant, 256, 10, 10_000, &config)
            .unwrap_err();
        assert!(err.is_numerical_instability(), "{err}");
    }

    #[test]
    fn scheduled_batch_sizes_round_trip() {
        let accountant = DpsgdTrainingAccountant::default();
        let config = CalibrationConfig::default();
        let target = 2.0;
        let schedule = Schedule::timed(vec![(0, 64), (100, 128)]);
        let scheduled = calibrate_noise_multiplier(
            target,
            1e-5,
            &accountant,
            schedule.clone(),
            300,
            10_000,
            &config,
        )
        .expect("scheduled");
        let constant = calibrate_noise_multiplier(target, 1e-5, &accountant, 64, 300, 10_000, &config)
            .expect("constant");

        let params = DpParams::new(scheduled, 10_000, 64, 1e-5)
            .and_then(|p| p.with_batch_sizes(schedule))
            .expect("params");
        let eps = accountant.compute_epsilon(300, &params).expect("epsilon");
        assert!(eps <= target);
        assert!(eps >= target * (1.0 - config.relative_tolerance));
        // Larger later batches sample more often and need more noise.
        assert!(scheduled > constant, "scheduled {scheduled} vs constant {constant}");
    }

    #[test]
    fn invalid_inputs_are_parameter_errors() {
        let config = CalibrationConfig::default();
        assert!(search_noise_multiplier(|_| Ok(1.0), 0.0, &config)
            .unwrap_err()
            .is_invalid_parameter());
        let bad = CalibrationConfig {
            lower_noise_multiplier: 5.0,
            upper_noise_multiplier: 1.0,
            ..CalibrationConfig::default()
        };
        assert!(search_noise_multiplier(|_| Ok(1.0), 1.0, &bad)
            .unwrap_err()
            .is_invalid_parameter());
    }

    #[test]
    fn exhausting_iterations_fails() {
        let config = CalibrationConfig {
            max_iterations: 2,
            ..CalibrationConfig::default()
        };
        let err = search_noise_multiplier(|nm| Ok(10.0 / nm), 4.0, &config).unwrap_err();
        assert!(err.is_calibration_failure());
    }

    #[test]
    fn num_updates_calibration_is_tight() {
        let accountant = DpsgdTrainingAccountant::default();
        let params = DpParams::new(1.0, 10_000, 100, 1e-5).expect("valid params");
        let updates = calibrate_num_updates(2.0, &accountant, &params, 16).expect("updates");
        assert!(accountant.compute_epsilon(updates, &params).expect("eps") <= 2.0);
        assert!(accountant.compute_epsilon(updates + 1, &params).expect("eps") > 2.0);
    }

    #[test]
    fn batch_size_calibration_is_tight() {
        let accountant = DpsgdTrainingAccountant::default();
        let params = DpParams::new(1.0, 10_000, 100, 1e-5).expect("valid params");
        let bs = calibrate_batch_size(2.0, &accountant, &params, 500).expect("batch size");
        let at = params.clone().with_batch_sizes(bs).expect("params");
        let above = params.clone().with_batch_sizes(bs + 1).expect("params");
        assert!(accountant.compute_epsilon(500, &at).expect("eps") <= 2.0);
        assert!(accountant.compute_epsilon(500, &above).expect("eps") > 2.0);
    }

    struct FixedBudgetAccountant;

    impl DpTrainingAccountant for FixedBudgetAccountant {
        fn can_calibrate_steps(&self) -> bool {
            false
        }

        fn can_calibrate_batch_size(&self) -> bool {
            false
        }

        fn can_calibrate_noise_multipliers(&self) -> bool {
            false
        }

        fn validate(&self, dp_params: &DpParams, _num_updates: u64) -> Result<()> {
            dp_params.validate()
        }

        fn compute_epsilon_impl(&self, _num_updates: u64, _dp_params: &DpParams) -> Result<f64> {
            Ok(1.0)
        }
    }

    #[test]
    fn incapable_accountant_is_unsupported() {
        let params = DpParams::new(1.0, 1_000, 10, 1e-5).expect("valid params");
        let config = CalibrationConfig::default();
        let accountant = FixedBudgetAccountant;
        let err = calibrate_noise_multiplier_for_params(1.0, &accountant, &params, 10, &config)
            .unwrap_err();
        assert!(matches!(err, DpError::Unsupported { .. }));
        assert!(calibrate_num_updates(1.0, &accountant, &params, 10).is_err());
        assert!(calibrate_batch_size(1.0, &accountant, &params, 10).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]
        #[test]
        fn calibrate_noise_multiplier_meets_target(
            target_eps in 0.5f64..8.0,
            batch_size in 16usize..512,
        ) {
            let accountant = DpsgdTrainingAccountant::default();
            let nm = calibrate_noise_multiplier(
                target_eps,
                1e-5,
                &accountant,
                batch_size,
                200,
                10_000,
                &CalibrationConfig::default(),
            ).expect("calibrated");
            let params = DpParams::new(nm, 10_000, batch_size, 1e-5).expect("params");
            let eps = accountant.compute_epsilon(200, &params).expect("epsilon");
            prop_assert!(eps <= target_eps);
            prop_assert!(eps >= target_eps * (1.0 - 1e-3));
        }
    }
}

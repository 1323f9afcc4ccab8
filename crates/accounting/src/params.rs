//! Privacy targets, DP training parameters and schedules.

use dpsgd_core::{BatchSchedule, DpError, Result};
use serde::{Deserialize, Serialize};

/// Target `(epsilon, delta)` guarantee. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPrivacyBudget")]
pub struct PrivacyBudget {
    epsilon: f64,
    delta: f64,
}

#[derive(Deserialize)]
struct RawPrivacyBudget {
    epsilon: f64,
    delta: f64,
}

impl TryFrom<RawPrivacyBudget> for PrivacyBudget {
    type Error = DpError;

    fn try_from(raw: RawPrivacyBudget) -> Result<Self> {
        Self::new(raw.epsilon, raw.delta)
    }
}

impl PrivacyBudget {
    /// Create a budget with `epsilon > 0` and `delta` in `(0, 1)`.
    pub fn new(epsilon: f64, delta: f64) -> Result<Self> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(DpError::invalid(format!(
                "epsilon must be positive and finite, got {epsilon}"
            )));
        }
        validate_delta(delta)?;
        Ok(Self { epsilon, delta })
    }

    /// Target epsilon.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Target delta.
    pub fn delta(&self) -> f64 {
        self.delta
    }
}

pub(crate) fn validate_delta(delta: f64) -> Result<()> {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::invalid(format!("delta must be in (0, 1), got {delta}")));
    }
    Ok(())
}

/// Sampling method assumed by the privacy analysis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    /// Poisson sampling (each example included independently).
    #[default]
    Poisson,
    /// Fixed batch size sampling (random subset without replacement).
    Fixed,
}

impl Sampler {
    /// Factor by which sampling inflates the sensitivity of one step.
    pub fn sensitivity_multiplier(self) -> f64 {
        match self {
            Sampler::Poisson => 1.0,
            Sampler::Fixed => 2.0,
        }
    }
}

/// A piecewise-constant schedule keyed by update step.
///
/// A change point `(t, v)` takes effect at step `t` itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule<T> {
    /// A constant value across all steps.
    Constant(T),
    /// A sequence of `(step, value)` change points.
    Timed(Vec<(u64, T)>),
}

impl<T> From<T> for Schedule<T> {
    fn from(value: T) -> Self {
        Schedule::Constant(value)
    }
}

impl From<&BatchSchedule> for Schedule<usize> {
    fn from(schedule: &BatchSchedule) -> Self {
        if schedule.boundaries().is_empty() {
            Schedule::Constant(schedule.init())
        } else {
            Schedule::Timed(schedule.change_points())
        }
    }
}

impl<T: Clone> Schedule<T> {
    /// Construct a constant schedule.
    pub fn constant(value: T) -> Self {
        Self::Constant(value)
    }

    /// Construct a timed schedule.
    pub fn timed(points: Vec<(u64, T)>) -> Self {
        Self::Timed(points)
    }

    /// Normalize to sorted change points up to `max_step`, starting at step 0.
    ///
    /// When several points share a step the last one wins.
    pub fn normalize(&self, max_step: u64) -> Vec<(u64, T)> {
        let mut points: Vec<(u64, T)> = match self {
            Schedule::Constant(v) => vec![(0, v.clone())],
            Schedule::Timed(v) => v.clone(),
        };

        points.sort_by_key(|(t, _)| *t);
        points.retain(|(t, _)| *t <= max_step);
        if points.is_empty() {
            return points;
        }

        // Ensure step 0 is present; use the earliest value otherwise.
        if points[0].0 != 0 {
            let first_val = points[0].1.clone();
            points.insert(0, (0, first_val));
        }

        let mut deduped: Vec<(u64, T)> = Vec::with_capacity(points.len());
        for (step, value) in points {
            match deduped.last_mut() {
                Some((prev_step, prev_value)) if *prev_step == step => *prev_value = value,
                _ => deduped.push((step, value)),
            }
        }
        deduped
    }

    /// Value in effect at `step`, if the schedule has any point.
    pub fn value_at(&self, step: u64) -> Option<T> {
        let points = self.normalize(u64::MAX);
        let idx = points.partition_point(|(t, _)| *t <= step);
        points.get(idx.checked_sub(1)?).map(|(_, v)| v.clone())
    }

    /// All values the schedule can take.
    pub fn values(&self) -> Vec<T> {
        self.normalize(u64::MAX).into_iter().map(|(_, v)| v).collect()
    }
}

/// Parameters describing a DP training run for accounting purposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DpParams {
    /// Noise multipliers schedule (stddev / sensitivity).
    pub noise_multipliers: Schedule<f64>,
    /// Dataset size.
    pub num_samples: usize,
    /// Target delta.
    pub delta: f64,
    /// Logical batch sizes keyed by update step.
    pub batch_sizes: Schedule<usize>,
    /// Sampling method assumed by accounting.
    pub sampler: Sampler,
}

impl DpParams {
    /// Create parameters with constant noise and batch size.
    pub fn new(noise_mult: f64, num_samples: usize, batch_size: usize, delta: f64) -> Result<Self> {
        let params = Self {
            noise_multipliers: Schedule::constant(noise_mult),
            num_samples,
            delta,
            batch_sizes: Schedule::constant(batch_size),
            sampler: Sampler::Poisson,
        };
        params.validate()?;
        Ok(params)
    }

    /// Replace the noise schedule.
    pub fn with_noise_schedule(mut self, schedule: Schedule<f64>) -> Result<Self> {
        self.noise_multipliers = schedule;
        self.validate()?;
        Ok(self)
    }

    /// Replace the batch-size schedule.
    pub fn with_batch_sizes(mut self, batch_sizes: impl Into<Schedule<usize>>) -> Result<Self> {
        self.batch_sizes = batch_sizes.into();
        self.validate()?;
        Ok(self)
    }

    /// Set the sampling method.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sampling probability in effect at `step`.
    pub fn sampling_rate(&self, step: u64) -> f64 {
        self.batch_sizes
            .value_at(step)
            .map_or(0.0, |bs| bs as f64 / self.num_samples as f64)
    }

    /// Validate parameters.
    pub fn validate(&self) -> Result<()> {
        let noise = self.noise_multipliers.values();
        if noise.is_empty() {
            return Err(DpError::invalid("noise schedule must not be empty"));
        }
        if noise.iter().any(|nm| !nm.is_finite() || *nm <= 0.0) {
            return Err(DpError::invalid(
                "noise multipliers must be positive and finite",
            ));
        }
        if self.num_samples == 0 {
            return Err(DpError::invalid("num_samples must be positive"));
        }
        let batches = self.batch_sizes.values();
        if batches.is_empty() {
            return Err(DpError::invalid("batch schedule must not be empty"));
        }
        if let Some(bad) = batches
            .iter()
            .find(|bs| **bs == 0 || **bs > self.num_samples)
        {
            return Err(DpError::invalid(format!(
                "batch size {bad} must be in (0, {}]",
                self.num_samples
            )));
        }
        validate_delta(self.delta)
    }
}

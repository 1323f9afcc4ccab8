//! Serializable configuration for a DP-SGD training run.
//!
//! ```
//! use dpsgd::DpTrainingConfig;
//!
//! let config = DpTrainingConfig::from_json_str(r#"{
//!     "budget": {"epsilon": 1.0, "delta": 1e-5},
//!     "batching": {"batch_size_init": 256, "batch_size_per_device_per_step": 64},
//!     "num_samples": 10000,
//!     "num_updates": 3906,
//!     "clipping_norm": 1.0
//! }"#).unwrap();
//! assert_eq!(config.batching.num_devices, 1);
//! ```

use serde::{Deserialize, Serialize};

use dpsgd_accounting::{AccountantConfig, CalibrationConfig, PrivacyBudget, Sampler};
use dpsgd_core::{BatchSchedule, DpError, Result, VirtualBatching};

fn default_num_devices() -> usize {
    1
}

/// Virtual batching parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Total batch size at update step zero.
    pub batch_size_init: usize,
    /// Examples processed per device per micro-step.
    pub batch_size_per_device_per_step: usize,
    /// Devices processing micro-batches in parallel.
    #[serde(default = "default_num_devices")]
    pub num_devices: usize,
    /// `(boundary_step, batch_size)` change points, in update steps.
    #[serde(default)]
    pub schedule: Vec<(u64, usize)>,
}

impl BatchingConfig {
    /// Constant batching on `num_devices` devices.
    pub fn new(
        batch_size_init: usize,
        batch_size_per_device_per_step: usize,
        num_devices: usize,
    ) -> Self {
        Self {
            batch_size_init,
            batch_size_per_device_per_step,
            num_devices,
            schedule: Vec::new(),
        }
    }

    /// Add batch-size change points.
    pub fn with_schedule(mut self, schedule: Vec<(u64, usize)>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Build the validated batching.
    pub fn build(&self) -> Result<VirtualBatching> {
        let schedule = BatchSchedule::new(self.batch_size_init, self.schedule.clone())?;
        VirtualBatching::with_schedule(
            schedule,
            self.batch_size_per_device_per_step,
            self.num_devices,
        )
    }
}

/// Everything needed to set up a DP-SGD training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DpTrainingConfig {
    /// Privacy budget for the whole run.
    pub budget: PrivacyBudget,
    /// Accounting method.
    #[serde(default)]
    pub accountant: AccountantConfig,
    /// Noise calibration bracket and tolerance.
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Virtual batching.
    pub batching: BatchingConfig,
    /// Dataset size.
    pub num_samples: usize,
    /// Number of parameter updates.
    pub num_updates: u64,
    /// L2 clipping norm for per-example gradients.
    pub clipping_norm: f64,
    /// Fixed noise multiplier; calibrated from the budget when absent.
    #[serde(default)]
    pub noise_multiplier: Option<f64>,
    /// Whether clipped gradients are rescaled to unit norm.
    #[serde(default)]
    pub rescale_to_unit_norm: bool,
    /// Sampling method assumed by accounting.
    #[serde(default)]
    pub sampler: Sampler,
    /// Seed of the noise RNG.
    #[serde(default)]
    pub noise_seed: u64,
}

impl DpTrainingConfig {
    /// Configuration with default accounting and calibration.
    pub fn new(
        budget: PrivacyBudget,
        batching: BatchingConfig,
        num_samples: usize,
        num_updates: u64,
        clipping_norm: f64,
    ) -> Self {
        Self {
            budget,
            accountant: AccountantConfig::default(),
            calibration: CalibrationConfig::default(),
            batching,
            num_samples,
            num_updates,
            clipping_norm,
            noise_multiplier: None,
            rescale_to_unit_norm: false,
            sampler: Sampler::Poisson,
            noise_seed: 0,
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DpError::config(format!("invalid training config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DpError::config(format!("cannot serialize training config: {e}")))
    }

    /// Validate scalar parameters. Batching and accounting settings are
    /// validated when they are built.
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(DpError::invalid("num_samples must be positive"));
        }
        if self.num_updates == 0 {
            return Err(DpError::invalid("num_updates must be positive"));
        }
        if !self.clipping_norm.is_finite() || self.clipping_norm <= 0.0 {
            return Err(DpError::invalid("clipping_norm must be positive and finite"));
        }
        if let Some(noise) = self.noise_multiplier {
            if !noise.is_finite() || noise <= 0.0 {
                return Err(DpError::invalid("noise_multiplier must be positive and finite"));
            }
        }
        self.calibration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DpTrainingConfig {
        DpTrainingConfig::new(
            PrivacyBudget::new(1.0, 1e-5).expect("budget"),
            BatchingConfig::new(256, 64, 2),
            10_000,
            100,
            1.0,
        )
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let mut config = base();
        config.batching = config.batching.with_schedule(vec![(50, 512)]);
        config.noise_multiplier = Some(3.0);
        let json = config.to_json_string().expect("serialize");
        let parsed = DpTrainingConfig::from_json_str(&json).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = DpTrainingConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, DpError::Config { .. }));
        let err = DpTrainingConfig::from_json_str(
            r#"{"budget": {"epsilon": -1.0, "delta": 1e-5},
                "batching": {"batch_size_init": 8, "batch_size_per_device_per_step": 8},
                "num_samples": 100, "num_updates": 1, "clipping_norm": 1.0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DpError::Config { .. }));
    }

    #[test]
    fn scalar_validation() {
        let mut config = base();
        config.clipping_norm = 0.0;
        assert!(config.validate().unwrap_err().is_invalid_parameter());
        let mut config = base();
        config.num_updates = 0;
        assert!(config.validate().is_err());
        let mut config = base();
        config.noise_multiplier = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn batching_config_builds_schedule() {
        let batching = BatchingConfig::new(128, 32, 2)
            .with_schedule(vec![(10, 256)])
            .build()
            .expect("batching");
        assert_eq!(batching.apply_update_every(9), 2);
        assert_eq!(batching.apply_update_every(10), 4);
        assert!(BatchingConfig::new(100, 32, 2).build().is_err());
    }
}

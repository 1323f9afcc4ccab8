//! Accountant configuration and the uniform accountant interface.

use serde::{Deserialize, Serialize};
use tracing::debug;

use dpsgd_core::{DpError, NeighboringRelation, Result};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::calibrate::{search_noise_multiplier, CalibrationConfig};
use crate::params::validate_delta;
use crate::pld::{
    PldAccountant, DEFAULT_LOG_MASS_TRUNCATION_BOUND, DEFAULT_TAIL_MASS_TRUNCATION,
    DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
};
use crate::rdp::{default_orders, RdpAccountant};

/// A run of identical Poisson-subsampled Gaussian steps.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositionSegment {
    /// Noise stddev relative to sensitivity.
    pub noise_multiplier: f64,
    /// Probability that an example participates in a step.
    pub sampling_probability: f64,
    /// Number of consecutive steps.
    pub num_steps: u64,
}

impl CompositionSegment {
    /// Describe `num_steps` identical steps.
    pub fn new(noise_multiplier: f64, sampling_probability: f64, num_steps: u64) -> Self {
        Self {
            noise_multiplier,
            sampling_probability,
            num_steps,
        }
    }

    /// Check the segment's domain.
    pub fn validate(&self) -> Result<()> {
        if !self.noise_multiplier.is_finite() || self.noise_multiplier <= 0.0 {
            return Err(DpError::invalid(format!(
                "noise multiplier must be positive and finite, got {}",
                self.noise_multiplier
            )));
        }
        let q = self.sampling_probability;
        if !q.is_finite() || q <= 0.0 || q > 1.0 {
            return Err(DpError::invalid(format!(
                "sampling probability must be in (0, 1], got {q}"
            )));
        }
        if self.num_steps == 0 {
            return Err(DpError::invalid("number of steps must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration for constructing a privacy accountant with a fresh state.
pub trait DpAccountantConfig {
    /// Accountant type created by this config.
    type Accountant;

    /// Create a new accountant instance.
    fn create_accountant(&self) -> Result<Self::Accountant>;
}

/// Configuration for the RDP accountant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdpAccountantConfig {
    /// Rényi orders to evaluate.
    pub orders: Vec<f64>,
    /// Per-mechanism cache capacity; zero disables caching.
    pub cache_capacity: usize,
}

impl Default for RdpAccountantConfig {
    fn default() -> Self {
        Self {
            orders: default_orders(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl RdpAccountantConfig {
    /// Create a config with explicit orders.
    pub fn new(orders: Vec<f64>) -> Self {
        Self {
            orders,
            ..Self::default()
        }
    }
}

impl DpAccountantConfig for RdpAccountantConfig {
    type Accountant = RdpAccountant;

    fn create_accountant(&self) -> Result<Self::Accountant> {
        Ok(RdpAccountant::with_orders(self.orders.clone())?.with_cache_capacity(self.cache_capacity))
    }
}

/// Configuration for the PLD accountant.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PldAccountantConfig {
    /// Discretization interval for PLD values.
    pub value_discretization_interval: f64,
    /// Natural log of the noise mass ignored when bounding the loss range.
    pub log_mass_truncation_bound: f64,
    /// Mass trimmed from the tails after each composition.
    pub tail_mass_truncation: f64,
    /// Neighboring relation to analyze.
    pub neighboring_relation: NeighboringRelation,
    /// Per-mechanism cache capacity; zero disables caching.
    pub cache_capacity: usize,
}

impl Default for PldAccountantConfig {
    fn default() -> Self {
        Self {
            value_discretization_interval: DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
            log_mass_truncation_bound: DEFAULT_LOG_MASS_TRUNCATION_BOUND,
            tail_mass_truncation: DEFAULT_TAIL_MASS_TRUNCATION,
            neighboring_relation: NeighboringRelation::AddOrRemoveOne,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl PldAccountantConfig {
    /// Create a config with an explicit discretization interval.
    pub fn new(value_discretization_interval: f64) -> Self {
        Self {
            value_discretization_interval,
            ..Self::default()
        }
    }

    /// Set the neighboring relation for the PLD accountant.
    pub fn with_neighboring_relation(mut self, neighboring_relation: NeighboringRelation) -> Self {
        self.neighboring_relation = neighboring_relation;
        self
    }
}

impl DpAccountantConfig for PldAccountantConfig {
    type Accountant = PldAccountant;

    fn create_accountant(&self) -> Result<Self::Accountant> {
        Ok(PldAccountant::with_params(
            self.neighboring_relation,
            self.value_discretization_interval,
        )?
        .with_log_mass_truncation_bound(self.log_mass_truncation_bound)?
        .with_tail_mass_truncation(self.tail_mass_truncation)?
        .with_cache_capacity(self.cache_capacity))
    }
}

/// Accounting method selection, tagged by `"method"` when serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AccountantConfig {
    /// Rényi DP accounting.
    Rdp(RdpAccountantConfig),
    /// Privacy loss distribution accounting.
    Pld(PldAccountantConfig),
}

impl Default for AccountantConfig {
    fn default() -> Self {
        AccountantConfig::Rdp(RdpAccountantConfig::default())
    }
}

impl From<RdpAccountantConfig> for AccountantConfig {
    fn from(config: RdpAccountantConfig) -> Self {
        AccountantConfig::Rdp(config)
    }
}

impl From<PldAccountantConfig> for AccountantConfig {
    fn from(config: PldAccountantConfig) -> Self {
        AccountantConfig::Pld(config)
    }
}

impl DpAccountantConfig for AccountantConfig {
    type Accountant = Accountant;

    fn create_accountant(&self) -> Result<Accountant> {
        match self {
            AccountantConfig::Rdp(cfg) => cfg.create_accountant().map(Accountant::Rdp),
            AccountantConfig::Pld(cfg) => cfg.create_accountant().map(Accountant::Pld),
        }
    }
}

/// Converts Poisson-subsampled Gaussian compositions into `(epsilon, delta)`
/// guarantees with a selected method.
///
/// Results are deterministic: the same inputs and configuration always
/// produce the same values, whether or not a cached mechanism is reused.
#[derive(Clone, Debug)]
pub enum Accountant {
    /// Rényi DP accountant.
    Rdp(RdpAccountant),
    /// Privacy loss distribution accountant.
    Pld(PldAccountant),
}

impl Accountant {
    /// Build the accountant described by `config`.
    pub fn from_config(config: &AccountantConfig) -> Result<Self> {
        config.create_accountant()
    }

    /// Short method name used in logs.
    pub fn method_name(&self) -> &'static str {
        match self {
            Accountant::Rdp(_) => "rdp",
            Accountant::Pld(_) => "pld",
        }
    }

    /// Epsilon spent by `num_steps` identical steps at `delta`.
    pub fn compute_epsilon(
        &self,
        noise_multiplier: f64,
        sampling_probability: f64,
        num_steps: u64,
        delta: f64,
    ) -> Result<f64> {
        self.compose_epsilon(
            &[CompositionSegment::new(
                noise_multiplier,
                sampling_probability,
                num_steps,
            )],
            delta,
        )
    }

    /// Delta spent by `num_steps` identical steps at `epsilon`.
    pub fn compute_delta(
        &self,
        noise_multiplier: f64,
        sampling_probability: f64,
        num_steps: u64,
        epsilon: f64,
    ) -> Result<f64> {
        self.compose_delta(
            &[CompositionSegment::new(
                noise_multiplier,
                sampling_probability,
                num_steps,
            )],
            epsilon,
        )
    }

    /// Smallest noise multiplier achieving `epsilon` at `delta` for
    /// `num_steps` identical steps, searched with the default bracket.
    pub fn compute_noise_multiplier(
        &self,
        epsilon: f64,
        sampling_probability: f64,
        num_steps: u64,
        delta: f64,
    ) -> Result<f64> {
        CompositionSegment::new(1.0, sampling_probability, num_steps).validate()?;
        validate_delta(delta)?;
        search_noise_multiplier(
            |nm| self.compute_epsilon(nm, sampling_probability, num_steps, delta),
            epsilon,
            &CalibrationConfig::default(),
        )
    }

    /// Epsilon of a sequential composition of segments.
    pub fn compose_epsilon(&self, segments: &[CompositionSegment], delta: f64) -> Result<f64> {
        validate_delta(delta)?;
        let epsilon = match self {
            Accountant::Rdp(acc) => acc.compose_epsilon(segments, delta)?,
            Accountant::Pld(acc) => acc.compose_epsilon(segments, delta)?,
        };
        debug!(
            method = self.method_name(),
            segments = segments.len(),
            epsilon,
            delta,
            "composed epsilon"
        );
        Ok(epsilon)
    }

    /// Delta of a sequential composition of segments.
    pub fn compose_delta(&self, segments: &[CompositionSegment], epsilon: f64) -> Result<f64> {
        match self {
            Accountant::Rdp(acc) => acc.compose_delta(segments, epsilon),
            Accountant::Pld(acc) => acc.compose_delta(segments, epsilon),
        }
    }
}

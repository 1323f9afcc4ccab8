//! Privacy Loss Distribution (PLD) accounting.
//!
//! The privacy loss of one Poisson-subsampled Gaussian step is discretized
//! pessimistically onto a uniform grid: every loss is rounded up to the next
//! multiple of the discretization interval and mass that cannot be placed is
//! treated as infinite loss. Composition convolves the probability mass
//! functions with an FFT, and `k`-fold self-composition uses repeated
//! squaring. Tails holding at most `tail_mass_truncation` of the mass are
//! trimmed after every convolution, again pessimistically.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use dpsgd_core::{DpError, NeighboringRelation, Result};

use crate::accountants::CompositionSegment;
use crate::cache::{CacheStats, MechanismCache, MechanismKey, DEFAULT_CACHE_CAPACITY};
use crate::params::validate_delta;

/// Default grid spacing of discretized privacy losses.
pub const DEFAULT_VALUE_DISCRETIZATION_INTERVAL: f64 = 1e-4;
/// Default natural log of the noise mass ignored when bounding the loss range.
pub const DEFAULT_LOG_MASS_TRUNCATION_BOUND: f64 = -50.0;
/// Default mass trimmed from the tails after each composition.
pub const DEFAULT_TAIL_MASS_TRUNCATION: f64 = 1e-15;

/// Largest number of grid points a distribution may occupy.
const MAX_PMF_SIZE: usize = 1 << 21;
/// Minimum finite plus infinite mass a valid distribution must carry.
const MIN_TOTAL_MASS: f64 = 0.5;

#[derive(Clone, Copy, Debug)]
enum AdjacencyType {
    Add,
    Remove,
    Replace,
}

#[derive(Clone, Debug)]
struct TailPrivacyLoss {
    lower_x_truncation: f64,
    upper_x_truncation: f64,
    /// Mass below `lower_x_truncation`, charged as infinite loss.
    infinity_mass: f64,
    /// Mass above `upper_x_truncation`, charged at the loss of that point.
    upper_tail: (f64, f64),
}

trait MonotonePrivacyLoss {
    /// Privacy loss at `x`; non-increasing in `x`.
    fn privacy_loss(&self, x: f64) -> f64;
    fn inverse_privacy_loss(&self, loss: f64) -> f64;
    fn mu_upper_cdf(&self, x: f64) -> f64;
    fn privacy_loss_tail(&self) -> TailPrivacyLoss;
}

fn binary_search_increasing<F>(f: F, target: f64, mut lower: f64, mut upper: f64, tol: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    for _ in 0..120 {
        if (upper - lower).abs() <= tol {
            break;
        }
        let mid = 0.5 * (lower + upper);
        if f(mid) < target {
            lower = mid;
        } else {
            upper = mid;
        }
    }
    0.5 * (lower + upper)
}

fn binary_search_decreasing<F>(f: F, target: f64, mut lower: f64, mut upper: f64, tol: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    for _ in 0..120 {
        if (upper - lower).abs() <= tol {
            break;
        }
        let mid = 0.5 * (lower + upper);
        if f(mid) > target {
            lower = mid;
        } else {
            upper = mid;
        }
    }
    0.5 * (lower + upper)
}

#[derive(Clone, Debug)]
struct GaussianPrivacyLoss {
    sensitivity: f64,
    sampling_prob: f64,
    adjacency_type: AdjacencyType,
    log_mass_truncation_bound: f64,
    normal: Normal,
    variance: f64,
}

impl GaussianPrivacyLoss {
    fn new(
        standard_deviation: f64,
        sensitivity: f64,
        sampling_prob: f64,
        adjacency_type: AdjacencyType,
        log_mass_truncation_bound: f64,
    ) -> Result<Self> {
        let normal = Normal::new(0.0, standard_deviation).map_err(|e| {
            DpError::invalid(format!("invalid noise stddev {standard_deviation}: {e}"))
        })?;
        Ok(Self {
            sensitivity,
            sampling_prob,
            adjacency_type,
            log_mass_truncation_bound,
            normal,
            variance: standard_deviation * standard_deviation,
        })
    }

    fn is_full_batch(&self) -> bool {
        self.sampling_prob >= 1.0
    }

    fn privacy_loss_without_subsampling_remove(&self, x: f64) -> f64 {
        let s = self.sensitivity;
        s * (-0.5 * s - x) / self.variance
    }

    fn privacy_loss_remove(&self, x: f64) -> f64 {
        let loss = self.privacy_loss_without_subsampling_remove(x);
        if self.is_full_batch() {
            return loss;
        }
        let q = self.sampling_prob;
        // log(q * e^loss + 1 - q), stable for large losses.
        if loss > 0.0 {
            loss + (q + (1.0 - q) * (-loss).exp()).ln()
        } else {
            (q * loss.exp_m1()).ln_1p()
        }
    }

    fn privacy_loss_add(&self, x: f64) -> f64 {
        -self.privacy_loss_remove(-x)
    }

    fn inverse_privacy_loss_without_subsampling_remove(&self, loss: f64) -> f64 {
        let s = self.sensitivity;
        -0.5 * s - loss * self.variance / s
    }

    /// Largest `x` with loss at least `loss`; `+inf` when every `x` qualifies.
    fn inverse_privacy_loss_remove(&self, loss: f64) -> f64 {
        if self.is_full_batch() {
            return self.inverse_privacy_loss_without_subsampling_remove(loss);
        }
        let q = self.sampling_prob;
        if loss <= (-q).ln_1p() {
            return f64::INFINITY;
        }
        let loss_wo = (loss.exp_m1() / q).ln_1p();
        self.inverse_privacy_loss_without_subsampling_remove(loss_wo)
    }

    fn inverse_privacy_loss_add(&self, loss: f64) -> f64 {
        -self.inverse_privacy_loss_remove(-loss)
    }

    fn inverse_privacy_loss_replace(&self, loss: f64) -> f64 {
        let (lower, upper) = self.x_truncation();
        binary_search_decreasing(|x| self.privacy_loss(x), loss, lower, upper, 1e-9)
    }

    fn x_truncation(&self) -> (f64, f64) {
        let tail_mass = 0.5 * self.log_mass_truncation_bound.exp();
        let z = self.normal.inverse_cdf(tail_mass);
        let upper_x_truncation = -z;
        let lower_x_truncation = match self.adjacency_type {
            AdjacencyType::Add => z,
            AdjacencyType::Remove | AdjacencyType::Replace => binary_search_increasing(
                |x| self.mu_upper_cdf(x),
                tail_mass,
                z - self.sensitivity,
                z,
                1e-9,
            ),
        };
        (lower_x_truncation, upper_x_truncation)
    }
}

impl MonotonePrivacyLoss for GaussianPrivacyLoss {
    fn privacy_loss(&self, x: f64) -> f64 {
        match self.adjacency_type {
            AdjacencyType::Add => self.privacy_loss_add(x),
            AdjacencyType::Remove => self.privacy_loss_remove(x),
            AdjacencyType::Replace => self.privacy_loss_remove(x) + self.privacy_loss_add(x),
        }
    }

    fn inverse_privacy_loss(&self, loss: f64) -> f64 {
        match self.adjacency_type {
            AdjacencyType::Add => self.inverse_privacy_loss_add(loss),
            AdjacencyType::Remove => self.inverse_privacy_loss_remove(loss),
            AdjacencyType::Replace => self.inverse_privacy_loss_replace(loss),
        }
    }

    fn mu_upper_cdf(&self, x: f64) -> f64 {
        match self.adjacency_type {
            AdjacencyType::Add => self.normal.cdf(x),
            AdjacencyType::Remove | AdjacencyType::Replace => {
                if self.is_full_batch() {
                    return self.normal.cdf(x + self.sensitivity);
                }
                (1.0 - self.sampling_prob) * self.normal.cdf(x)
                    + self.sampling_prob * self.normal.cdf(x + self.sensitivity)
            }
        }
    }

    fn privacy_loss_tail(&self) -> TailPrivacyLoss {
        let (lower_x_truncation, upper_x_truncation) = self.x_truncation();
        TailPrivacyLoss {
            lower_x_truncation,
            upper_x_truncation,
            infinity_mass: self.mu_upper_cdf(lower_x_truncation),
            upper_tail: (
                self.privacy_loss(upper_x_truncation),
                1.0 - self.mu_upper_cdf(upper_x_truncation),
            ),
        }
    }
}

/// Pessimistic discretized PLD: grid index `k` carries loss `k * discretization`.
#[derive(Clone, Debug)]
struct PldPmf {
    discretization: f64,
    lower_loss: i64,
    probs: Vec<f64>,
    infinity_mass: f64,
}

impl PldPmf {
    fn identity(discretization: f64) -> Self {
        Self {
            discretization,
            lower_loss: 0,
            probs: vec![1.0],
            infinity_mass: 0.0,
        }
    }

    fn from_map(loss_probs: &BTreeMap<i64, f64>, discretization: f64, infinity_mass: f64) -> Result<Self> {
        let (Some((&min, _)), Some((&max, _))) =
            (loss_probs.first_key_value(), loss_probs.last_key_value())
        else {
            return Self::checked(Self {
                discretization,
                lower_loss: 0,
                probs: vec![0.0],
                infinity_mass,
            });
        };
        let size = grid_size(min, max)?;
        check_size(size)?;
        let mut probs = vec![0.0_f64; size];
        for (k, v) in loss_probs {
            probs[(k - min) as usize] += *v;
        }
        Self::checked(Self {
            discretization,
            lower_loss: min,
            probs,
            infinity_mass,
        })
    }

    fn checked(pmf: Self) -> Result<Self> {
        let finite: f64 = pmf.probs.iter().sum();
        let total = finite + pmf.infinity_mass;
        if !total.is_finite() || total < MIN_TOTAL_MASS {
            return Err(DpError::numerical(format!(
                "discretized privacy loss carries mass {total}; the discretization \
                 interval {} cannot represent this mechanism",
                pmf.discretization
            )));
        }
        Ok(pmf)
    }

    fn size(&self) -> usize {
        self.probs.len()
    }

    fn loss_at(&self, idx: usize) -> f64 {
        (self.lower_loss + idx as i64) as f64 * self.discretization
    }

    /// Trim the largest prefix and suffix holding at most half of
    /// `tail_mass_truncation` each. The left mass moves onto the first kept
    /// point and the right mass becomes infinite loss.
    fn truncate_tails(probs: Vec<f64>, tail_mass_truncation: f64) -> (usize, Vec<f64>, f64) {
        if tail_mass_truncation <= 0.0 || probs.len() <= 1 {
            return (0, probs, 0.0);
        }
        let half = 0.5 * tail_mass_truncation;

        let mut left = 0usize;
        let mut left_mass = 0.0;
        while left + 1 < probs.len() && left_mass + probs[left] <= half {
            left_mass += probs[left];
            left += 1;
        }

        let mut right = probs.len();
        let mut right_mass = 0.0;
        while right - 1 > left && right_mass + probs[right - 1] <= half {
            right_mass += probs[right - 1];
            right -= 1;
        }

        let mut kept = probs[left..right].to_vec();
        kept[0] += left_mass;
        (left, kept, right_mass)
    }

    fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
        let n = a.len() + b.len() - 1;
        let size = n.next_power_of_two();

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(size);
        let ifft = planner.plan_fft_inverse(size);

        let mut fa = vec![Complex::new(0.0, 0.0); size];
        let mut fb = vec![Complex::new(0.0, 0.0); size];
        for (slot, &val) in fa.iter_mut().zip(a) {
            slot.re = val;
        }
        for (slot, &val) in fb.iter_mut().zip(b) {
            slot.re = val;
        }
        fft.process(&mut fa);
        fft.process(&mut fb);
        for (a_i, b_i) in fa.iter_mut().zip(fb.iter()) {
            *a_i *= *b_i;
        }
        ifft.process(&mut fa);

        // Round-off leaves tiny negative values where the true mass is zero.
        let scale = 1.0 / size as f64;
        fa.iter().take(n).map(|c| (c.re * scale).max(0.0)).collect()
    }

    fn compose(&self, other: &Self, tail_mass_truncation: f64) -> Result<Self> {
        if (self.discretization - other.discretization).abs() > 1e-12 {
            return Err(DpError::invalid(
                "cannot compose distributions with different discretization intervals",
            ));
        }
        check_size(self.size() + other.size() - 1)?;
        let probs = Self::convolve(&self.probs, &other.probs);
        let infinity_mass =
            self.infinity_mass + other.infinity_mass - self.infinity_mass * other.infinity_mass;
        let (offset, truncated, right_tail) = Self::truncate_tails(probs, tail_mass_truncation);
        let lower_loss = i64::try_from(offset)
            .ok()
            .and_then(|offset| self.lower_loss.checked_add(other.lower_loss)?.checked_add(offset))
            .ok_or_else(|| DpError::numerical("composed privacy loss grid overflows"))?;
        let composed = Self {
            discretization: self.discretization,
            lower_loss,
            probs: truncated,
            infinity_mass: (infinity_mass + right_tail).min(1.0),
        };
        Self::checked(composed)
    }

    fn self_compose(&self, num_times: u64, tail_mass_truncation: f64) -> Result<Self> {
        if num_times == 0 {
            return Err(DpError::invalid("self-composition count must be positive"));
        }
        if num_times == 1 {
            return Ok(self.clone());
        }
        let mut result = PldPmf::identity(self.discretization);
        let mut base = self.clone();
        let mut n = num_times;
        while n > 0 {
            if n % 2 == 1 {
                result = result.compose(&base, tail_mass_truncation)?;
            }
            n /= 2;
            if n > 0 {
                base = base.compose(&base, tail_mass_truncation)?;
            }
        }
        Ok(result)
    }

    fn get_delta_for_epsilon(&self, epsilon: f64) -> f64 {
        let mut delta = self.infinity_mass;
        for (i, prob) in self.probs.iter().enumerate() {
            let loss = self.loss_at(i);
            if loss > epsilon {
                delta += -(epsilon - loss).exp_m1() * prob;
            }
        }
        delta.clamp(0.0, 1.0)
    }

    fn get_epsilon_for_delta(&self, delta: f64) -> f64 {
        if self.infinity_mass > delta {
            return f64::INFINITY;
        }
        let mut mass_upper = self.infinity_mass;
        let mut mass_lower = 0.0;

        for i in (0..self.size()).rev() {
            let loss = self.loss_at(i);
            let prob = self.probs[i];
            if mass_upper > delta && mass_lower > 0.0 {
                let eps = ((mass_upper - delta) / mass_lower).ln();
                if eps >= loss {
                    break;
                }
            }
            mass_upper += prob;
            mass_lower += prob * (-loss).exp();
            if mass_upper >= delta && mass_lower == 0.0 {
                return loss.max(0.0);
            }
        }

        if mass_upper <= mass_lower + delta {
            return 0.0;
        }
        ((mass_upper - delta) / mass_lower).ln()
    }
}

/// Grid index of `loss` rounded up, rejecting losses the grid cannot index.
fn loss_index(loss: f64, discretization: f64) -> Result<i64> {
    let index = (loss / discretization).ceil();
    // Keeps index arithmetic well inside i64.
    if !index.is_finite() || index.abs() >= (1u64 << 52) as f64 {
        return Err(DpError::numerical(format!(
            "privacy loss {loss} is out of range at interval {discretization}"
        )));
    }
    Ok(index as i64)
}

/// Number of grid points in `min..=max`.
fn grid_size(min: i64, max: i64) -> Result<usize> {
    max.checked_sub(min)
        .and_then(|span| span.checked_add(1))
        .and_then(|size| usize::try_from(size).ok())
        .ok_or_else(|| DpError::numerical(format!("grid range {min}..={max} is not representable")))
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_PMF_SIZE {
        return Err(DpError::numerical(format!(
            "privacy loss distribution would need {size} grid points (limit {MAX_PMF_SIZE}); \
             use a coarser discretization interval"
        )));
    }
    Ok(())
}

/// PLD pair for both neighboring directions; `pmf_add` is `None` when the
/// distribution is symmetric.
#[derive(Clone, Debug)]
struct PrivacyLossDistribution {
    pmf_remove: PldPmf,
    pmf_add: Option<PldPmf>,
}

impl PrivacyLossDistribution {
    fn symmetric(pmf: PldPmf) -> Self {
        Self {
            pmf_remove: pmf,
            pmf_add: None,
        }
    }

    fn add_pmf(&self) -> &PldPmf {
        self.pmf_add.as_ref().unwrap_or(&self.pmf_remove)
    }

    fn get_delta_for_epsilon(&self, epsilon: f64) -> f64 {
        let delta_remove = self.pmf_remove.get_delta_for_epsilon(epsilon);
        match &self.pmf_add {
            Some(add) => delta_remove.max(add.get_delta_for_epsilon(epsilon)),
            None => delta_remove,
        }
    }

    fn get_epsilon_for_delta(&self, delta: f64) -> f64 {
        let eps_remove = self.pmf_remove.get_epsilon_for_delta(delta);
        match &self.pmf_add {
            Some(add) => eps_remove.max(add.get_epsilon_for_delta(delta)),
            None => eps_remove,
        }
    }

    fn compose(&self, other: &Self, tail_mass_truncation: f64) -> Result<Self> {
        let pmf_remove = self
            .pmf_remove
            .compose(&other.pmf_remove, tail_mass_truncation)?;
        if self.pmf_add.is_none() && other.pmf_add.is_none() {
            return Ok(Self::symmetric(pmf_remove));
        }
        let pmf_add = self
            .add_pmf()
            .compose(other.add_pmf(), tail_mass_truncation)?;
        Ok(Self {
            pmf_remove,
            pmf_add: Some(pmf_add),
        })
    }

    fn self_compose(&self, n: u64, tail_mass_truncation: f64) -> Result<Self> {
        let pmf_remove = self.pmf_remove.self_compose(n, tail_mass_truncation)?;
        let pmf_add = match &self.pmf_add {
            Some(add) => Some(add.self_compose(n, tail_mass_truncation)?),
            None => None,
        };
        Ok(Self {
            pmf_remove,
            pmf_add,
        })
    }

    fn from_gaussian_mechanism(
        standard_deviation: f64,
        sampling_prob: f64,
        value_discretization_interval: f64,
        log_mass_truncation_bound: f64,
        neighboring_relation: NeighboringRelation,
    ) -> Result<Self> {
        let make = |adj: AdjacencyType| -> Result<PldPmf> {
            let mpl = GaussianPrivacyLoss::new(
                standard_deviation,
                1.0,
                sampling_prob,
                adj,
                log_mass_truncation_bound,
            )?;
            create_pld_pmf_from_monotone_privacy_loss(&mpl, value_discretization_interval)
        };

        match neighboring_relation {
            NeighboringRelation::AddOrRemoveOne => {
                let pmf_remove = make(AdjacencyType::Remove)?;
                if sampling_prob >= 1.0 {
                    Ok(Self::symmetric(pmf_remove))
                } else {
                    Ok(Self {
                        pmf_remove,
                        pmf_add: Some(make(AdjacencyType::Add)?),
                    })
                }
            }
            NeighboringRelation::ReplaceOne => Ok(Self::symmetric(make(AdjacencyType::Replace)?)),
        }
    }
}

fn create_pld_pmf_from_monotone_privacy_loss<T: MonotonePrivacyLoss>(
    mpl: &T,
    value_discretization_interval: f64,
) -> Result<PldPmf> {
    let d = value_discretization_interval;
    let tail = mpl.privacy_loss_tail();
    let mut loss_probs: BTreeMap<i64, f64> = BTreeMap::new();

    let lower_pl = mpl.privacy_loss(tail.upper_x_truncation);
    let upper_pl = mpl.privacy_loss(tail.lower_x_truncation);
    if !lower_pl.is_finite() || !upper_pl.is_finite() {
        return Err(DpError::numerical(
            "privacy loss range is not finite for this mechanism",
        ));
    }
    let span = (upper_pl - lower_pl) / d;
    if !(span < MAX_PMF_SIZE as f64) {
        return Err(DpError::numerical(format!(
            "privacy loss range [{lower_pl}, {upper_pl}] needs more than {MAX_PMF_SIZE} grid \
             points at interval {d}"
        )));
    }
    let k_min = loss_index(lower_pl, d)?;
    let k_max = loss_index(upper_pl, d)?;
    check_size(grid_size(k_min, k_max)?)?;

    let (tail_loss, tail_mass) = tail.upper_tail;
    if tail_mass > 0.0 {
        *loss_probs.entry(loss_index(tail_loss, d)?).or_insert(0.0) += tail_mass;
    }

    for k in k_min..=k_max {
        let lower_loss = (k as f64 - 1.0) * d;
        let upper_loss = k as f64 * d;

        let x_low = mpl
            .inverse_privacy_loss(upper_loss)
            .clamp(tail.lower_x_truncation, tail.upper_x_truncation);
        let x_high = mpl
            .inverse_privacy_loss(lower_loss)
            .clamp(tail.lower_x_truncation, tail.upper_x_truncation);
        if x_high > x_low {
            let mass = mpl.mu_upper_cdf(x_high) - mpl.mu_upper_cdf(x_low);
            if mass > 0.0 {
                *loss_probs.entry(k).or_insert(0.0) += mass;
            }
        }
    }

    PldPmf::from_map(&loss_probs, d, tail.infinity_mass.max(0.0))
}

/// PLD accountant for Poisson-subsampled Gaussian compositions.
#[derive(Clone, Debug)]
pub struct PldAccountant {
    neighboring_relation: NeighboringRelation,
    value_discretization_interval: f64,
    tail_mass_truncation: f64,
    log_mass_truncation_bound: f64,
    cache: MechanismCache<PrivacyLossDistribution>,
}

impl Default for PldAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl PldAccountant {
    /// Create an accountant with default settings.
    pub fn new() -> Self {
        Self {
            neighboring_relation: NeighboringRelation::AddOrRemoveOne,
            value_discretization_interval: DEFAULT_VALUE_DISCRETIZATION_INTERVAL,
            tail_mass_truncation: DEFAULT_TAIL_MASS_TRUNCATION,
            log_mass_truncation_bound: DEFAULT_LOG_MASS_TRUNCATION_BOUND,
            cache: MechanismCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }

    /// Create an accountant with an explicit relation and grid spacing.
    pub fn with_params(
        neighboring_relation: NeighboringRelation,
        value_discretization_interval: f64,
    ) -> Result<Self> {
        if !value_discretization_interval.is_finite() || value_discretization_interval <= 0.0 {
            return Err(DpError::invalid(format!(
                "value_discretization_interval must be positive and finite, got \
                 {value_discretization_interval}"
            )));
        }
        Ok(Self {
            neighboring_relation,
            value_discretization_interval,
            ..Self::new()
        })
    }

    /// Set the mass trimmed from the tails after each composition.
    pub fn with_tail_mass_truncation(mut self, tail_mass_truncation: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&tail_mass_truncation) {
            return Err(DpError::invalid(format!(
                "tail_mass_truncation must be in [0, 1), got {tail_mass_truncation}"
            )));
        }
        self.tail_mass_truncation = tail_mass_truncation;
        self.cache.clear();
        Ok(self)
    }

    /// Set the log of the noise mass ignored when bounding the loss range.
    pub fn with_log_mass_truncation_bound(mut self, bound: f64) -> Result<Self> {
        if !bound.is_finite() || bound >= 0.0 {
            return Err(DpError::invalid(format!(
                "log_mass_truncation_bound must be negative and finite, got {bound}"
            )));
        }
        self.log_mass_truncation_bound = bound;
        self.cache.clear();
        Ok(self)
    }

    /// Replace the per-mechanism cache with one of the given capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = MechanismCache::new(capacity);
        self
    }

    /// Neighboring relation analyzed by this accountant.
    pub fn neighboring_relation(&self) -> NeighboringRelation {
        self.neighboring_relation
    }

    /// Grid spacing of discretized losses.
    pub fn value_discretization_interval(&self) -> f64 {
        self.value_discretization_interval
    }

    /// Hit and miss counters of the per-mechanism cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn mechanism_pld(
        &self,
        noise_multiplier: f64,
        sampling_probability: f64,
    ) -> Result<Arc<PrivacyLossDistribution>> {
        let key = MechanismKey::new(noise_multiplier, sampling_probability);
        self.cache.get_or_try_insert_with(key, || {
            let pld = PrivacyLossDistribution::from_gaussian_mechanism(
                noise_multiplier,
                sampling_probability,
                self.value_discretization_interval,
                self.log_mass_truncation_bound,
                self.neighboring_relation,
            )?;
            debug!(
                noise_multiplier,
                sampling_probability,
                grid_points = pld.pmf_remove.size(),
                "discretized single-step PLD"
            );
            Ok(pld)
        })
    }

    fn compose(&self, segments: &[CompositionSegment]) -> Result<PrivacyLossDistribution> {
        let mut total: Option<PrivacyLossDistribution> = None;
        for segment in segments {
            segment.validate()?;
            let single = self.mechanism_pld(segment.noise_multiplier, segment.sampling_probability)?;
            let composed = single.self_compose(segment.num_steps, self.tail_mass_truncation)?;
            total = Some(match total {
                None => composed,
                Some(acc) => acc.compose(&composed, self.tail_mass_truncation)?,
            });
        }
        total.ok_or_else(|| DpError::invalid("at least one composition segment is required"))
    }

    /// Smallest epsilon guaranteed by the composition at `delta`.
    ///
    /// Returns infinity when the mass charged as infinite loss exceeds `delta`.
    pub fn compose_epsilon(&self, segments: &[CompositionSegment], delta: f64) -> Result<f64> {
        validate_delta(delta)?;
        let pld = self.compose(segments)?;
        let epsilon = pld.get_epsilon_for_delta(delta);
        if epsilon.is_nan() {
            return Err(DpError::numerical("PLD epsilon evaluated to NaN"));
        }
        debug!(epsilon, delta, "PLD epsilon");
        Ok(epsilon)
    }

    /// Smallest delta guaranteed by the composition at `epsilon`.
    pub fn compose_delta(&self, segments: &[CompositionSegment], epsilon: f64) -> Result<f64> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(DpError::invalid(format!(
                "epsilon must be non-negative and finite, got {epsilon}"
            )));
        }
        let pld = self.compose(segments)?;
        let delta = pld.get_delta_for_epsilon(epsilon);
        if delta.is_nan() {
            return Err(DpError::numerical("PLD delta evaluated to NaN"));
        }
        debug!(delta, epsilon, "PLD delta");
        Ok(delta)
    }
}

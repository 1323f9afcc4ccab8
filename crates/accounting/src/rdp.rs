//! Rényi Differential Privacy accounting for the Poisson-subsampled Gaussian.
//!
//! Per-step RDP is evaluated exactly at every configured order: integer
//! orders through the binomial expansion of `A_alpha`, fractional orders
//! through the two-sided series with complementary error functions. The
//! composed curve is converted to `(epsilon, delta)` with the tightened
//! conversion of Canonne, Kamath and Steinke.

use std::f64::consts::{PI, SQRT_2};
use std::sync::Arc;

#[cfg(feature = "multithreaded")]
use rayon::prelude::*;
use statrs::function::erf::erfc;
use tracing::debug;

use dpsgd_core::{DpError, Result};

use crate::accountants::CompositionSegment;
use crate::cache::{CacheStats, MechanismCache, MechanismKey, DEFAULT_CACHE_CAPACITY};
use crate::params::validate_delta;

/// Orders at or below this value are skipped by the conversions.
const MIN_CONVERSION_ORDER: f64 = 1.01;
/// Series terms below `exp(-30)` no longer change the fractional sum.
const FRAC_SERIES_CUTOFF: f64 = -30.0;
const MAX_FRAC_SERIES_TERMS: usize = 10_000;

/// RDP accountant over a fixed set of Rényi orders.
#[derive(Clone, Debug)]
pub struct RdpAccountant {
    orders: Vec<f64>,
    log_factorials: Vec<f64>,
    cache: MechanismCache<Vec<f64>>,
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl RdpAccountant {
    /// Create an accountant with default Rényi orders.
    pub fn new() -> Self {
        let orders = normalize_orders(default_orders());
        Self::from_sorted_orders(orders, DEFAULT_CACHE_CAPACITY)
    }

    /// Create an accountant with custom orders.
    ///
    /// Orders must be finite and greater than one; they are sorted and
    /// deduplicated.
    pub fn with_orders(orders: Vec<f64>) -> Result<Self> {
        if orders.is_empty() {
            return Err(DpError::invalid("at least one Rényi order is required"));
        }
        if let Some(bad) = orders.iter().find(|a| !a.is_finite() || **a <= 1.0) {
            return Err(DpError::invalid(format!(
                "Rényi orders must be finite and greater than 1, got {bad}"
            )));
        }
        Ok(Self::from_sorted_orders(
            normalize_orders(orders),
            DEFAULT_CACHE_CAPACITY,
        ))
    }

    /// Replace the per-mechanism cache with one of the given capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = MechanismCache::new(capacity);
        self
    }

    fn from_sorted_orders(orders: Vec<f64>, cache_capacity: usize) -> Self {
        let log_factorials = precompute_log_factorials(max_integer_order(&orders));
        Self {
            orders,
            log_factorials,
            cache: MechanismCache::new(cache_capacity),
        }
    }

    /// Rényi orders in ascending order.
    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Hit and miss counters of the per-mechanism cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// RDP of one subsampled Gaussian step at every order.
    ///
    /// Orders whose value cannot be represented are reported as infinity.
    pub fn mechanism_rdp(
        &self,
        noise_multiplier: f64,
        sampling_probability: f64,
    ) -> Result<Arc<Vec<f64>>> {
        CompositionSegment::new(noise_multiplier, sampling_probability, 1).validate()?;
        let key = MechanismKey::new(noise_multiplier, sampling_probability);
        self.cache.get_or_try_insert_with(key, || {
            let rdp = self.evaluate_orders(noise_multiplier, sampling_probability);
            debug!(
                noise_multiplier,
                sampling_probability,
                finite_orders = rdp.iter().filter(|r| r.is_finite()).count(),
                "computed per-step RDP"
            );
            Ok(rdp)
        })
    }

    #[cfg(feature = "multithreaded")]
    fn evaluate_orders(&self, sigma: f64, q: f64) -> Vec<f64> {
        self.orders
            .par_iter()
            .map(|&alpha| sanitize_rdp(rdp_subsampled_gaussian(alpha, sigma, q, &self.log_factorials)))
            .collect()
    }

    #[cfg(not(feature = "multithreaded"))]
    fn evaluate_orders(&self, sigma: f64, q: f64) -> Vec<f64> {
        self.orders
            .iter()
            .map(|&alpha| sanitize_rdp(rdp_subsampled_gaussian(alpha, sigma, q, &self.log_factorials)))
            .collect()
    }

    /// Total RDP curve of a sequence of segments.
    pub fn compose(&self, segments: &[CompositionSegment]) -> Result<Vec<f64>> {
        if segments.is_empty() {
            return Err(DpError::invalid("at least one composition segment is required"));
        }
        let mut total = vec![0.0; self.orders.len()];
        for segment in segments {
            segment.validate()?;
            let per_step =
                self.mechanism_rdp(segment.noise_multiplier, segment.sampling_probability)?;
            let steps = segment.num_steps as f64;
            for (acc, step_rdp) in total.iter_mut().zip(per_step.iter()) {
                *acc += step_rdp * steps;
            }
        }
        Ok(total)
    }

    /// Smallest epsilon guaranteed by the composition at `delta`.
    pub fn compose_epsilon(&self, segments: &[CompositionSegment], delta: f64) -> Result<f64> {
        validate_delta(delta)?;
        let rdp = self.compose(segments)?;
        let (epsilon, order) = epsilon_from_rdp(&self.orders, &rdp, delta)?;
        debug!(epsilon, order, delta, "RDP epsilon");
        Ok(epsilon)
    }

    /// Smallest delta guaranteed by the composition at `epsilon`.
    pub fn compose_delta(&self, segments: &[CompositionSegment], epsilon: f64) -> Result<f64> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(DpError::invalid(format!(
                "epsilon must be non-negative and finite, got {epsilon}"
            )));
        }
        let rdp = self.compose(segments)?;
        let (delta, order) = delta_from_rdp(&self.orders, &rdp, epsilon)?;
        debug!(delta, order, epsilon, "RDP delta");
        Ok(delta)
    }
}

/// Default Rényi orders.
///
/// - `linspace(1.01, 8, num=50)`
/// - `arange(8, 64)`
/// - `linspace(65, 512, num=10)` rounded to integers
pub fn default_orders() -> Vec<f64> {
    let mut orders = Vec::new();

    orders.extend(linspace(1.01, 8.0, 50));
    for a in 8..64 {
        orders.push(a as f64);
    }
    for a in linspace(65.0, 512.0, 10) {
        orders.push(a.round());
    }

    orders
}

/// Convert an RDP curve to epsilon at `delta`; returns `(epsilon, order)`.
pub fn epsilon_from_rdp(orders: &[f64], rdp: &[f64], delta: f64) -> Result<(f64, f64)> {
    validate_delta(delta)?;
    check_curve(orders, rdp)?;
    let mut best = (f64::INFINITY, f64::NAN);
    for (&alpha, &r) in orders.iter().zip(rdp) {
        if !r.is_finite() {
            continue;
        }
        let eps = if delta * delta + (-r).exp_m1() > 0.0 {
            0.0
        } else if alpha > MIN_CONVERSION_ORDER {
            r + (-1.0 / alpha).ln_1p() - (delta * alpha).ln() / (alpha - 1.0)
        } else {
            f64::INFINITY
        };
        if eps < best.0 {
            best = (eps, alpha);
        }
    }
    if !best.0.is_finite() {
        return Err(DpError::numerical(
            "no Rényi order yields a finite epsilon bound",
        ));
    }
    Ok((best.0.max(0.0), best.1))
}

/// Convert an RDP curve to delta at `epsilon`; returns `(delta, order)`.
pub fn delta_from_rdp(orders: &[f64], rdp: &[f64], epsilon: f64) -> Result<(f64, f64)> {
    check_curve(orders, rdp)?;
    let mut best = (f64::INFINITY, f64::NAN);
    for (&alpha, &r) in orders.iter().zip(rdp) {
        if !r.is_finite() || r < 0.0 {
            continue;
        }
        let mut log_delta = 0.5 * (-(-r).exp()).ln_1p();
        if alpha > MIN_CONVERSION_ORDER {
            let bound = (alpha - 1.0) * (r - epsilon + (-1.0 / alpha).ln_1p()) - alpha.ln();
            log_delta = log_delta.min(bound);
        }
        if log_delta < best.0 {
            best = (log_delta, alpha);
        }
    }
    if best.1.is_nan() {
        return Err(DpError::numerical(
            "no Rényi order yields a finite delta bound",
        ));
    }
    Ok((best.0.exp().min(1.0), best.1))
}

fn check_curve(orders: &[f64], rdp: &[f64]) -> Result<()> {
    if orders.len() != rdp.len() {
        return Err(DpError::invalid(format!(
            "{} orders but {} RDP values",
            orders.len(),
            rdp.len()
        )));
    }
    Ok(())
}

fn normalize_orders(mut orders: Vec<f64>) -> Vec<f64> {
    orders.sort_by(f64::total_cmp);
    orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
    orders
}

fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    if num == 0 {
        return Vec::new();
    }
    if num == 1 {
        return vec![start];
    }
    let step = (end - start) / (num as f64 - 1.0);
    (0..num).map(|i| start + step * i as f64).collect()
}

fn max_integer_order(orders: &[f64]) -> usize {
    orders
        .iter()
        .copied()
        .filter(|&a| is_integer(a))
        .map(|a| a.round() as usize)
        .max()
        .unwrap_or(0)
}

fn precompute_log_factorials(max_alpha: usize) -> Vec<f64> {
    let mut log_fact = vec![0.0; max_alpha.saturating_add(1)];
    for i in 1..log_fact.len() {
        log_fact[i] = log_fact[i - 1] + (i as f64).ln();
    }
    log_fact
}

fn sanitize_rdp(value: f64) -> f64 {
    if value.is_nan() || value == f64::INFINITY {
        f64::INFINITY
    } else {
        value.max(0.0)
    }
}

/// RDP of the subsampled Gaussian mechanism at order `alpha`.
fn rdp_subsampled_gaussian(alpha: f64, sigma: f64, q: f64, log_fact: &[f64]) -> f64 {
    if q == 1.0 {
        return alpha / (2.0 * sigma * sigma);
    }
    let log_a = if is_integer(alpha) {
        let a = alpha.round() as usize;
        match log_fact.get(a) {
            Some(_) => log_a_int(q, sigma, a, log_fact),
            None => return f64::INFINITY,
        }
    } else {
        log_a_frac(q, sigma, alpha)
    };
    log_a / (alpha - 1.0)
}

fn is_integer(x: f64) -> bool {
    (x - x.round()).abs() < 1e-9
}

/// `log(A_alpha)` for integer `alpha`.
fn log_a_int(q: f64, sigma: f64, alpha: usize, log_fact: &[f64]) -> f64 {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let two_sigma_sq = 2.0 * sigma * sigma;
    let alpha_f = alpha as f64;

    let mut log_sum = f64::NEG_INFINITY;
    for j in 0..=alpha {
        let j_f = j as f64;
        let log_binom = log_fact[alpha] - log_fact[j] - log_fact[alpha - j];
        let log_term = log_binom
            + j_f * log_q
            + (alpha_f - j_f) * log_1mq
            + (j_f * j_f - j_f) / two_sigma_sq;
        log_sum = log_add_exp(log_sum, log_term);
    }
    log_sum
}

/// `log(A_alpha)` for fractional `alpha`.
///
/// Splits the integral at `z0` and sums both halves as series with
/// generalized binomial coefficients, whose signs alternate once `i`
/// exceeds `alpha`.
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> f64 {
    let sigma_sq = sigma * sigma;
    let two_sigma_sq = 2.0 * sigma_sq;
    let z0 = sigma_sq * (1.0 / q - 1.0).ln() + 0.5;
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let log_half = 0.5f64.ln();
    let scale = SQRT_2 * sigma;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    let mut log_coef = 0.0;
    let mut coef_positive = true;

    for i in 0..MAX_FRAC_SERIES_TERMS {
        let i_f = i as f64;
        let j = alpha - i_f;

        let log_t0 = log_coef + i_f * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + i_f * log_1mq;
        let log_e0 = log_half + log_erfc((i_f - z0) / scale);
        let log_e1 = log_half + log_erfc((z0 - j) / scale);
        let log_s0 = log_t0 + (i_f * i_f - i_f) / two_sigma_sq + log_e0;
        let log_s1 = log_t1 + (j * j - j) / two_sigma_sq + log_e1;

        if coef_positive {
            log_a0 = log_add_exp(log_a0, log_s0);
            log_a1 = log_add_exp(log_a1, log_s1);
        } else {
            log_a0 = log_sub_exp(log_a0, log_s0);
            log_a1 = log_sub_exp(log_a1, log_s1);
        }

        if log_s0.max(log_s1) < FRAC_SERIES_CUTOFF {
            return log_add_exp(log_a0, log_a1);
        }

        // binom(alpha, i + 1) = binom(alpha, i) * (alpha - i) / (i + 1)
        if j < 0.0 {
            coef_positive = !coef_positive;
        }
        log_coef += j.abs().ln() - (i_f + 1.0).ln();
    }
    f64::NAN
}

/// Numerically stable `log(exp(a) + exp(b))`.
fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Numerically stable `log(exp(a) - exp(b))`; NaN when `b > a`.
fn log_sub_exp(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if b > a {
        return f64::NAN;
    }
    if a == b {
        return f64::NEG_INFINITY;
    }
    a + (-(b - a).exp_m1()).ln()
}

/// `log(erfc(x))`, falling back to the asymptotic expansion once `erfc`
/// underflows.
fn log_erfc(x: f64) -> f64 {
    let value = erfc(x);
    if value > 0.0 {
        return value.ln();
    }
    let x2 = x * x;
    -0.5 * PI.ln() - x.ln() - x2 - 0.5 / x2 + 0.625 / (x2 * x2) - 37.0 / 24.0 / (x2 * x2 * x2)
        + 353.0 / 64.0 / (x2 * x2 * x2 * x2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn single(nm: f64, q: f64, steps: u64) -> [CompositionSegment; 1] {
        [CompositionSegment::new(nm, q, steps)]
    }

    #[test]
    fn single_step_is_finite_and_positive() {
        let acc = RdpAccountant::new();
        let eps = acc.compose_epsilon(&single(1.0, 0.01, 1), 1e-5).expect("epsilon");
        assert!(eps.is_finite());
        assert!(eps > 0.0);
    }

    #[test]
    fn epsilon_increases_with_steps() {
        let acc = RdpAccountant::new();
        let eps1 = acc.compose_epsilon(&single(1.0, 0.01, 1), 1e-5).expect("epsilon");
        let eps2 = acc.compose_epsilon(&single(1.0, 0.01, 2), 1e-5).expect("epsilon");
        assert!(eps2 > eps1);
    }

    #[test]
    fn default_orders_cover_large_alphas() {
        let orders = default_orders();
        let max = orders.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!(max >= 512.0);
        assert!(orders.iter().any(|&a| (a - 1.01).abs() < 1e-9));
    }

    #[test]
    fn full_batch_matches_gaussian_closed_form() {
        let acc = RdpAccountant::with_orders(vec![2.0, 2.5, 10.0]).expect("orders");
        let rdp = acc.mechanism_rdp(2.0, 1.0).expect("rdp");
        for (alpha, value) in acc.orders().iter().zip(rdp.iter()) {
            assert!((value - alpha / 8.0).abs() < 1e-12);
        }
    }

    #[test]
    fn fractional_orders_lie_between_integer_neighbours() {
        let acc = RdpAccountant::with_orders(vec![4.0, 4.5, 5.0]).expect("orders");
        let rdp = acc.mechanism_rdp(1.1, 0.05).expect("rdp");
        assert!(rdp[0] <= rdp[1] + 1e-12);
        assert!(rdp[1] <= rdp[2] + 1e-12);
    }

    #[test]
    fn fractional_series_agrees_with_integer_expansion_near_integers() {
        let log_fact = precompute_log_factorials(8);
        let exact = log_a_int(0.02, 1.5, 6, &log_fact) / 5.0;
        let near = log_a_frac(0.02, 1.5, 6.0 + 1e-7) / (5.0 + 1e-7);
        assert!((exact - near).abs() < 1e-5 * exact.abs().max(1e-12));
    }

    #[test]
    fn composition_is_additive() {
        let acc = RdpAccountant::new();
        let split = acc
            .compose(&[
                CompositionSegment::new(1.3, 0.02, 2),
                CompositionSegment::new(1.3, 0.02, 3),
            ])
            .expect("split");
        let joint = acc.compose(&single(1.3, 0.02, 5)).expect("joint");
        for (a, b) in split.iter().zip(joint.iter()) {
            assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0));
        }
    }

    #[test]
    fn delta_and_epsilon_conversions_are_consistent() {
        let acc = RdpAccountant::new();
        let segments = single(1.1, 0.01, 1_000);
        let eps = acc.compose_epsilon(&segments, 1e-5).expect("epsilon");
        let delta = acc.compose_delta(&segments, eps).expect("delta");
        assert!(delta <= 1e-5 * 1.01);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let acc = RdpAccountant::new();
        assert!(acc.compose_epsilon(&single(0.0, 0.01, 1), 1e-5).is_err());
        assert!(acc.compose_epsilon(&single(1.0, 0.0, 1), 1e-5).is_err());
        assert!(acc.compose_epsilon(&single(1.0, 1.5, 1), 1e-5).is_err());
        assert!(acc.compose_epsilon(&single(1.0, 0.1, 0), 1e-5).is_err());
        assert!(acc.compose_epsilon(&single(1.0, 0.1, 1), 1.0).is_err());
        assert!(acc.compose_epsilon(&[], 1e-5).is_err());
        assert!(RdpAccountant::with_orders(vec![0.5]).is_err());
        assert!(RdpAccountant::with_orders(Vec::new()).is_err());
    }

    #[test]
    fn cache_serves_repeated_mechanisms() {
        let acc = RdpAccountant::new().with_cache_capacity(2);
        for _ in 0..3 {
            acc.compose_epsilon(&single(1.0, 0.01, 10), 1e-5).expect("epsilon");
        }
        let stats = acc.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn log_erfc_is_continuous_across_underflow() {
        let below = log_erfc(26.0);
        let above = log_erfc(27.5);
        assert!(below.is_finite() && above.is_finite());
        assert!(above < below);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]
        #[test]
        fn epsilon_is_monotone_in_noise(
            nm in 0.5f64..5.0,
            q in 0.001f64..0.2,
            steps in 1u64..500,
        ) {
            let acc = RdpAccountant::new();
            let low = acc.compose_epsilon(&single(nm, q, steps), 1e-5).expect("epsilon");
            let high = acc.compose_epsilon(&single(nm * 1.5, q, steps), 1e-5).expect("epsilon");
            prop_assert!(high <= low + 1e-9);
        }

        #[test]
        fn epsilon_is_monotone_in_sampling_rate(
            nm in 0.5f64..5.0,
            q in 0.001f64..0.5,
            steps in 1u64..500,
        ) {
            let acc = RdpAccountant::new();
            let low = acc.compose_epsilon(&single(nm, q, steps), 1e-5).expect("epsilon");
            let high = acc.compose_epsilon(&single(nm, (q * 1.5).min(1.0), steps), 1e-5).expect("epsilon");
            prop_assert!(low <= high + 1e-9);
        }
    }
}

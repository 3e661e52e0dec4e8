//! Numeric kernels: compensated summation, log-space arithmetic, robust
//! estimators, and Welford statistical summaries.
//!
//! These primitives carry the numerical-stability guarantees the rest of the
//! system depends on:
//!
//! - [`KahanSum`] bounds cumulative rounding error to O(1) ulps independent
//!   of the number of terms.
//! - [`log_sum_exp`] sums values expressed as logarithms without overflow or
//!   underflow, for log-likelihood magnitudes up to 1e6.
//! - [`median`] / [`median_absolute_deviation`] are robust to adversarial
//!   contamination, unlike ordinary mean/variance.
//! - [`WelfordSummary`] computes mean and variance in a single numerically
//!   stable pass, and merges summaries with the parallel-variance formula so
//!   that merge order never changes the result beyond floating-point
//!   tolerance. The naive single-pass sum-of-squares alternative loses
//!   precision past ~1e6 records and must not be used.

use serde::{Deserialize, Serialize};

/// Normal-consistency constant: MAD * 1.4826 estimates the standard
/// deviation of normally distributed data.
pub const MAD_NORMAL_CONSISTENCY: f64 = 1.4826;

/// Kahan (compensated) floating-point accumulator.
///
/// Tracks a running compensation term so that the accumulated error stays
/// bounded regardless of how many values are added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sum: 0.0,
            compensation: 0.0,
        }
    }

    /// Add a value with compensation (Neumaier's variant, which also
    /// handles terms larger than the running sum).
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    /// The compensated total.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }

    /// The raw compensation term (for diagnostics).
    #[must_use]
    pub const fn compensation(&self) -> f64 {
        self.compensation
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Self::new();
        for v in iter {
            acc.add(v);
        }
        acc
    }
}

/// Compute `ln(sum(exp(v)))` without overflow or underflow.
///
/// Shifts by the maximum before exponentiating, then accumulates the
/// exponentials with compensation. Returns negative infinity for an empty
/// slice (the log of zero mass).
#[must_use]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        // All-infinite input: the shift is meaningless, but the sum is too.
        return max;
    }
    let mut acc = KahanSum::new();
    for v in values {
        acc.add((v - max).exp());
    }
    max + acc.value().ln()
}

/// Median of a slice. Returns `None` for an empty slice.
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation scaled by the normal-consistency constant.
///
/// A robust standard-deviation estimator: a minority of arbitrarily large
/// outliers cannot inflate it, which is what makes the Byzantine filter
/// resistant to poisoning.
#[must_use]
pub fn median_absolute_deviation(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations).map(|m| m * MAD_NORMAL_CONSISTENCY)
}

/// Welford sufficient statistics: count, mean, and sum of squared
/// deviations (M2).
///
/// Supports both incremental single-value updates and pairwise merging via
/// the parallel-variance combination formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WelfordSummary {
    count: u64,
    mean: f64,
    m2: f64,
}

impl WelfordSummary {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Reconstruct a summary from its raw triple.
    #[must_use]
    pub const fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self { count, mean, m2 }
    }

    /// Incorporate a single observation.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Combine two summaries with the parallel-variance formula:
    ///
    /// ```text
    /// combined_mean = (n1*m1 + n2*m2) / (n1 + n2)
    /// combined_M2   = M2_1 + M2_2 + delta^2 * n1*n2 / (n1 + n2)
    /// ```
    ///
    /// A zero-count side is skipped; merging is associative within
    /// floating-point tolerance.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        if other.count == 0 {
            return *self;
        }
        if self.count == 0 {
            return *other;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let total = n1 + n2;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * (n2 / total);
        let m2 = self.m2 + other.m2 + delta * delta * (n1 * n2 / total);
        Self {
            count: self.count + other.count,
            mean,
            m2,
        }
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    #[must_use]
    pub const fn m2(&self) -> f64 {
        self.m2
    }

    /// Sample variance (n-1 denominator). Zero below two observations.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Standard error of the mean.
    #[must_use]
    pub fn std_error(&self) -> f64 {
        if self.count == 0 {
            return f64::INFINITY;
        }
        (self.variance() / self.count as f64).sqrt()
    }

    /// Half-width of the 95% confidence interval around the mean.
    #[must_use]
    pub fn ci95_half_width(&self) -> f64 {
        if self.count == 0 {
            return f64::INFINITY;
        }
        1.96 * self.std_error()
    }

    /// The 95% confidence interval as (low, high).
    #[must_use]
    pub fn ci95(&self) -> (f64, f64) {
        let half = self.ci95_half_width();
        (self.mean - half, self.mean + half)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

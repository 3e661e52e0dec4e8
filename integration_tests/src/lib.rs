//! Integration test helpers for evidence_chain.
//!
//! Provides utilities for setting up multi-node pipeline scenarios and
//! deterministic statistical inputs.

use evidence_chain::{BaselinePipeline, EvidenceRecord, Identity, PipelineConfig};

/// Create a pipeline with `n` registered node identities.
pub fn test_cluster(n: usize) -> (BaselinePipeline, Vec<Identity>) {
    test_cluster_with(n, PipelineConfig::default())
}

/// Create a pipeline from an explicit config with `n` registered nodes.
pub fn test_cluster_with(n: usize, config: PipelineConfig) -> (BaselinePipeline, Vec<Identity>) {
    let pipeline = BaselinePipeline::new(config);
    let identities = (0..n)
        .map(|_| {
            let identity = Identity::generate();
            pipeline.registry().register(&identity);
            identity
        })
        .collect();
    (pipeline, identities)
}

/// Create a signed evidence record with a fixed payload.
pub fn signed_record(identity: &Identity, id: &str, llr: f64, timestamp_ms: u64) -> EvidenceRecord {
    EvidenceRecord::create(id, b"observed metric sample".to_vec(), timestamp_ms, llr, identity)
}

/// Inverse of the standard normal CDF (Acklam's rational approximation,
/// relative error below 1.15e-9 over the open unit interval).
///
/// # Panics
/// Panics if `p` is outside `(0, 1)`.
#[allow(clippy::unreadable_literal)]
pub fn inverse_normal_cdf(p: f64) -> f64 {
    assert!(p > 0.0 && p < 1.0, "p must be in (0, 1), got {p}");

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Deterministic standard-normal sample: quantiles at the midpoints of `n`
/// equal-probability strata. Symmetric, so the sample mean is exactly zero
/// and the sample standard deviation is just under one.
pub fn stratified_normal(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| inverse_normal_cdf((i as f64 + 0.5) / n as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_normal_cdf_known_points() {
        assert!(inverse_normal_cdf(0.5).abs() < 1e-12);
        assert!((inverse_normal_cdf(0.975) - 1.959964).abs() < 1e-5);
        assert!((inverse_normal_cdf(0.025) + 1.959964).abs() < 1e-5);
        assert!((inverse_normal_cdf(0.999) - 3.090232).abs() < 1e-5);
    }

    #[test]
    fn test_stratified_normal_symmetric() {
        let sample = stratified_normal(1000);
        let sum: f64 = sample.iter().sum();
        assert!(sum.abs() < 1e-9, "stratified sample must be symmetric");
        let var: f64 = sample.iter().map(|x| x * x).sum::<f64>() / 999.0;
        assert!((var - 1.0).abs() < 0.01, "variance {var} should be near 1");
    }
}

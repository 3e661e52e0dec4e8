//! Hierarchical merge correctness at scale: the tree's global baseline
//! must match a flat single-pass Welford accumulation regardless of how
//! sources are sharded into leaves.

use evidence_chain::{
    AggregationConfig, AggregationScope, AggregationTree, WelfordSummary,
};
use integration_tests::stratified_normal;

#[test]
fn tree_matches_flat_welford_for_normal_sample() {
    let tree = AggregationTree::default();
    let values = stratified_normal(5_000);

    let mut flat = WelfordSummary::new();
    for (i, &v) in values.iter().enumerate() {
        tree.ingest(&format!("src-{}", i % 500), v, i as u64).unwrap();
        flat.push(v);
    }

    let baseline = tree.query(&AggregationScope::Global).unwrap();
    assert_eq!(baseline.count, 5_000);
    assert!(baseline.mean.abs() < 1e-9, "mean {}", baseline.mean);
    assert!(
        (baseline.variance - flat.variance()).abs() / flat.variance() < 1e-9,
        "tree variance {} vs flat {}",
        baseline.variance,
        flat.variance()
    );
}

#[test]
fn merge_is_associative_across_shardings() {
    let values = stratified_normal(4_096);

    // Shard into 4, 16, and 64 summaries; all merge orders must agree.
    let mut merged: Vec<WelfordSummary> = Vec::new();
    for shards in [4usize, 16, 64] {
        let mut parts = vec![WelfordSummary::new(); shards];
        for (i, &v) in values.iter().enumerate() {
            parts[i % shards].push(v);
        }
        let combined = parts
            .iter()
            .fold(WelfordSummary::new(), |acc, p| acc.merge(p));
        merged.push(combined);
    }

    for pair in merged.windows(2) {
        assert_eq!(pair[0].count(), pair[1].count());
        assert!((pair[0].mean() - pair[1].mean()).abs() < 1e-10);
        assert!((pair[0].variance() - pair[1].variance()).abs() < 1e-8);
    }
}

#[test]
fn merge_stable_with_large_offset() {
    // Catastrophic-cancellation regime: tiny variance on a huge mean.
    let offset = 1e9;
    let values: Vec<f64> = stratified_normal(10_000)
        .into_iter()
        .map(|v| offset + v * 1e-3)
        .collect();

    let mut left = WelfordSummary::new();
    let mut right = WelfordSummary::new();
    for (i, &v) in values.iter().enumerate() {
        if i % 2 == 0 {
            left.push(v);
        } else {
            right.push(v);
        }
    }
    let merged = left.merge(&right);

    let expected_var = 1e-6; // (1e-3)^2 times unit variance
    assert!((merged.mean() - offset).abs() < 1e-3);
    assert!(
        (merged.variance() - expected_var).abs() / expected_var < 0.05,
        "variance {} collapsed under the offset",
        merged.variance()
    );
}

#[test]
fn deep_tree_propagation_stays_logarithmic() {
    let config = AggregationConfig::default()
        .with_branching_factor(4)
        .with_max_leaf_size(8);
    let tree = AggregationTree::new(config);

    for i in 0..512 {
        tree.ingest(&format!("src-{i}"), 1.0, 0).unwrap();
    }
    let update = tree.ingest("src-0", 2.0, 1).unwrap();
    // leaf -> regional -> sector -> global, independent of 512 sources.
    assert!(update.propagation_path.len() <= 3);

    let baseline = tree.query(&AggregationScope::Global).unwrap();
    assert_eq!(baseline.count, 513);
}

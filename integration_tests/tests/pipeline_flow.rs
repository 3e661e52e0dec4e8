//! Full pipeline flow: many nodes observing a common distribution, rounds
//! confirming baselines, duplicates staying idempotent, and the final
//! baseline matching the generating distribution.

use evidence_chain::{
    AggregationScope, ConsensusOutcome, ConsistencyLevel, EvidenceError,
};
use integration_tests::{signed_record, stratified_normal, test_cluster};

#[test]
fn thousand_nodes_recover_the_distribution() {
    let (pipeline, identities) = test_cluster(1_000);
    let values = stratified_normal(1_000);

    for (i, identity) in identities.iter().enumerate() {
        pipeline
            .ingest(
                signed_record(identity, &format!("ev-{i}"), 0.0, 1_000),
                values[i],
                1_000,
            )
            .unwrap();
    }

    let result = pipeline.close_round(1_000, 2_000).unwrap();
    assert_eq!(result.outcome, ConsensusOutcome::Accepted);

    let baseline = pipeline.tree().query(&AggregationScope::Global).unwrap();
    assert_eq!(baseline.count, 1_000);
    assert!(baseline.mean.abs() < 1e-9, "mean {}", baseline.mean);
    assert!(
        (baseline.variance - 1.0).abs() < 0.02,
        "variance {} should be near 1",
        baseline.variance
    );

    // CI for 1000 unit-variance samples: about +/- 0.062.
    let half = (baseline.ci95.1 - baseline.ci95.0) / 2.0;
    assert!((half - 1.96 / (1_000f64).sqrt()).abs() < 0.01);

    let answer = pipeline.baseline(2_000);
    assert_eq!(answer.consistency, ConsistencyLevel::Full);
}

#[test]
fn duplicate_submission_is_idempotent() {
    let (pipeline, identities) = test_cluster(2);

    pipeline
        .ingest(signed_record(&identities[0], "ev-0", 0.3, 1_000), 5.0, 1_000)
        .unwrap();
    let err = pipeline
        .ingest(signed_record(&identities[0], "ev-0", 0.3, 1_000), 5.0, 1_000)
        .unwrap_err();
    assert!(matches!(err, EvidenceError::DuplicateEvidence(_)));

    // One observation in the tree, one record in the pool.
    assert_eq!(
        pipeline.tree().query(&AggregationScope::Global).unwrap().count,
        1
    );
    assert_eq!(pipeline.engine().pool_len(), 1);
    assert_eq!(pipeline.metrics().snapshot().evidence_duplicates, 1);
}

#[test]
fn successive_rounds_accumulate_statistics() {
    let (pipeline, identities) = test_cluster(5);

    for round in 0..10u64 {
        let now = 1_000 + round * 100;
        for (i, identity) in identities.iter().enumerate() {
            pipeline
                .ingest(
                    signed_record(identity, &format!("r{round}-ev-{i}"), 0.1, now),
                    round as f64,
                    now,
                )
                .unwrap();
        }
        let result = pipeline.close_round(5, now + 50).unwrap();
        assert_eq!(result.outcome, ConsensusOutcome::Accepted);
        assert_eq!(result.round_id, round + 1);
    }

    let baseline = pipeline.tree().query(&AggregationScope::Global).unwrap();
    assert_eq!(baseline.count, 50);
    assert!((baseline.mean - 4.5).abs() < 1e-9);

    let snapshot = pipeline.metrics().snapshot();
    assert_eq!(snapshot.evidence_accepted, 50);
    assert_eq!(snapshot.rounds_accepted, 10);
    assert_eq!(snapshot.evidence_rejected, 0);
}

#[test]
fn unregistered_node_cannot_contribute() {
    let (pipeline, _) = test_cluster(2);
    let stranger = evidence_chain::Identity::generate();
    let err = pipeline
        .ingest(signed_record(&stranger, "ev-x", 0.3, 1_000), 5.0, 1_000)
        .unwrap_err();
    assert!(matches!(err, EvidenceError::UnknownNode(_)));
    assert_eq!(pipeline.tree().source_count(), 0);
}

#[tokio::test]
async fn timed_rounds_confirm_baselines() {
    let config = evidence_chain::PipelineConfig {
        consensus: evidence_chain::ConsensusConfig::default().with_round_timeout_ms(20),
        ..Default::default()
    };
    let (pipeline, identities) = integration_tests::test_cluster_with(3, config);

    for (i, identity) in identities.iter().enumerate() {
        pipeline
            .ingest(signed_record(identity, &format!("ev-{i}"), 0.2, 1_000), 7.0, 1_000)
            .unwrap();
    }
    let result = pipeline.run_round(3, 1_000).await.unwrap();
    assert_eq!(result.outcome, ConsensusOutcome::Accepted);
    assert!(pipeline.resolver().confirmed().is_some());
}

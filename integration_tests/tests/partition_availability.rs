//! Partition behavior end to end: every query is answered at every
//! severity, degraded answers carry honest staleness metadata, and heal
//! reconciles divergent branches back into one confirmed baseline.

use evidence_chain::{
    ClockIssuer, ConsistencyLevel, HealBranch, Identity, PartitionState, WelfordSummary,
};
use integration_tests::{signed_record, test_cluster};

fn confirmed_pipeline() -> (evidence_chain::BaselinePipeline, Vec<Identity>) {
    let (pipeline, identities) = test_cluster(4);
    for (i, identity) in identities.iter().enumerate() {
        pipeline
            .ingest(signed_record(identity, &format!("ev-{i}"), 0.2, 1_000), 10.0, 1_000)
            .unwrap();
    }
    pipeline.close_round(4, 1_500).unwrap();
    (pipeline, identities)
}

#[test]
fn severe_partition_answers_every_query() {
    let (pipeline, _) = confirmed_pipeline();
    pipeline
        .resolver()
        .set_partition_state(PartitionState::SeverePartition);

    for i in 0..100u64 {
        let answer = pipeline.baseline(2_000 + i * 1_000);
        assert_eq!(answer.consistency, ConsistencyLevel::Degraded);
        assert_eq!(answer.baseline.count, 4);
        assert_eq!(answer.partition_state, PartitionState::SeverePartition);
        assert!(answer.proof.is_some(), "degraded answer keeps its round proof");
    }
    assert_eq!(pipeline.metrics().snapshot().degraded_queries, 100);
}

#[test]
fn staleness_grows_and_confidence_decays() {
    let (pipeline, _) = confirmed_pipeline();
    pipeline
        .resolver()
        .set_partition_state(PartitionState::MajorPartition);

    let early = pipeline.baseline(2_000);
    let late = pipeline.baseline(120_000);
    assert!(late.staleness_ms > early.staleness_ms);
    assert!(late.confidence_factor < early.confidence_factor);

    let early_width = early.confidence_interval.1 - early.confidence_interval.0;
    let late_width = late.confidence_interval.1 - late.confidence_interval.0;
    assert!(late_width > early_width, "interval must widen, not narrow");
}

#[test]
fn consensus_threshold_tightens_while_partitioned() {
    let (pipeline, identities) = confirmed_pipeline();
    pipeline
        .resolver()
        .set_partition_state(PartitionState::MinorPartition);
    assert!((pipeline.engine().effective_threshold() - 0.90).abs() < 1e-12);

    // 3 of 4 nodes reachable: enough for 0.75, not for 0.90.
    for (i, identity) in identities.iter().take(3).enumerate() {
        pipeline
            .ingest(signed_record(identity, &format!("p-{i}"), 0.2, 5_000), 10.0, 5_000)
            .unwrap();
    }
    let result = pipeline.close_round(4, 6_000).unwrap();
    assert_eq!(
        result.outcome,
        evidence_chain::ConsensusOutcome::InsufficientConsensus
    );
}

#[test]
fn heal_merges_partition_branches_and_restores_service() {
    let (pipeline, identities) = confirmed_pipeline();
    pipeline
        .resolver()
        .set_partition_state(PartitionState::MajorPartition);

    // Two sides accumulated statistics independently.
    let mut left = WelfordSummary::new();
    for v in [9.0, 10.0, 11.0] {
        left.push(v);
    }
    let mut right = WelfordSummary::new();
    for v in [10.0, 12.0] {
        right.push(v);
    }

    let mut left_issuer = ClockIssuer::new(&identities[0]);
    let mut right_issuer = ClockIssuer::new(&identities[1]);
    let branches = vec![
        HealBranch {
            head: left_issuer.advance(&identities[0], 9_000),
            summary: left,
            weight: 3.0,
        },
        HealBranch {
            head: right_issuer.advance(&identities[1], 9_100),
            summary: right,
            weight: 2.0,
        },
    ];

    let report = pipeline.resolver().heal(branches, 10_000).unwrap();
    assert_eq!(report.accepted_branches.len(), 2);
    assert_eq!(report.merged.count, 5);
    assert!((report.merged.mean - 10.4).abs() < 1e-9);
    assert_eq!(
        pipeline.resolver().partition_state(),
        PartitionState::FullyConnected
    );
    // Threshold back to baseline after heal.
    assert!((pipeline.engine().effective_threshold() - 0.75).abs() < 1e-12);
    assert_eq!(pipeline.metrics().snapshot().heal_sessions, 1);
}

#[test]
fn heal_rejects_forged_branch_and_still_recovers() {
    let (pipeline, identities) = confirmed_pipeline();
    pipeline
        .resolver()
        .set_partition_state(PartitionState::SeverePartition);

    let mut honest_summary = WelfordSummary::new();
    honest_summary.push(10.0);
    honest_summary.push(10.5);

    let mut honest_issuer = ClockIssuer::new(&identities[0]);
    let honest = HealBranch {
        head: honest_issuer.advance(&identities[0], 9_000),
        summary: honest_summary,
        weight: 2.0,
    };

    let mut forged_summary = WelfordSummary::new();
    forged_summary.push(1_000.0);
    let mut forged_issuer = ClockIssuer::new(&identities[1]);
    let mut forged = HealBranch {
        head: forged_issuer.advance(&identities[1], 9_000),
        summary: forged_summary,
        weight: 100.0,
    };
    forged.head.logical_time += 5; // invalidates the signature

    let report = pipeline.resolver().heal(vec![honest, forged], 10_000).unwrap();
    assert_eq!(report.accepted_branches, vec![identities[0].node_id()]);
    assert_eq!(report.rejected_branches, vec![identities[1].node_id()]);
    assert_eq!(report.merged.count, 2);
    assert!(report.merged.mean < 11.0, "forged statistics must not leak in");
}

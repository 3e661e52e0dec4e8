// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Statistical CAP resolution under network partitions.
//!
//! The resolver owns the availability/consistency trade-off as an explicit,
//! partition-state-driven policy instead of an implicit failure mode. As
//! connectivity degrades, the consensus threshold rises (harder to confirm
//! new baselines) while queries keep answering from the last confirmed
//! baseline plus locally observed updates, tagged with their staleness.
//!
//! Under a severe partition the resolver still answers 100% of queries; it
//! trades freshness, never availability. The caller sees exactly how stale
//! the answer is and how much its confidence interval was widened.
//!
//! On heal, divergent branches are reconciled through their signed clock
//! chains: forged heads are discarded, forks resolve toward the branch with
//! more accumulated evidence weight, and the surviving statistics merge.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    aggregation::Baseline,
    clock::{is_fork, VectorClock},
    consensus::{ConsensusEngine, ConsensusProof},
    error::{EvidenceError, Result},
    metrics::PipelineStats,
    signing::{NodeId, ValidatorRegistry},
    stats::WelfordSummary,
};

/// Additive threshold penalty applied while partitioned.
pub const PARTITION_PENALTY: f64 = 0.15;

/// Hard ceiling on the consensus threshold; above this consensus would be
/// unreachable with realistic participation.
pub const MAX_THRESHOLD: f64 = 0.90;

/// Observed connectivity, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    FullyConnected,
    MinorPartition,
    MajorPartition,
    SeverePartition,
}

impl PartitionState {
    /// Multiplier applied to confidence-interval half-widths.
    #[must_use]
    pub const fn ci_widen_factor(self) -> f64 {
        match self {
            Self::FullyConnected => 1.0,
            Self::MinorPartition => 1.5,
            Self::MajorPartition => 2.0,
            Self::SeverePartition => 3.0,
        }
    }

    #[must_use]
    pub const fn is_partitioned(self) -> bool {
        !matches!(self, Self::FullyConnected)
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FullyConnected => "fully_connected",
            Self::MinorPartition => "minor_partition",
            Self::MajorPartition => "major_partition",
            Self::SeverePartition => "severe_partition",
        };
        f.write_str(s)
    }
}

/// Resolver policy knobs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Threshold in force when fully connected.
    pub base_threshold: f64,
    /// Staleness at which confidence has decayed by `1/e`.
    pub max_staleness_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_threshold: crate::consensus::DEFAULT_SUPERMAJORITY,
            max_staleness_ms: 60_000,
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub const fn with_base_threshold(mut self, threshold: f64) -> Self {
        self.base_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_max_staleness_ms(mut self, max_staleness_ms: u64) -> Self {
        self.max_staleness_ms = max_staleness_ms;
        self
    }
}

/// Consistency tag carried by every answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Fresh, consensus-confirmed.
    Full,
    /// Served from a stale confirmed baseline and local observations.
    Degraded,
}

/// A query answer with its honesty metadata: how stale, how widened, under
/// what connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineAnswer {
    pub baseline: Baseline,
    /// Confidence interval after partition widening and staleness decay.
    pub confidence_interval: (f64, f64),
    pub staleness_ms: u64,
    pub consistency: ConsistencyLevel,
    pub partition_state: PartitionState,
    /// `exp(-staleness / max_staleness)`, 1.0 when fresh.
    pub confidence_factor: f64,
    /// Commitment of the round that confirmed the baseline, when one exists.
    pub proof: Option<ConsensusProof>,
}

/// A consensus-confirmed baseline retained for degraded service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedBaseline {
    pub baseline: Baseline,
    pub proof: ConsensusProof,
    pub confirmed_at_ms: u64,
}

/// One divergent branch presented at heal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealBranch {
    /// Head of the branch owner's signed clock chain.
    pub head: VectorClock,
    /// Statistics accumulated on that side of the partition.
    pub summary: WelfordSummary,
    /// Evidence weight accumulated on that side.
    pub weight: f64,
}

/// Outcome of a heal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
    pub merged: Baseline,
    pub accepted_branches: Vec<NodeId>,
    /// Branches dropped for forged clocks or lost forks.
    pub rejected_branches: Vec<NodeId>,
}

/// The CAP resolver. Holds the partition policy, the last confirmed
/// baseline, and locally observed updates awaiting confirmation.
#[derive(Debug)]
pub struct CapResolver {
    config: ResolverConfig,
    engine: Arc<ConsensusEngine>,
    registry: Arc<ValidatorRegistry>,
    metrics: Arc<PipelineStats>,
    state: RwLock<PartitionState>,
    confirmed: RwLock<Option<ConfirmedBaseline>>,
    local_delta: RwLock<WelfordSummary>,
}

impl CapResolver {
    #[must_use]
    pub fn new(
        config: ResolverConfig,
        engine: Arc<ConsensusEngine>,
        registry: Arc<ValidatorRegistry>,
        metrics: Arc<PipelineStats>,
    ) -> Self {
        engine.set_effective_threshold(config.base_threshold);
        Self {
            config,
            engine,
            registry,
            metrics,
            state: RwLock::new(PartitionState::FullyConnected),
            confirmed: RwLock::new(None),
            local_delta: RwLock::new(WelfordSummary::new()),
        }
    }

    #[must_use]
    pub fn partition_state(&self) -> PartitionState {
        *self.state.read()
    }

    /// Threshold the policy currently imposes on consensus.
    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        let state = self.partition_state();
        if state.is_partitioned() {
            (self.config.base_threshold + PARTITION_PENALTY).min(MAX_THRESHOLD)
        } else {
            self.config.base_threshold
        }
    }

    /// Record a connectivity transition and push the matching threshold
    /// into the consensus engine.
    pub fn set_partition_state(&self, state: PartitionState) {
        let previous = {
            let mut guard = self.state.write();
            std::mem::replace(&mut *guard, state)
        };
        self.engine.set_effective_threshold(self.effective_threshold());
        if previous != state {
            tracing::info!(from = %previous, to = %state, "partition state transition");
        }
    }

    /// Store a consensus-confirmed baseline for degraded service.
    pub fn confirm(&self, baseline: Baseline, proof: ConsensusProof, now_ms: u64) {
        *self.confirmed.write() = Some(ConfirmedBaseline {
            baseline,
            proof,
            confirmed_at_ms: now_ms,
        });
        // Local observations are folded into the confirmation.
        *self.local_delta.write() = WelfordSummary::new();
    }

    /// Record an observation seen locally while confirmation is unavailable.
    pub fn note_local(&self, value: f64) {
        self.local_delta.write().push(value);
    }

    #[must_use]
    pub fn confirmed(&self) -> Option<ConfirmedBaseline> {
        self.confirmed.read().clone()
    }

    /// Answer a baseline query. `live` is a fresh consensus-backed
    /// baseline when one is reachable; `None` forces degraded service.
    ///
    /// Every query gets an answer. With no live baseline the last confirmed
    /// one is merged with local observations; with neither, an empty
    /// baseline with an unbounded interval is returned rather than an
    /// error. The interval never narrows as staleness grows.
    pub fn answer(&self, live: Option<&Baseline>, now_ms: u64) -> BaselineAnswer {
        let state = self.partition_state();

        if let (Some(baseline), false) = (live, state.is_partitioned()) {
            return BaselineAnswer {
                baseline: baseline.clone(),
                confidence_interval: baseline.ci95,
                staleness_ms: 0,
                consistency: ConsistencyLevel::Full,
                partition_state: state,
                confidence_factor: 1.0,
                proof: self.confirmed.read().as_ref().map(|c| c.proof.clone()),
            };
        }

        self.metrics.record_degraded_query();
        let confirmed = self.confirmed.read().clone();
        let (summary, confirmed_at, proof) = match confirmed {
            Some(c) => (
                c.baseline.to_summary(),
                c.confirmed_at_ms,
                Some(c.proof),
            ),
            None => (WelfordSummary::new(), now_ms, None),
        };
        let merged = summary.merge(&self.local_delta.read());
        let staleness_ms = now_ms.saturating_sub(confirmed_at);
        let confidence_factor =
            (-(staleness_ms as f64) / self.config.max_staleness_ms.max(1) as f64).exp();

        let baseline = Baseline::from_summary(&merged, confirmed_at);
        let half = if merged.count() < 2 {
            f64::INFINITY
        } else {
            // Widen for the partition, then inflate as confidence decays.
            merged.ci95_half_width() * state.ci_widen_factor() / confidence_factor
        };
        let confidence_interval = (baseline.mean - half, baseline.mean + half);

        BaselineAnswer {
            baseline,
            confidence_interval,
            staleness_ms,
            consistency: ConsistencyLevel::Degraded,
            partition_state: state,
            confidence_factor,
            proof,
        }
    }

    /// Reconcile divergent branches after connectivity returns.
    ///
    /// Branch heads with invalid signatures are discarded. Forked heads
    /// (same owner, same logical slot, different content) resolve toward
    /// the branch with higher accumulated weight; ties break on the
    /// lexicographically smallest signature so every replica picks the
    /// same winner. Surviving statistics merge into the new confirmed
    /// baseline and the state returns to fully connected.
    ///
    /// # Errors
    /// Returns [`EvidenceError::InvalidState`] when no branch survives.
    pub fn heal(&self, branches: Vec<HealBranch>, now_ms: u64) -> Result<HealReport> {
        self.metrics.record_heal_session();

        let mut valid: Vec<HealBranch> = Vec::new();
        let mut rejected: Vec<NodeId> = Vec::new();
        for branch in branches {
            let node = branch.head.node_id.clone();
            let Some(public) = self.registry.get(&node) else {
                tracing::warn!(node = %node, "heal branch from unregistered node dropped");
                rejected.push(node);
                continue;
            };
            if let Err(err) = branch.head.verify(&public) {
                tracing::warn!(node = %node, error = %err, "heal branch head failed verification");
                self.metrics.record_forged_clock();
                rejected.push(node);
                continue;
            }
            valid.push(branch);
        }

        // Resolve forks pairwise: the loser's branch is dropped entirely.
        let mut survivors: Vec<HealBranch> = Vec::new();
        'outer: for branch in valid {
            for kept in &mut survivors {
                if is_fork(&kept.head, &branch.head) {
                    let keep_existing = match kept.weight.total_cmp(&branch.weight) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => kept.head.signature <= branch.head.signature,
                    };
                    let loser = if keep_existing {
                        branch.head.node_id.clone()
                    } else {
                        let loser = kept.head.node_id.clone();
                        *kept = branch;
                        loser
                    };
                    tracing::warn!(node = %loser, "fork resolved against branch");
                    rejected.push(loser);
                    continue 'outer;
                }
            }
            survivors.push(branch);
        }

        if survivors.is_empty() {
            return Err(EvidenceError::InvalidState(
                "no heal branch survived verification".to_string(),
            ));
        }

        let mut merged = WelfordSummary::new();
        let mut accepted = Vec::new();
        for branch in &survivors {
            merged = merged.merge(&branch.summary);
            accepted.push(branch.head.node_id.clone());
        }
        let baseline = Baseline::from_summary(&merged, now_ms);

        if let Some(confirmed) = self.confirmed.write().as_mut() {
            confirmed.baseline = baseline.clone();
            confirmed.confirmed_at_ms = now_ms;
        }
        *self.local_delta.write() = WelfordSummary::new();
        self.set_partition_state(PartitionState::FullyConnected);

        Ok(HealReport {
            merged: baseline,
            accepted_branches: accepted,
            rejected_branches: rejected,
        })
    }
}

//! EvidenceChain - Byzantine-resistant statistical baselines for
//! distributed monitoring.
//!
//! Nodes observe a metric locally, sign evidence about it, and the cluster
//! agrees on a shared statistical baseline even when some nodes lie and the
//! network partitions:
//! - Per-source statistics merge through a hierarchical tree in O(log n)
//! - Evidence combines in log space with robust outlier rejection
//! - Partition behavior is an explicit policy, not a failure mode
//!
//! # Architecture
//!
//! ```text
//! BaselinePipeline
//!   ├── AggregationTree (Welford stats, leaf → regional → sector → global)
//!   ├── ConsensusEngine (log-space Bayesian combination, MAD filter)
//!   ├── CapResolver (partition policy, staleness-tagged answers, heal)
//!   ├── ReputationTracker (decaying trust, Byzantine penalties)
//!   └── ValidatorRegistry (Ed25519 identities, signed clock chains)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use evidence_chain::{BaselinePipeline, EvidenceRecord, Identity, PipelineConfig};
//!
//! let pipeline = BaselinePipeline::new(PipelineConfig::default());
//! let identity = Identity::generate();
//! pipeline.registry().register(&identity);
//!
//! // Observe, sign, ingest.
//! let record = EvidenceRecord::create("ev-1", payload, now_ms, llr, &identity);
//! pipeline.ingest(record, observed_value, now_ms)?;
//!
//! // Close a round and query the confirmed baseline.
//! let result = pipeline.close_round(expected_nodes, now_ms)?;
//! let answer = pipeline.baseline(now_ms);
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod aggregation;
pub mod clock;
pub mod consensus;
pub mod error;
pub mod evidence;
pub mod merkle;
pub mod metrics;
pub mod reputation;
pub mod resolver;
pub mod signing;
pub mod stats;

// Re-exports
use std::sync::Arc;

pub use aggregation::{
    AggregationConfig, AggregationLevel, AggregationScope, AggregationTree, ArchivedEpoch,
    Baseline, LevelDeviation, LocalUpdate,
};
pub use clock::{is_fork, ClockChain, ClockIssuer, VectorClock, GENESIS_HASH};
pub use consensus::{
    ConsensusConfig, ConsensusEngine, ConsensusOutcome, ConsensusProof, ConsensusResult,
};
pub use error::{EvidenceError, Result};
pub use evidence::{
    EvidenceRecord, EvidenceValidator, ValidationOutcome, DESCRIPTOR_LEN, DESCRIPTOR_MAGIC,
    DESCRIPTOR_VERSION,
};
pub use merkle::{hash_leaf, verify_proof, Hash256, MerkleProof, MerkleTree};
pub use metrics::{PipelineStats, PipelineStatsSnapshot};
pub use reputation::{
    NodeReputation, ReputationConfig, ReputationEvent, ReputationEventKind, ReputationSnapshot,
    ReputationTracker,
};
pub use resolver::{
    BaselineAnswer, CapResolver, ConfirmedBaseline, ConsistencyLevel, HealBranch, HealReport,
    PartitionState, ResolverConfig, MAX_THRESHOLD, PARTITION_PENALTY,
};
pub use signing::{Identity, NodeId, PublicIdentity, ValidatorRegistry};
pub use stats::{
    log_sum_exp, median, median_absolute_deviation, KahanSum, WelfordSummary,
    MAD_NORMAL_CONSISTENCY,
};

/// Configuration for a full pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub aggregation: AggregationConfig,
    pub consensus: ConsensusConfig,
    pub resolver: ResolverConfig,
    pub reputation: ReputationConfig,
}

/// End-to-end pipeline wiring ingestion, aggregation, consensus, and the
/// partition resolver over one shared identity registry.
#[derive(Debug)]
pub struct BaselinePipeline {
    registry: Arc<ValidatorRegistry>,
    reputation: Arc<ReputationTracker>,
    metrics: Arc<PipelineStats>,
    tree: Arc<AggregationTree>,
    engine: Arc<ConsensusEngine>,
    resolver: CapResolver,
}

impl Default for BaselinePipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl BaselinePipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let registry = Arc::new(ValidatorRegistry::new());
        let reputation = Arc::new(ReputationTracker::new(config.reputation));
        let metrics = Arc::new(PipelineStats::new());
        let tree = Arc::new(AggregationTree::new(config.aggregation));
        let engine = Arc::new(ConsensusEngine::new(
            config.consensus,
            registry.clone(),
            reputation.clone(),
            metrics.clone(),
        ));
        let resolver = CapResolver::new(
            config.resolver,
            engine.clone(),
            registry.clone(),
            metrics.clone(),
        );
        Self {
            registry,
            reputation,
            metrics,
            tree,
            engine,
            resolver,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn reputation(&self) -> &Arc<ReputationTracker> {
        &self.reputation
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineStats> {
        &self.metrics
    }

    #[must_use]
    pub fn tree(&self) -> &Arc<AggregationTree> {
        &self.tree
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    #[must_use]
    pub fn resolver(&self) -> &CapResolver {
        &self.resolver
    }

    /// Ingest one signed evidence record together with the observed value
    /// it describes. The record enters the consensus pool; the value enters
    /// the source's leaf statistics. Partitioned observations also queue in
    /// the resolver for the degraded path.
    ///
    /// # Errors
    /// Propagates validation failures; a rejected record leaves the tree
    /// untouched.
    pub fn ingest(&self, record: EvidenceRecord, observed: f64, now_ms: u64) -> Result<LocalUpdate> {
        let source = record.source_node.clone();
        self.engine.submit(record, now_ms)?;
        if self.resolver.partition_state().is_partitioned() {
            self.resolver.note_local(observed);
        }
        self.tree.ingest(&source, observed, now_ms)
    }

    /// Finalize the pending round. An accepted round confirms the current
    /// global baseline for degraded service.
    ///
    /// # Errors
    /// Same as [`ConsensusEngine::finalize_round`].
    pub fn close_round(&self, expected_nodes: usize, now_ms: u64) -> Result<ConsensusResult> {
        let result = self.engine.finalize_round(expected_nodes, now_ms, false)?;
        self.confirm_if_accepted(&result, now_ms)?;
        Ok(result)
    }

    /// Run a timed round: wait out the collection window, then finalize.
    ///
    /// # Errors
    /// Same as [`ConsensusEngine::run_round`].
    pub async fn run_round(&self, expected_nodes: usize, now_ms: u64) -> Result<ConsensusResult> {
        let result = self.engine.run_round(expected_nodes, now_ms).await?;
        self.confirm_if_accepted(&result, now_ms)?;
        Ok(result)
    }

    fn confirm_if_accepted(&self, result: &ConsensusResult, now_ms: u64) -> Result<()> {
        if result.outcome == ConsensusOutcome::Accepted {
            let baseline = self.tree.query(&AggregationScope::Global)?;
            self.resolver.confirm(baseline, result.proof.clone(), now_ms);
        }
        Ok(())
    }

    /// Answer a baseline query under the current partition policy. Always
    /// returns an answer; degraded ones carry staleness and widened
    /// intervals.
    #[must_use]
    pub fn baseline(&self, now_ms: u64) -> BaselineAnswer {
        let live = if self.resolver.partition_state().is_partitioned() {
            None
        } else {
            self.tree.query(&AggregationScope::Global).ok()
        };
        self.resolver.answer(live.as_ref(), now_ms)
    }

    /// Answer a baseline query with a bound on how long the live path may
    /// take. If the fresh baseline does not materialize within
    /// `timeout_ms` the resolver's degraded path answers instead, so a
    /// query never hangs on a partition it has not detected yet.
    pub async fn baseline_within(&self, timeout_ms: u64, now_ms: u64) -> BaselineAnswer {
        let live = if self.resolver.partition_state().is_partitioned() {
            None
        } else {
            let query = async { self.tree.query(&AggregationScope::Global).ok() };
            tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), query)
                .await
                .ok()
                .flatten()
        };
        self.resolver.answer(live.as_ref(), now_ms)
    }
}

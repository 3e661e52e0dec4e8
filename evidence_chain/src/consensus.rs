// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Byzantine-resistant Bayesian evidence consensus.
//!
//! Evidence records accumulate in a pool; a round drains the pool, builds a
//! merkle tree over the accepted records, filters coordinated outliers with
//! a robust MAD test, and combines the survivors' log-likelihood ratios into
//! a posterior, weighted by source reputation.
//!
//! All probability mass lives in log space. Sums use compensated
//! accumulation and the posterior is recovered through a max-shifted
//! log-sum-exp, so a round never produces NaN or infinity from underflow; a
//! non-finite combination is a hard [`EvidenceError::NumericOverflow`].
//!
//! Acceptance requires a 0.75 supermajority of expected participant weight.
//! Simple majority (0.50) was rejected: a coordinated minority plus
//! statistical noise crosses it too easily. The threshold rises further
//! under partitions (see the resolver), never above 0.90 so consensus stays
//! reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    error::{EvidenceError, Result},
    evidence::{EvidenceRecord, EvidenceValidator},
    merkle::{Hash256, MerkleTree},
    metrics::PipelineStats,
    reputation::ReputationTracker,
    signing::{NodeId, ValidatorRegistry},
    stats::{log_sum_exp, median, median_absolute_deviation, KahanSum},
};

/// Supermajority fraction of expected weight required to accept a round.
pub const DEFAULT_SUPERMAJORITY: f64 = 0.75;

/// Deviations-from-median cutoff for the Byzantine filter.
pub const DEFAULT_BYZANTINE_K: f64 = 3.0;

/// Fraction trimmed from each tail when estimating the robust center.
pub const DEFAULT_TRIM_FRACTION: f64 = 0.1;

/// Consensus round tuning.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Fraction of expected participant weight required for acceptance.
    pub supermajority_threshold: f64,
    /// MAD multiples beyond which evidence is flagged Byzantine. Set to
    /// `f64::INFINITY` to disable the filter.
    pub byzantine_k: f64,
    /// Tail fraction trimmed before estimating median and MAD.
    pub trim_fraction: f64,
    /// Collection window before a round is finalized.
    pub round_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            supermajority_threshold: DEFAULT_SUPERMAJORITY,
            byzantine_k: DEFAULT_BYZANTINE_K,
            trim_fraction: DEFAULT_TRIM_FRACTION,
            round_timeout_ms: 5_000,
        }
    }
}

impl ConsensusConfig {
    #[must_use]
    pub const fn with_supermajority_threshold(mut self, threshold: f64) -> Self {
        self.supermajority_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_byzantine_k(mut self, k: f64) -> Self {
        self.byzantine_k = k;
        self
    }

    #[must_use]
    pub const fn with_trim_fraction(mut self, fraction: f64) -> Self {
        self.trim_fraction = fraction;
        self
    }

    #[must_use]
    pub const fn with_round_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.round_timeout_ms = timeout_ms;
        self
    }
}

/// Terminal state of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusOutcome {
    /// Accumulated weight met the supermajority threshold.
    Accepted,
    /// Weight fell short within the collection window.
    InsufficientConsensus,
    /// Window expired with partial weight; posterior is advisory only.
    Partial,
}

/// Commitment to the evidence set a round combined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusProof {
    pub round_id: u64,
    /// Merkle root over the round's accepted evidence leaves.
    pub evidence_root: Hash256,
    pub evidence_count: usize,
}

/// Result of one finalized round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub round_id: u64,
    pub outcome: ConsensusOutcome,
    /// Posterior probability of the hypothesis, in `[0, 1]`.
    pub posterior: f64,
    /// Combined log-odds before the sigmoid.
    pub log_odds: f64,
    /// Records that survived the Byzantine filter.
    pub evidence_count: usize,
    /// Ids of the surviving records, in pool order.
    pub verified_evidence_ids: Vec<String>,
    /// Threshold fraction in force when the round closed.
    pub threshold: f64,
    /// Distinct sources contributing surviving evidence.
    pub participating_nodes: Vec<NodeId>,
    /// Sources flagged and excluded by the Byzantine filter.
    pub flagged_nodes: Vec<NodeId>,
    pub accumulated_weight: f64,
    pub required_weight: f64,
    pub proof: ConsensusProof,
}

/// The consensus engine. Shared-nothing except the evidence pool, which is
/// drained atomically when a round finalizes.
#[derive(Debug)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
    validator: Arc<EvidenceValidator>,
    reputation: Arc<ReputationTracker>,
    metrics: Arc<PipelineStats>,
    pool: Mutex<Vec<EvidenceRecord>>,
    next_round: AtomicU64,
    /// Threshold currently in force; raised by the resolver under
    /// partitions, restored on heal.
    effective_threshold: RwLock<f64>,
}

impl ConsensusEngine {
    #[must_use]
    pub fn new(
        config: ConsensusConfig,
        registry: Arc<ValidatorRegistry>,
        reputation: Arc<ReputationTracker>,
        metrics: Arc<PipelineStats>,
    ) -> Self {
        let threshold = config.supermajority_threshold;
        Self {
            config,
            validator: Arc::new(EvidenceValidator::new(registry)),
            reputation,
            metrics,
            pool: Mutex::new(Vec::new()),
            next_round: AtomicU64::new(1),
            effective_threshold: RwLock::new(threshold),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    #[must_use]
    pub fn validator(&self) -> &Arc<EvidenceValidator> {
        &self.validator
    }

    /// Threshold currently in force.
    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        *self.effective_threshold.read()
    }

    /// Override the acceptance threshold. Used by the partition resolver;
    /// capped callers are responsible for the 0.90 ceiling.
    pub fn set_effective_threshold(&self, threshold: f64) {
        *self.effective_threshold.write() = threshold;
    }

    /// Submit evidence to the pool. Validation happens here, at the
    /// boundary; a record that fails never reaches a round.
    ///
    /// # Errors
    /// - [`EvidenceError::InvalidEvidence`] on signature failure (the
    ///   claimed source is penalized).
    /// - [`EvidenceError::DuplicateEvidence`] on id replay.
    /// - [`EvidenceError::UnknownNode`] for unregistered sources.
    /// - [`EvidenceError::InvalidState`] when the source's reputation is
    ///   below the submission floor.
    pub fn submit(&self, record: EvidenceRecord, now_ms: u64) -> Result<()> {
        match self.validator.validate(&record, None) {
            Ok(_) => {}
            Err(EvidenceError::DuplicateEvidence(id)) => {
                self.metrics.record_duplicate();
                return Err(EvidenceError::DuplicateEvidence(id));
            }
            Err(err) => {
                self.metrics.record_rejected();
                if matches!(err, EvidenceError::InvalidEvidence(_)) {
                    // A bad signature under a registered id is an integrity
                    // event, not noise.
                    self.reputation.record_rejected(&record.source_node, now_ms);
                }
                return Err(err);
            }
        }

        if !self.reputation.may_submit(&record.source_node, now_ms) {
            self.metrics.record_rejected();
            return Err(EvidenceError::InvalidState(format!(
                "node {} below reputation submission floor",
                record.source_node
            )));
        }

        self.reputation.record_verified(&record.source_node, now_ms);
        self.metrics.record_accepted();
        self.pool.lock().push(record);
        Ok(())
    }

    /// Records currently awaiting a round.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Drain the pool and finalize a round against `expected_nodes`
    /// participants. `deadline_exceeded` turns an insufficient round into a
    /// [`ConsensusOutcome::Partial`] advisory result instead of a retryable
    /// shortfall. On [`ConsensusOutcome::InsufficientConsensus`] the
    /// verified evidence goes back into the pool, so a retried round counts
    /// it together with whatever arrives next; flagged records stay out,
    /// they were penalized once already.
    ///
    /// # Errors
    /// - [`EvidenceError::InvalidEvidence`] if the pool is empty.
    /// - [`EvidenceError::NumericOverflow`] if combination leaves log space.
    pub fn finalize_round(
        &self,
        expected_nodes: usize,
        now_ms: u64,
        deadline_exceeded: bool,
    ) -> Result<ConsensusResult> {
        let records: Vec<EvidenceRecord> = std::mem::take(&mut *self.pool.lock());
        if records.is_empty() {
            return Err(EvidenceError::InvalidEvidence(
                "no evidence in round".to_string(),
            ));
        }
        let round_id = self.next_round.fetch_add(1, Ordering::Relaxed);

        let (records, evidence_root) = attach_proofs(records)?;

        let flagged = self.flag_outliers(&records);
        for node in &flagged {
            tracing::warn!(node = %node, round = round_id, "evidence flagged Byzantine");
            self.reputation.penalize_byzantine(node, now_ms);
        }
        self.metrics.record_byzantine_flagged(flagged.len() as u64);

        let survivors: Vec<&EvidenceRecord> = records
            .iter()
            .filter(|r| !flagged.contains(&r.source_node))
            .collect();

        let mut log_odds = KahanSum::new();
        let mut participants: Vec<NodeId> = Vec::new();
        let mut accumulated = KahanSum::new();
        for record in &survivors {
            let weight = self.reputation.weight_of(&record.source_node, now_ms);
            log_odds.add(weight * record.log_likelihood_ratio);
            if !participants.contains(&record.source_node) {
                participants.push(record.source_node.clone());
                accumulated.add(weight);
            }
        }

        let l = log_odds.value();
        // Stable sigmoid: p = exp(l - logsumexp(0, l)).
        let posterior = (l - log_sum_exp(&[0.0, l])).exp();
        if !posterior.is_finite() || !l.is_finite() {
            return Err(EvidenceError::NumericOverflow(
                "log-odds combination".to_string(),
            ));
        }

        let threshold = self.effective_threshold();
        let required = threshold * expected_nodes as f64;
        let accumulated = accumulated.value();
        let outcome = if accumulated >= required {
            self.metrics.record_round_accepted();
            ConsensusOutcome::Accepted
        } else if deadline_exceeded {
            self.metrics.record_round_partial();
            ConsensusOutcome::Partial
        } else {
            self.metrics.record_round_insufficient();
            ConsensusOutcome::InsufficientConsensus
        };

        if outcome == ConsensusOutcome::InsufficientConsensus {
            let mut pool = self.pool.lock();
            for record in &records {
                if !flagged.contains(&record.source_node) {
                    pool.push(record.clone());
                }
            }
        }

        Ok(ConsensusResult {
            round_id,
            outcome,
            posterior,
            log_odds: l,
            evidence_count: survivors.len(),
            verified_evidence_ids: survivors.iter().map(|r| r.id.clone()).collect(),
            threshold,
            participating_nodes: participants,
            flagged_nodes: flagged,
            accumulated_weight: accumulated,
            required_weight: required,
            proof: ConsensusProof {
                round_id,
                evidence_root,
                evidence_count: records.len(),
            },
        })
    }

    /// Wait out the collection window, then finalize. A shortfall after the
    /// window is reported as [`ConsensusOutcome::Partial`] together with a
    /// [`EvidenceError::ConsensusTimeout`] log line, never as a hang.
    ///
    /// # Errors
    /// Same as [`Self::finalize_round`].
    pub async fn run_round(&self, expected_nodes: usize, now_ms: u64) -> Result<ConsensusResult> {
        tokio::time::sleep(std::time::Duration::from_millis(self.config.round_timeout_ms)).await;
        let result =
            self.finalize_round(expected_nodes, now_ms + self.config.round_timeout_ms, true)?;
        if result.outcome == ConsensusOutcome::Partial {
            tracing::warn!(
                round = result.round_id,
                accumulated = result.accumulated_weight,
                required = result.required_weight,
                error = %EvidenceError::ConsensusTimeout(self.config.round_timeout_ms),
                "round closed with partial weight"
            );
        }
        Ok(result)
    }

    /// Sources whose log-likelihood ratios sit more than `byzantine_k`
    /// scaled MADs from the trimmed median.
    fn flag_outliers(&self, records: &[EvidenceRecord]) -> Vec<NodeId> {
        if records.len() < 3 || !self.config.byzantine_k.is_finite() {
            return Vec::new();
        }
        let mut sorted: Vec<f64> = records.iter().map(|r| r.log_likelihood_ratio).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let trim = ((sorted.len() as f64 * self.config.trim_fraction) as usize)
            .min(sorted.len().saturating_sub(1) / 2);
        let trimmed = &sorted[trim..sorted.len() - trim];

        let Some(center) = median(trimmed) else {
            return Vec::new();
        };
        let Some(mad) = median_absolute_deviation(trimmed) else {
            return Vec::new();
        };
        // MAD is already scaled for normal consistency; guard against a
        // degenerate zero spread.
        let limit = self.config.byzantine_k * mad.max(1e-12);

        let mut flagged = Vec::new();
        for record in records {
            let deviation = (record.log_likelihood_ratio - center).abs();
            if deviation > limit && !flagged.contains(&record.source_node) {
                flagged.push(record.source_node.clone());
            }
        }
        flagged
    }

    /// Pipeline counters snapshot.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineStats> {
        &self.metrics
    }

    /// Reputation tracker shared with this engine.
    #[must_use]
    pub fn reputation(&self) -> &Arc<ReputationTracker> {
        &self.reputation
    }
}

/// Build the round's merkle tree and attach each record's inclusion proof.
fn attach_proofs(mut records: Vec<EvidenceRecord>) -> Result<(Vec<EvidenceRecord>, Hash256)> {
    let tree = MerkleTree::build(records.iter().map(EvidenceRecord::leaf_hash).collect())?;
    for (i, record) in records.iter_mut().enumerate() {
        record.merkle_proof = Some(tree.proof(i)?);
    }
    Ok((records, tree.root()))
}

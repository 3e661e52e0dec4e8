//! Node reputation tracking with exponential forgetting.
//!
//! A single [`ReputationTracker`] owns all score state (single-writer
//! authority); readers take immutable [`ReputationSnapshot`]s, which act as
//! the eventually consistent replicas other components consume. Every
//! mutation is recorded in an append-only versioned log.
//!
//! Trust is a continuously decaying score, never a permanent boolean: a
//! node that built trust over time and then betrays it loses weight
//! multiplicatively, and old good behavior is forgotten on an exponential
//! window.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::signing::NodeId;

/// Default half-life of the forgetting window (10 minutes).
const DEFAULT_HALF_LIFE_MS: u64 = 10 * 60 * 1000;

/// Multiplicative penalty applied per detected Byzantine behavior.
const BYZANTINE_PENALTY_FACTOR: f64 = 0.8;

/// Small recovery applied per verified contribution.
const VERIFIED_RECOVERY: f64 = 0.02;

/// Neutral prior the decay converges toward.
const NEUTRAL_SCORE: f64 = 0.5;

/// Bounded length of the append-only update log.
const MAX_LOG_ENTRIES: usize = 10_000;

/// Configuration for reputation scoring.
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Half-life of the exponential forgetting window in milliseconds.
    pub half_life_ms: u64,
    /// Score below which evidence is refused at submission.
    pub min_submit_score: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            half_life_ms: DEFAULT_HALF_LIFE_MS,
            min_submit_score: 0.2,
        }
    }
}

impl ReputationConfig {
    #[must_use]
    pub const fn with_half_life_ms(mut self, half_life_ms: u64) -> Self {
        self.half_life_ms = half_life_ms;
        self
    }

    #[must_use]
    pub const fn with_min_submit_score(mut self, score: f64) -> Self {
        self.min_submit_score = score;
        self
    }
}

/// Reputation state for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReputation {
    pub node_id: NodeId,
    /// Trust score in `[0, 1]`.
    pub score: f64,
    /// Number of flagged Byzantine behaviors.
    pub suspicious_behavior_count: u32,
    /// Evidence records that passed verification.
    pub evidence_verified: u64,
    /// Evidence records rejected at the boundary.
    pub evidence_rejected: u64,
    /// Last mutation time, for decay.
    pub updated_at_ms: u64,
}

impl NodeReputation {
    #[must_use]
    fn new(node_id: NodeId, now_ms: u64) -> Self {
        Self {
            node_id,
            score: 1.0,
            suspicious_behavior_count: 0,
            evidence_verified: 0,
            evidence_rejected: 0,
            updated_at_ms: now_ms,
        }
    }

    /// Score after exponential decay toward the neutral prior.
    #[must_use]
    fn decayed_score(&self, now_ms: u64, half_life_ms: u64) -> f64 {
        let dt = now_ms.saturating_sub(self.updated_at_ms) as f64;
        let factor = (-dt * std::f64::consts::LN_2 / half_life_ms.max(1) as f64).exp();
        NEUTRAL_SCORE + (self.score - NEUTRAL_SCORE) * factor
    }

    /// Fraction of this node's evidence that verified cleanly.
    #[must_use]
    fn verification_rate(&self) -> f64 {
        let total = self.evidence_verified + self.evidence_rejected;
        if total == 0 {
            1.0
        } else {
            self.evidence_verified as f64 / total as f64
        }
    }

    /// Penalty factor from accumulated Byzantine detections.
    #[must_use]
    fn byzantine_factor(&self) -> f64 {
        (1.0 - 0.1 * f64::from(self.suspicious_behavior_count)).max(0.0)
    }
}

/// Kind of reputation mutation, for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationEventKind {
    Verified,
    Rejected,
    ByzantinePenalty,
}

/// One entry of the append-only reputation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub version: u64,
    pub node_id: NodeId,
    pub kind: ReputationEventKind,
    pub score_after: f64,
    pub timestamp_ms: u64,
}

/// Immutable point-in-time replica of all reputation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub version: u64,
    pub nodes: Vec<NodeReputation>,
}

#[derive(Debug, Default)]
struct TrackerState {
    nodes: HashMap<NodeId, NodeReputation>,
    log: VecDeque<ReputationEvent>,
    version: u64,
}

/// Single-writer reputation authority.
#[derive(Debug)]
pub struct ReputationTracker {
    config: ReputationConfig,
    state: RwLock<TrackerState>,
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}

impl ReputationTracker {
    #[must_use]
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TrackerState::default()),
        }
    }

    fn mutate(
        &self,
        node_id: &str,
        now_ms: u64,
        kind: ReputationEventKind,
        apply: impl FnOnce(&mut NodeReputation),
    ) {
        let mut state = self.state.write();
        let half_life = self.config.half_life_ms;
        let entry = state
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeReputation::new(node_id.to_string(), now_ms));

        // Fold the pending decay into the stored score before mutating.
        entry.score = entry.decayed_score(now_ms, half_life);
        apply(entry);
        entry.score = entry.score.clamp(0.0, 1.0);
        entry.updated_at_ms = now_ms;
        let score_after = entry.score;
        let node_id = entry.node_id.clone();

        state.version += 1;
        let version = state.version;
        state.log.push_back(ReputationEvent {
            version,
            node_id,
            kind,
            score_after,
            timestamp_ms: now_ms,
        });
        if state.log.len() > MAX_LOG_ENTRIES {
            state.log.pop_front();
        }
    }

    /// Record a cleanly verified contribution.
    pub fn record_verified(&self, node_id: &str, now_ms: u64) {
        self.mutate(node_id, now_ms, ReputationEventKind::Verified, |r| {
            r.evidence_verified += 1;
            r.score += (1.0 - r.score) * VERIFIED_RECOVERY;
        });
    }

    /// Record a boundary rejection (bad signature, bad proof).
    pub fn record_rejected(&self, node_id: &str, now_ms: u64) {
        self.mutate(node_id, now_ms, ReputationEventKind::Rejected, |r| {
            r.evidence_rejected += 1;
        });
    }

    /// Penalize detected Byzantine behavior.
    pub fn penalize_byzantine(&self, node_id: &str, now_ms: u64) {
        self.mutate(node_id, now_ms, ReputationEventKind::ByzantinePenalty, |r| {
            r.suspicious_behavior_count += 1;
            r.score *= BYZANTINE_PENALTY_FACTOR;
        });
    }

    /// Consensus weight of a node in `[0, 1]`: decayed score times
    /// verification rate times the Byzantine penalty factor. Unknown nodes
    /// get the full prior weight of 1.
    #[must_use]
    pub fn weight_of(&self, node_id: &str, now_ms: u64) -> f64 {
        let state = self.state.read();
        state.nodes.get(node_id).map_or(1.0, |r| {
            r.decayed_score(now_ms, self.config.half_life_ms)
                * r.verification_rate()
                * r.byzantine_factor()
        })
    }

    /// Whether a node is currently allowed to submit evidence.
    #[must_use]
    pub fn may_submit(&self, node_id: &str, now_ms: u64) -> bool {
        self.weight_of(node_id, now_ms) >= self.config.min_submit_score
    }

    /// Read-only replica of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ReputationSnapshot {
        let state = self.state.read();
        let mut nodes: Vec<NodeReputation> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        ReputationSnapshot {
            version: state.version,
            nodes,
        }
    }

    /// Recent entries of the append-only log, oldest first.
    #[must_use]
    pub fn log_tail(&self, max: usize) -> Vec<ReputationEvent> {
        let state = self.state.read();
        state
            .log
            .iter()
            .rev()
            .take(max)
            .rev()
            .cloned()
            .collect()
    }

    /// Current log version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }
}

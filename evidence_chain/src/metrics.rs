//! Pipeline observability counters.
//!
//! Thread-safe counters using atomics with `Ordering::Relaxed`, plus a
//! serializable point-in-time snapshot for export to monitoring systems.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the evidence pipeline: validation, consensus rounds,
/// partition-degraded answers, and heal sessions.
#[derive(Debug, Default)]
pub struct PipelineStats {
    evidence_accepted: AtomicU64,
    evidence_rejected: AtomicU64,
    evidence_duplicates: AtomicU64,
    byzantine_flagged: AtomicU64,
    rounds_accepted: AtomicU64,
    rounds_insufficient: AtomicU64,
    rounds_partial: AtomicU64,
    degraded_queries: AtomicU64,
    heal_sessions: AtomicU64,
    forged_clocks: AtomicU64,
}

impl PipelineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.evidence_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.evidence_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.evidence_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_byzantine_flagged(&self, count: u64) {
        self.byzantine_flagged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_round_accepted(&self) {
        self.rounds_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_insufficient(&self) {
        self.rounds_insufficient.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_partial(&self) {
        self.rounds_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_query(&self) {
        self.degraded_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heal_session(&self) {
        self.heal_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forged_clock(&self) {
        self.forged_clocks.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn evidence_accepted(&self) -> u64 {
        self.evidence_accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn byzantine_flagged(&self) -> u64 {
        self.byzantine_flagged.load(Ordering::Relaxed)
    }

    /// Take a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            evidence_accepted: self.evidence_accepted.load(Ordering::Relaxed),
            evidence_rejected: self.evidence_rejected.load(Ordering::Relaxed),
            evidence_duplicates: self.evidence_duplicates.load(Ordering::Relaxed),
            byzantine_flagged: self.byzantine_flagged.load(Ordering::Relaxed),
            rounds_accepted: self.rounds_accepted.load(Ordering::Relaxed),
            rounds_insufficient: self.rounds_insufficient.load(Ordering::Relaxed),
            rounds_partial: self.rounds_partial.load(Ordering::Relaxed),
            degraded_queries: self.degraded_queries.load(Ordering::Relaxed),
            heal_sessions: self.heal_sessions.load(Ordering::Relaxed),
            forged_clocks: self.forged_clocks.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.evidence_accepted.store(0, Ordering::Relaxed);
        self.evidence_rejected.store(0, Ordering::Relaxed);
        self.evidence_duplicates.store(0, Ordering::Relaxed);
        self.byzantine_flagged.store(0, Ordering::Relaxed);
        self.rounds_accepted.store(0, Ordering::Relaxed);
        self.rounds_insufficient.store(0, Ordering::Relaxed);
        self.rounds_partial.store(0, Ordering::Relaxed);
        self.degraded_queries.store(0, Ordering::Relaxed);
        self.heal_sessions.store(0, Ordering::Relaxed);
        self.forged_clocks.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub evidence_accepted: u64,
    pub evidence_rejected: u64,
    pub evidence_duplicates: u64,
    pub byzantine_flagged: u64,
    pub rounds_accepted: u64,
    pub rounds_insufficient: u64,
    pub rounds_partial: u64,
    pub degraded_queries: u64,
    pub heal_sessions: u64,
    pub forged_clocks: u64,
}

impl PipelineStatsSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fraction of submitted evidence that passed validation.
    #[must_use]
    pub fn acceptance_rate(&self) -> f64 {
        let total = self.evidence_accepted + self.evidence_rejected;
        if total == 0 {
            return 0.0;
        }
        self.evidence_accepted as f64 / total as f64
    }
}

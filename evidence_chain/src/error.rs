//! Error types for evidence_chain.

use thiserror::Error;

/// Result type for evidence_chain operations.
pub type Result<T> = std::result::Result<T, EvidenceError>;

/// Errors that can occur in evidence_chain operations.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Evidence failed signature or merkle verification. Never propagates
    /// past the ingestion boundary.
    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),

    /// Evidence with this id was already accepted.
    #[error("duplicate evidence id: {0}")]
    DuplicateEvidence(String),

    /// Statistical outlier beyond the robust deviation threshold.
    #[error("byzantine evidence from {node_id}: deviation {deviation:.3} exceeds {limit:.3}")]
    ByzantineDetected {
        node_id: String,
        deviation: f64,
        limit: f64,
    },

    /// Verified, non-flagged weight below the supermajority threshold.
    /// Retryable: more evidence may arrive in a later round.
    #[error(
        "insufficient consensus: verified weight {accumulated:.3} below required {required:.3}"
    )]
    InsufficientConsensus { accumulated: f64, required: f64 },

    /// Round deadline exceeded; the round is finalized as partial.
    #[error("consensus round {0} deadline exceeded, finalized partial")]
    ConsensusTimeout(u64),

    /// Answer served from a stale baseline under severe partition.
    #[error("degraded answer under partition: staleness {staleness_ms}ms")]
    PartitionDegraded { staleness_ms: u64 },

    /// Signature mismatch on a causal chain. Fatal for that update only.
    #[error("forged vector clock from {node_id}: {reason}")]
    ForgedVectorClock { node_id: String, reason: String },

    /// Invariant violation in combination math. Unreachable given correct
    /// log-sum-exp and Kahan use; treated as an implementation bug.
    #[error("numeric overflow in {0}")]
    NumericOverflow(String),

    /// Crypto error.
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// Clock error.
    #[error("clock error: {0}")]
    ClockError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Node is not registered with the validator registry.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Query scope does not exist in the aggregation tree.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// Invalid internal state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EvidenceError {
    /// Whether the caller may retry the operation in a later round.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientConsensus { .. })
    }
}

impl From<bincode::Error> for EvidenceError {
    fn from(err: bincode::Error) -> Self {
        EvidenceError::SerializationError(err.to_string())
    }
}

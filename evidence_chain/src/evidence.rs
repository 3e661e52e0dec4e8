//! Evidence records and the ingestion-boundary validator.
//!
//! An [`EvidenceRecord`] is created by an external node, consumed once, and
//! retained read-only for audit. Before any record enters aggregation it
//! must pass the [`EvidenceValidator`]: signature against the registered key
//! of the claimed source, merkle inclusion against the round's evidence
//! root, and deduplication by id.
//!
//! # Canonical descriptor
//!
//! Hashing and signing operate over a fixed-size canonical descriptor:
//!
//! ```text
//! magic "EVCD" | version u8 | flags u8 | reserved u16 |
//! timestamp_ms u64 LE | log_likelihood_ratio f64 LE bits |
//! content_hash 32B | crc32 u32 LE
//! ```
//!
//! The full byte layout is a negotiated external contract; this core relies
//! only on the encoding being deterministic and hashable for merkle
//! inclusion.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{EvidenceError, Result},
    merkle::{hash_leaf, verify_proof, Hash256, MerkleProof},
    signing::{Identity, NodeId, ValidatorRegistry},
};
use dashmap::DashSet;
use std::sync::Arc;

/// Magic tag of the canonical evidence descriptor.
pub const DESCRIPTOR_MAGIC: [u8; 4] = *b"EVCD";

/// Current descriptor version.
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Total descriptor size in bytes.
pub const DESCRIPTOR_LEN: usize = 4 + 1 + 1 + 2 + 8 + 8 + 32 + 4;

/// A signed statistical evidence record. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Unique id; ingestion deduplicates on it.
    pub id: String,
    /// Claimed source node, checked against the signing key.
    pub source_node: NodeId,
    /// Opaque payload; only its hash enters the descriptor.
    pub content: Vec<u8>,
    /// Wall-clock capture time in milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// Log-likelihood ratio carried by this evidence.
    pub log_likelihood_ratio: f64,
    /// Ed25519 signature (64 bytes) over the signing payload.
    pub signature: Vec<u8>,
    /// Inclusion proof against the round's evidence tree, once assigned.
    pub merkle_proof: Option<MerkleProof>,
}

impl EvidenceRecord {
    /// Create and sign a record. The merkle proof is attached later, when
    /// the round's evidence tree is built.
    #[must_use]
    pub fn create(
        id: impl Into<String>,
        content: Vec<u8>,
        timestamp_ms: u64,
        log_likelihood_ratio: f64,
        identity: &Identity,
    ) -> Self {
        let mut record = Self {
            id: id.into(),
            source_node: identity.node_id(),
            content,
            timestamp_ms,
            log_likelihood_ratio,
            signature: Vec::new(),
            merkle_proof: None,
        };
        record.signature = identity.sign(&record.signing_payload());
        record
    }

    /// SHA-256 hash of the raw content.
    #[must_use]
    pub fn content_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(&self.content);
        hasher.finalize().into()
    }

    /// Canonical fixed-size descriptor with trailing CRC32.
    #[must_use]
    pub fn canonical_descriptor(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DESCRIPTOR_LEN);
        buf.extend_from_slice(&DESCRIPTOR_MAGIC);
        buf.push(DESCRIPTOR_VERSION);
        buf.push(0); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&self.log_likelihood_ratio.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.content_hash());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Bytes covered by the signature: id || source || descriptor.
    ///
    /// Binding the id and claimed source into the signed payload prevents a
    /// valid descriptor from being replayed under another identity.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.id.len() as u64).to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(self.source_node.as_bytes());
        buf.extend_from_slice(&self.canonical_descriptor());
        buf
    }

    /// Merkle leaf hash of this record.
    #[must_use]
    pub fn leaf_hash(&self) -> Hash256 {
        hash_leaf(&self.signing_payload())
    }

    /// Verify the descriptor's CRC trailer.
    #[must_use]
    pub fn descriptor_crc_valid(descriptor: &[u8]) -> bool {
        if descriptor.len() != DESCRIPTOR_LEN {
            return false;
        }
        let (body, trailer) = descriptor.split_at(DESCRIPTOR_LEN - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        crc32fast::hash(body) == stored
    }
}

/// Outcome of validating a record at the ingestion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    /// Record verified and recorded; safe to aggregate.
    Accepted,
}

/// Ingestion-boundary validator: signature, merkle inclusion, dedup.
///
/// No record enters aggregation without passing through here. Errors from
/// this boundary are discarded and logged by callers; they never propagate
/// into round results.
#[derive(Debug)]
pub struct EvidenceValidator {
    registry: Arc<ValidatorRegistry>,
    seen: DashSet<String>,
}

impl EvidenceValidator {
    #[must_use]
    pub fn new(registry: Arc<ValidatorRegistry>) -> Self {
        Self {
            registry,
            seen: DashSet::new(),
        }
    }

    /// Validate a record. `expected_root` is the round's evidence tree
    /// root; when `None` (pool ingestion, before the tree exists) the
    /// merkle check is deferred to round finalization.
    ///
    /// # Errors
    /// - [`EvidenceError::InvalidEvidence`] on signature or proof failure.
    /// - [`EvidenceError::DuplicateEvidence`] on id replay.
    /// - [`EvidenceError::UnknownNode`] if the source is not registered.
    pub fn validate(
        &self,
        record: &EvidenceRecord,
        expected_root: Option<&Hash256>,
    ) -> Result<ValidationOutcome> {
        if record.signature.len() != 64 {
            return Err(EvidenceError::InvalidEvidence(format!(
                "signature length {} != 64",
                record.signature.len()
            )));
        }
        if !record.log_likelihood_ratio.is_finite() {
            return Err(EvidenceError::InvalidEvidence(
                "non-finite log-likelihood ratio".to_string(),
            ));
        }

        let public = self
            .registry
            .get(&record.source_node)
            .ok_or_else(|| EvidenceError::UnknownNode(record.source_node.clone()))?;

        public
            .verify(&record.signing_payload(), &record.signature)
            .map_err(|e| EvidenceError::InvalidEvidence(e.to_string()))?;

        if let Some(root) = expected_root {
            let proof = record.merkle_proof.as_ref().ok_or_else(|| {
                EvidenceError::InvalidEvidence("missing merkle proof".to_string())
            })?;
            if !verify_proof(&record.leaf_hash(), proof, root) {
                return Err(EvidenceError::InvalidEvidence(
                    "merkle proof does not match evidence root".to_string(),
                ));
            }
        }

        // Dedup last: a replayed id is not an integrity failure, just a
        // repeat, and must not double-count.
        if !self.seen.insert(record.id.clone()) {
            return Err(EvidenceError::DuplicateEvidence(record.id.clone()));
        }

        Ok(ValidationOutcome::Accepted)
    }

    /// Re-verify an already-accepted record against a round root without
    /// touching dedup state.
    ///
    /// # Errors
    /// Returns [`EvidenceError::InvalidEvidence`] on proof failure.
    pub fn verify_inclusion(&self, record: &EvidenceRecord, root: &Hash256) -> Result<()> {
        let proof = record
            .merkle_proof
            .as_ref()
            .ok_or_else(|| EvidenceError::InvalidEvidence("missing merkle proof".to_string()))?;
        if verify_proof(&record.leaf_hash(), proof, root) {
            Ok(())
        } else {
            Err(EvidenceError::InvalidEvidence(
                "merkle proof does not match evidence root".to_string(),
            ))
        }
    }

    /// Whether an id has already been accepted.
    #[must_use]
    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Number of accepted (deduplicated) ids.
    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

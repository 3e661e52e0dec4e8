// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Signed, hash-linked vector clocks for causal ordering.
//!
//! Each node maintains its own chain of [`VectorClock`] entries. Every entry
//! is signed and carries the hash of its predecessor, so the chain is both
//! attributable and tamper-evident:
//!
//! - logical time must be strictly monotonic per node;
//! - `previous_hash` must link to the prior entry; a break invalidates all
//!   descendants;
//! - a signature mismatch is fatal for that single update only
//!   ([`EvidenceError::ForgedVectorClock`]), never for the system.
//!
//! Cross-node ordering is reconstructed only from these clocks, never
//! assumed from wall-clock time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{EvidenceError, Result},
    merkle::Hash256,
    signing::{Identity, NodeId, PublicIdentity},
};

/// Hash value linking the first entry of a chain.
pub const GENESIS_HASH: Hash256 = [0u8; 32];

/// A signed logical timestamp in a per-node hash-linked chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// Owning node.
    pub node_id: NodeId,
    /// Strictly monotonic logical time within the node's chain.
    pub logical_time: u64,
    /// Wall-clock milliseconds at creation; advisory only, never used for
    /// ordering decisions.
    pub wall_clock_ms: u64,
    /// Hash of the previous chain entry ([`GENESIS_HASH`] for the first).
    pub previous_hash: Hash256,
    /// Ed25519 signature over the clock's signing bytes.
    pub signature: Vec<u8>,
}

impl VectorClock {
    /// Bytes covered by the signature.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.node_id.as_bytes());
        buf.extend_from_slice(&self.logical_time.to_le_bytes());
        buf.extend_from_slice(&self.wall_clock_ms.to_le_bytes());
        buf.extend_from_slice(&self.previous_hash);
        buf
    }

    /// Chain hash of this entry (covers the signature as well, so a
    /// re-signed entry forks the chain).
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_bytes());
        hasher.update(&self.signature);
        hasher.finalize().into()
    }

    /// Verify this entry's signature against the node's public identity.
    ///
    /// # Errors
    /// Returns [`EvidenceError::ForgedVectorClock`] on mismatch.
    pub fn verify(&self, public: &PublicIdentity) -> Result<()> {
        public
            .verify(&self.signing_bytes(), &self.signature)
            .map_err(|e| EvidenceError::ForgedVectorClock {
                node_id: self.node_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Strict happens-before within a single node's chain.
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.logical_time < other.logical_time
    }

    /// Two clocks are concurrent when neither can be causally ordered:
    /// different nodes, or a fork within one node's chain.
    #[must_use]
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        !self.happens_before(other) && !other.happens_before(self) && self != other
    }
}

/// Detect a fork: two distinct entries claiming the same position in one
/// node's chain.
#[must_use]
pub fn is_fork(a: &VectorClock, b: &VectorClock) -> bool {
    a.node_id == b.node_id
        && a.logical_time == b.logical_time
        && a.previous_hash == b.previous_hash
        && a.hash() != b.hash()
}

/// Issues successive clock entries for a node that owns an [`Identity`].
#[derive(Debug)]
pub struct ClockIssuer {
    node_id: NodeId,
    next_logical: u64,
    head_hash: Hash256,
}

impl ClockIssuer {
    #[must_use]
    pub fn new(identity: &Identity) -> Self {
        Self {
            node_id: identity.node_id(),
            next_logical: 1,
            head_hash: GENESIS_HASH,
        }
    }

    /// Create, sign, and link the next clock entry.
    pub fn advance(&mut self, identity: &Identity, wall_clock_ms: u64) -> VectorClock {
        let mut clock = VectorClock {
            node_id: self.node_id.clone(),
            logical_time: self.next_logical,
            wall_clock_ms,
            previous_hash: self.head_hash,
            signature: Vec::new(),
        };
        clock.signature = identity.sign(&clock.signing_bytes());
        self.next_logical += 1;
        self.head_hash = clock.hash();
        clock
    }
}

/// Verified per-node chain of clock entries.
///
/// Appends are checked for signature validity, strict monotonicity, and
/// hash linkage. A rejected entry leaves the chain untouched, which is what
/// invalidates all descendants of a forged entry: they can never link.
#[derive(Debug)]
pub struct ClockChain {
    node_id: NodeId,
    public: PublicIdentity,
    entries: Vec<VectorClock>,
}

impl ClockChain {
    #[must_use]
    pub fn new(node_id: NodeId, public: PublicIdentity) -> Self {
        Self {
            node_id,
            public,
            entries: Vec::new(),
        }
    }

    /// Append a verified entry.
    ///
    /// # Errors
    /// - [`EvidenceError::ForgedVectorClock`] on signature mismatch, wrong
    ///   owner, non-monotonic logical time, or hash-chain break.
    pub fn append(&mut self, clock: VectorClock) -> Result<()> {
        if clock.node_id != self.node_id {
            return Err(EvidenceError::ForgedVectorClock {
                node_id: clock.node_id,
                reason: format!("entry does not belong to chain of {}", self.node_id),
            });
        }
        clock.verify(&self.public)?;

        match self.entries.last() {
            None => {
                if clock.previous_hash != GENESIS_HASH {
                    return Err(EvidenceError::ForgedVectorClock {
                        node_id: clock.node_id,
                        reason: "first entry must link to genesis".to_string(),
                    });
                }
            }
            Some(head) => {
                if clock.logical_time <= head.logical_time {
                    return Err(EvidenceError::ForgedVectorClock {
                        node_id: clock.node_id,
                        reason: format!(
                            "logical time {} not after head {}",
                            clock.logical_time, head.logical_time
                        ),
                    });
                }
                if clock.previous_hash != head.hash() {
                    return Err(EvidenceError::ForgedVectorClock {
                        node_id: clock.node_id,
                        reason: "hash chain break".to_string(),
                    });
                }
            }
        }

        self.entries.push(clock);
        Ok(())
    }

    /// Current head entry.
    #[must_use]
    pub fn head(&self) -> Option<&VectorClock> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full revalidation of the stored chain. Returns the index of the
    /// first invalid entry, if any; everything from that index on is
    /// considered invalid.
    #[must_use]
    pub fn first_break(&self) -> Option<usize> {
        let mut prev_hash = GENESIS_HASH;
        let mut prev_logical = 0u64;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.verify(&self.public).is_err()
                || entry.previous_hash != prev_hash
                || entry.logical_time <= prev_logical
            {
                return Some(i);
            }
            prev_hash = entry.hash();
            prev_logical = entry.logical_time;
        }
        None
    }
}

//! Merkle tree construction and inclusion proofs for evidence auditing.
//!
//! Leaves are SHA-256 hashes of canonical evidence descriptors. Interior
//! nodes hash their children with domain separation so a leaf can never be
//! reinterpreted as an interior node. An odd level duplicates its last node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EvidenceError, Result};

/// 32-byte SHA-256 digest.
pub type Hash256 = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash a leaf payload with the leaf domain prefix.
#[must_use]
pub fn hash_leaf(payload: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(payload);
    hasher.finalize().into()
}

fn hash_node(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Inclusion proof: the leaf's index plus the sibling hash at each level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf in the original leaf list.
    pub leaf_index: usize,
    /// Sibling hashes from the leaf level up to (but excluding) the root.
    pub siblings: Vec<Hash256>,
}

/// A merkle tree over a fixed set of leaf hashes.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree over pre-hashed leaves.
    ///
    /// # Errors
    /// Returns an error if `leaves` is empty.
    pub fn build(leaves: Vec<Hash256>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(EvidenceError::InvalidState(
                "merkle tree requires at least one leaf".to_string(),
            ));
        }
        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let current = levels.last().map(Vec::as_slice).unwrap_or_default();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd level: duplicate the last node.
                let right = pair.get(1).unwrap_or(left);
                next.push(hash_node(left, right));
            }
            levels.push(next);
        }
        Ok(Self { levels })
    }

    /// Build a tree from raw leaf payloads, hashing each one.
    ///
    /// # Errors
    /// Returns an error if `payloads` is empty.
    pub fn from_payloads<P: AsRef<[u8]>>(payloads: &[P]) -> Result<Self> {
        Self::build(payloads.iter().map(|p| hash_leaf(p.as_ref())).collect())
    }

    /// The root hash.
    #[must_use]
    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_default()
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Generate an inclusion proof for the leaf at `index`.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range.
    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.leaf_count() {
            return Err(EvidenceError::InvalidState(format!(
                "leaf index {index} out of range ({} leaves)",
                self.leaf_count()
            )));
        }
        let mut siblings = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            // Duplicated node at an odd-length level is its own sibling.
            let sibling = level.get(sibling_idx).unwrap_or(&level[idx]);
            siblings.push(*sibling);
            idx /= 2;
        }
        Ok(MerkleProof {
            leaf_index: index,
            siblings,
        })
    }
}

/// Verify that `leaf` is included under `root` using `proof`.
#[must_use]
pub fn verify_proof(leaf: &Hash256, proof: &MerkleProof, root: &Hash256) -> bool {
    let mut current = *leaf;
    let mut idx = proof.leaf_index;
    for sibling in &proof.siblings {
        current = if idx % 2 == 0 {
            hash_node(&current, sibling)
        } else {
            hash_node(sibling, &current)
        };
        idx /= 2;
    }
    current == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| hash_leaf(format!("leaf-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_build_empty_rejected() {
        assert!(MerkleTree::build(vec![]).is_err());
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let l = leaves(1);
        let tree = MerkleTree::build(l.clone()).unwrap();
        assert_eq!(tree.root(), l[0]);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_proof_verifies_all_leaves() {
        for n in [1usize, 2, 3, 4, 5, 7, 8, 9, 16, 33] {
            let l = leaves(n);
            let tree = MerkleTree::build(l.clone()).unwrap();
            let root = tree.root();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify_proof(leaf, &proof, &root), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn test_proof_wrong_leaf_fails() {
        let l = leaves(8);
        let tree = MerkleTree::build(l.clone()).unwrap();
        let proof = tree.proof(3).unwrap();
        let wrong = hash_leaf(b"not-a-member");
        assert!(!verify_proof(&wrong, &proof, &tree.root()));
    }

    #[test]
    fn test_proof_wrong_index_fails() {
        let l = leaves(8);
        let tree = MerkleTree::build(l.clone()).unwrap();
        let mut proof = tree.proof(3).unwrap();
        proof.leaf_index = 4;
        assert!(!verify_proof(&l[3], &proof, &tree.root()));
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::build(leaves(4)).unwrap();
        assert!(tree.proof(4).is_err());
    }

    #[test]
    fn test_odd_level_duplication() {
        // With 3 leaves the last leaf is duplicated; its proof must still
        // verify.
        let l = leaves(3);
        let tree = MerkleTree::build(l.clone()).unwrap();
        let proof = tree.proof(2).unwrap();
        assert!(verify_proof(&l[2], &proof, &tree.root()));
    }

    #[test]
    fn test_root_deterministic() {
        let a = MerkleTree::build(leaves(10)).unwrap();
        let b = MerkleTree::build(leaves(10)).unwrap();
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_root_changes_with_leaves() {
        let a = MerkleTree::build(leaves(10)).unwrap();
        let b = MerkleTree::build(leaves(11)).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_leaf_node_domain_separation() {
        // An interior-node preimage must not collide with a leaf hash of
        // the same bytes.
        let l = leaves(2);
        let interior = hash_node(&l[0], &l[1]);
        let mut as_leaf_payload = Vec::new();
        as_leaf_payload.extend_from_slice(&l[0]);
        as_leaf_payload.extend_from_slice(&l[1]);
        assert_ne!(interior, hash_leaf(&as_leaf_payload));
    }

    #[test]
    fn test_from_payloads() {
        let tree = MerkleTree::from_payloads(&[b"a".as_slice(), b"b", b"c"]).unwrap();
        let proof = tree.proof(1).unwrap();
        assert!(verify_proof(&hash_leaf(b"b"), &proof, &tree.root()));
    }

    #[test]
    fn test_proof_serialization() {
        let tree = MerkleTree::build(leaves(5)).unwrap();
        let proof = tree.proof(2).unwrap();
        let bytes = bincode::serialize(&proof).unwrap();
        let restored: MerkleProof = bincode::deserialize(&bytes).unwrap();
        assert_eq!(proof, restored);
    }
}

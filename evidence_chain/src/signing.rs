// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Ed25519 identity management for evidence sources.
//!
//! Each participating node holds an [`Identity`] (private signing key) from
//! which its [`NodeId`] is deterministically derived:
//!
//! ```text
//! NodeId = hex(BLAKE2b-128(domain_separator || public_key))
//! ```
//!
//! Identity binding means a claimed `source_node` can be checked against the
//! key that actually signed a record, preventing impersonation. Domain
//! separation prevents a hash computed for one purpose from being misused in
//! another context.
//!
//! Key and certificate issuance is an external collaborator's job; this
//! module only consumes verified public keys through the
//! [`ValidatorRegistry`].

// ZeroizeOnDrop derive macro generates code that triggers this warning
#![allow(unused_assignments)]

use blake2::{digest::consts::U16, Blake2b, Digest};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::{EvidenceError, Result};

/// Node identifier: 32 hex chars derived from the node's public key.
pub type NodeId = String;

/// Domain separator for `NodeId` derivation.
const NODE_ID_DOMAIN: &[u8] = b"evidence_node_id_v1";

/// Signing identity with private key (zeroized on drop).
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    /// Ed25519 signing key (private).
    #[zeroize(skip)] // ed25519_dalek handles zeroization internally
    signing_key: SigningKey,
}

impl Identity {
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// # Errors
    /// Returns an error if the bytes don't form a valid signing key
    /// (currently infallible).
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(bytes);
        Ok(Self { signing_key })
    }

    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    #[must_use]
    pub fn verifying_key(&self) -> PublicIdentity {
        PublicIdentity {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.verifying_key().to_node_id()
    }

    /// Sign a message, returning the 64-byte Ed25519 signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose private key in debug output
        f.debug_struct("Identity")
            .field("node_id", &self.node_id())
            .finish()
    }
}

/// Public identity (verifying key only, no private key).
#[derive(Clone)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    /// # Errors
    /// Returns an error if the bytes don't form a valid Ed25519 public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| EvidenceError::CryptoError(format!("invalid public key: {e}")))?;
        Ok(Self { verifying_key })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Uses BLAKE2b-128 for a compact but collision-resistant ID.
    #[must_use]
    pub fn to_node_id(&self) -> NodeId {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(NODE_ID_DOMAIN);
        hasher.update(self.verifying_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// # Errors
    /// Returns an error if the signature is invalid or has the wrong length.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != 64 {
            return Err(EvidenceError::CryptoError(format!(
                "invalid signature length: expected 64, got {}",
                signature.len()
            )));
        }
        let sig_bytes: &[u8; 64] = signature
            .try_into()
            .map_err(|_| EvidenceError::CryptoError("signature conversion failed".to_string()))?;
        let sig = Signature::from_bytes(sig_bytes);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|e| EvidenceError::CryptoError(format!("signature verification failed: {e}")))
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("node_id", &self.to_node_id())
            .finish()
    }
}

/// Registry of known validator public keys, keyed by derived `NodeId`.
///
/// Thread-safe; registration happens at cluster configuration time, lookups
/// on every evidence verification.
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    keys: DashMap<NodeId, PublicIdentity>,
}

impl ValidatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Register a node's public identity. Returns the derived `NodeId`.
    pub fn register(&self, identity: &Identity) -> NodeId {
        let public = identity.verifying_key();
        let node_id = public.to_node_id();
        self.keys.insert(node_id.clone(), public);
        node_id
    }

    /// Register a pre-verified public identity directly.
    pub fn register_public(&self, public: PublicIdentity) -> NodeId {
        let node_id = public.to_node_id();
        self.keys.insert(node_id.clone(), public);
        node_id
    }

    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.keys.contains_key(node_id)
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<PublicIdentity> {
        self.keys.get(node_id).map(|e| e.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All registered node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }
}

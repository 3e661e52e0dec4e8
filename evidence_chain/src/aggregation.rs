//! Hierarchical aggregation tree: O(log n) statistical baselines.
//!
//! Per-source statistics are kept in leaf nodes and merged upward through
//! regional and sector aggregators to a global root, so one update touches
//! O(log n) nodes instead of re-correlating every pair of sources.
//!
//! ```text
//! Global (root)
//!   └── Sector
//!         └── Regional
//!               └── Leaf  (up to max_leaf_size sources each)
//! ```
//!
//! Each node holds a Welford triple merged with the parallel-variance
//! formula, a consensus weight, and an audit hash chaining every merged
//! state. Nodes are exclusively owned by their hosting process: all
//! mutation goes through the node's own lock (single writer), reads take a
//! snapshot. Lock order is the `nodes` map before any node lock, and node
//! locks only parent-before-child; no path takes the map lock while
//! holding a node lock.
//!
//! Failure semantics are fail-open for availability and fail-closed for
//! trust: a child that misses its propagation deadline is marked stale and
//! its weight decays, but its last known stats still merge and a stale
//! child never blocks a query.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{EvidenceError, Result},
    merkle::Hash256,
    signing::NodeId,
    stats::WelfordSummary,
};

/// Identifier of the global root node.
pub const ROOT_ID: &str = "global_root";

/// Levels of the aggregation hierarchy, leaf to root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregationLevel {
    Leaf,
    Regional,
    Sector,
    Global,
}

impl AggregationLevel {
    /// The level one step closer to the root.
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Leaf => Some(Self::Regional),
            Self::Regional => Some(Self::Sector),
            Self::Sector => Some(Self::Global),
            Self::Global => None,
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            Self::Leaf => "leaf",
            Self::Regional => "regional",
            Self::Sector => "sector",
            Self::Global => "global",
        }
    }
}

/// Configuration for tree shape and staleness handling.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Children per internal node.
    pub branching_factor: usize,
    /// Sources per leaf node.
    pub max_leaf_size: usize,
    /// A child is stale after this many milliseconds without an update.
    pub stale_after_ms: u64,
    /// Multiplicative weight decay per stale window.
    pub stale_decay: f64,
    /// Weight floor for stale children.
    pub min_stale_weight: f64,
    /// Leaf count high-water mark triggering checkpoint-and-archive.
    pub checkpoint_count: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            branching_factor: 10,
            max_leaf_size: 50,
            stale_after_ms: 30_000,
            stale_decay: 0.5,
            min_stale_weight: 0.1,
            checkpoint_count: u64::MAX / 2,
        }
    }
}

impl AggregationConfig {
    #[must_use]
    pub const fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    #[must_use]
    pub const fn with_max_leaf_size(mut self, max_leaf_size: usize) -> Self {
        self.max_leaf_size = max_leaf_size;
        self
    }

    #[must_use]
    pub const fn with_stale_after_ms(mut self, stale_after_ms: u64) -> Self {
        self.stale_after_ms = stale_after_ms;
        self
    }

    #[must_use]
    pub const fn with_checkpoint_count(mut self, checkpoint_count: u64) -> Self {
        self.checkpoint_count = checkpoint_count;
        self
    }
}

/// Scope of a baseline query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationScope {
    /// The global root baseline.
    Global,
    /// A specific tree node (leaf, regional, or sector) by id.
    Subtree(String),
}

/// Result of one ingest: which nodes the update touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUpdate {
    pub source: NodeId,
    pub leaf_id: String,
    /// Ancestors re-merged by this update, leaf's parent first.
    pub propagation_path: Vec<String>,
}

/// A queryable statistical baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub variance: f64,
    pub count: u64,
    /// 95% confidence interval (low, high).
    pub ci95: (f64, f64),
    /// Blend of variance tightness and sample support in `[0, 1]`.
    pub stability: f64,
    pub last_update_ms: u64,
}

impl Baseline {
    #[must_use]
    pub fn from_summary(summary: &WelfordSummary, last_update_ms: u64) -> Self {
        let variance = summary.variance();
        let variance_stability = 1.0 / (1.0 + variance);
        let sample_stability = (summary.count() as f64 / 1000.0).min(1.0);
        Self {
            mean: summary.mean(),
            variance,
            count: summary.count(),
            ci95: summary.ci95(),
            stability: 0.7 * variance_stability + 0.3 * sample_stability,
            last_update_ms,
        }
    }

    /// Reconstruct the underlying Welford triple (loses nothing: the
    /// baseline carries the full sufficient statistics).
    #[must_use]
    pub fn to_summary(&self) -> WelfordSummary {
        let m2 = if self.count < 2 {
            0.0
        } else {
            self.variance * (self.count - 1) as f64
        };
        WelfordSummary::from_parts(self.count, self.mean, m2)
    }
}

/// Summary archived by a checkpoint before a counter reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEpoch {
    pub epoch: u32,
    pub summary: WelfordSummary,
    pub audit_hash: Hash256,
}

/// Deviation of a value against one ancestor's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDeviation {
    pub node_id: String,
    pub level: AggregationLevel,
    /// Standardized deviation from the node's mean.
    pub z_score: f64,
    pub is_anomalous: bool,
}

#[derive(Debug)]
struct NodeState {
    id: String,
    level: AggregationLevel,
    parent: Option<String>,
    children: Vec<String>,
    summary: WelfordSummary,
    weight: f64,
    last_update_ms: u64,
    audit_hash: Hash256,
    archived: Vec<ArchivedEpoch>,
    assigned_sources: usize,
}

impl NodeState {
    fn new(id: String, level: AggregationLevel, parent: Option<String>) -> Self {
        Self {
            id,
            level,
            parent,
            children: Vec::new(),
            summary: WelfordSummary::new(),
            weight: 1.0,
            last_update_ms: 0,
            audit_hash: [0u8; 32],
            archived: Vec::new(),
            assigned_sources: 0,
        }
    }

    /// Extend the audit chain with the current merged state.
    fn advance_audit(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.audit_hash);
        hasher.update(self.summary.count().to_le_bytes());
        hasher.update(self.summary.mean().to_bits().to_le_bytes());
        hasher.update(self.summary.m2().to_bits().to_le_bytes());
        self.audit_hash = hasher.finalize().into();
    }
}

type SharedNode = Arc<RwLock<NodeState>>;

/// The hierarchical aggregation tree.
#[derive(Debug)]
pub struct AggregationTree {
    config: AggregationConfig,
    nodes: RwLock<HashMap<String, SharedNode>>,
    source_to_leaf: DashMap<NodeId, String>,
}

impl Default for AggregationTree {
    fn default() -> Self {
        Self::new(AggregationConfig::default())
    }
}

impl AggregationTree {
    #[must_use]
    pub fn new(config: AggregationConfig) -> Self {
        let mut nodes = HashMap::new();
        let root = NodeState::new(ROOT_ID.to_string(), AggregationLevel::Global, None);
        nodes.insert(ROOT_ID.to_string(), Arc::new(RwLock::new(root)));
        Self {
            config,
            nodes: RwLock::new(nodes),
            source_to_leaf: DashMap::new(),
        }
    }

    fn node(&self, id: &str) -> Option<SharedNode> {
        self.nodes.read().get(id).cloned()
    }

    fn count_at_level(nodes: &HashMap<String, SharedNode>, level: AggregationLevel) -> usize {
        nodes.values().filter(|n| n.read().level == level).count()
    }

    /// Find an internal node at `level` with a free child slot, or create
    /// one (recursively attaching it toward the root). The caller holds the
    /// `nodes` write lock, which makes the search and the insert one atomic
    /// step: a node id is never minted twice and a parent never gains the
    /// same child twice.
    fn find_or_create_parent(
        &self,
        nodes: &mut HashMap<String, SharedNode>,
        level: AggregationLevel,
    ) -> String {
        if level == AggregationLevel::Global {
            return ROOT_ID.to_string();
        }
        for shared in nodes.values() {
            let node = shared.read();
            if node.level == level && node.children.len() < self.config.branching_factor {
                return node.id.clone();
            }
        }
        let id = format!("{}_{}", level.prefix(), Self::count_at_level(nodes, level));
        let grandparent =
            self.find_or_create_parent(nodes, level.parent().unwrap_or(AggregationLevel::Global));
        let state = NodeState::new(id.clone(), level, Some(grandparent.clone()));
        nodes.insert(id.clone(), Arc::new(RwLock::new(state)));
        if let Some(parent) = nodes.get(&grandparent) {
            parent.write().children.push(id.clone());
        }
        id
    }

    /// Leaf node a source reports into, assigning one if needed. Assignment
    /// runs under a single `nodes` write lock, so concurrent fresh sources
    /// serialize here and a leaf slot is never handed out past
    /// `max_leaf_size`.
    fn leaf_for(&self, source: &str) -> String {
        if let Some(leaf) = self.source_to_leaf.get(source) {
            return leaf.clone();
        }
        let mut nodes = self.nodes.write();
        // Another thread may have assigned the source while we waited.
        if let Some(leaf) = self.source_to_leaf.get(source) {
            return leaf.clone();
        }
        // Find a leaf with space.
        let existing = nodes
            .values()
            .map(|shared| shared.read())
            .find(|n| {
                n.level == AggregationLevel::Leaf
                    && n.assigned_sources < self.config.max_leaf_size
            })
            .map(|n| n.id.clone());
        let leaf_id = match existing {
            Some(id) => id,
            None => {
                let id = format!(
                    "leaf_{}",
                    Self::count_at_level(&nodes, AggregationLevel::Leaf)
                );
                let parent = self.find_or_create_parent(&mut nodes, AggregationLevel::Regional);
                let state =
                    NodeState::new(id.clone(), AggregationLevel::Leaf, Some(parent.clone()));
                nodes.insert(id.clone(), Arc::new(RwLock::new(state)));
                if let Some(parent_node) = nodes.get(&parent) {
                    parent_node.write().children.push(id.clone());
                }
                id
            }
        };
        if let Some(leaf) = nodes.get(&leaf_id) {
            leaf.write().assigned_sources += 1;
        }
        self.source_to_leaf.insert(source.to_string(), leaf_id.clone());
        leaf_id
    }

    /// Combine two child summaries with the parallel-variance formula.
    /// A zero-count side is skipped.
    #[must_use]
    pub fn merge(a: &WelfordSummary, b: &WelfordSummary) -> WelfordSummary {
        a.merge(b)
    }

    /// Ingest one validated observation for `source`, updating its leaf
    /// and re-merging every ancestor up to the root.
    ///
    /// # Errors
    /// Returns an error only on internal tree inconsistency.
    pub fn ingest(&self, source: &str, value: f64, now_ms: u64) -> Result<LocalUpdate> {
        let leaf_id = self.leaf_for(source);
        let leaf = self
            .node(&leaf_id)
            .ok_or_else(|| EvidenceError::InvalidState(format!("missing leaf {leaf_id}")))?;

        let parent_id = {
            let mut node = leaf.write();
            if node.summary.count() >= self.config.checkpoint_count {
                self.checkpoint_locked(&mut node);
            }
            node.summary.push(value);
            node.last_update_ms = now_ms;
            node.advance_audit();
            node.parent.clone()
        };

        let mut path = Vec::new();
        let mut current = parent_id;
        while let Some(id) = current {
            let node = self
                .node(&id)
                .ok_or_else(|| EvidenceError::InvalidState(format!("missing node {id}")))?;
            current = self.remerge(&node, now_ms)?;
            path.push(id);
        }

        Ok(LocalUpdate {
            source: source.to_string(),
            leaf_id,
            propagation_path: path,
        })
    }

    /// Re-merge a parent from its children's current summaries. Child
    /// summaries are read while the parent's write lock is held, so
    /// remerges of one parent serialize and the last one to run sees every
    /// child push that preceded it. Child `Arc`s are resolved from the map
    /// before the lock is taken (map before node locks); since attaching a
    /// new child also goes through the parent's lock, a changed children
    /// list just means resolving again.
    fn remerge(&self, parent: &SharedNode, now_ms: u64) -> Result<Option<String>> {
        loop {
            let (snapshot, parent_id) = {
                let node = parent.read();
                (node.children.clone(), node.id.clone())
            };
            let mut resolved = Vec::with_capacity(snapshot.len());
            for child_id in &snapshot {
                let child = self.node(child_id).ok_or_else(|| {
                    EvidenceError::InvalidState(format!("missing child {child_id} of {parent_id}"))
                })?;
                resolved.push(child);
            }

            let mut node = parent.write();
            if node.children != snapshot {
                continue;
            }
            let mut combined = WelfordSummary::new();
            let mut latest_ms = 0u64;
            for child in &resolved {
                let child = child.read();
                // count=0 children are skipped by the merge identity.
                combined = combined.merge(&child.summary);
                latest_ms = latest_ms.max(child.last_update_ms);
            }
            node.summary = combined;
            node.last_update_ms = latest_ms.max(node.last_update_ms).max(now_ms);
            node.advance_audit();
            return Ok(node.parent.clone());
        }
    }

    fn checkpoint_locked(&self, node: &mut NodeState) {
        let epoch = node.archived.len() as u32;
        node.archived.push(ArchivedEpoch {
            epoch,
            summary: node.summary,
            audit_hash: node.audit_hash,
        });
        tracing::debug!(
            node = %node.id,
            epoch,
            count = node.summary.count(),
            "checkpoint-and-archive before counter reset"
        );
        node.summary = WelfordSummary::new();
    }

    /// Query the baseline for a scope. Never blocked by stale children:
    /// the stored merged summary is returned as-is.
    ///
    /// # Errors
    /// Returns [`EvidenceError::UnknownScope`] for an unknown subtree id.
    pub fn query(&self, scope: &AggregationScope) -> Result<Baseline> {
        let id = match scope {
            AggregationScope::Global => ROOT_ID,
            AggregationScope::Subtree(id) => id.as_str(),
        };
        let node = self
            .node(id)
            .ok_or_else(|| EvidenceError::UnknownScope(id.to_string()))?;
        let node = node.read();
        Ok(Baseline::from_summary(&node.summary, node.last_update_ms))
    }

    /// Whether a node has missed its propagation deadline.
    #[must_use]
    pub fn is_stale(&self, id: &str, now_ms: u64) -> bool {
        self.node(id).is_some_and(|node| {
            let node = node.read();
            node.summary.count() > 0
                && now_ms.saturating_sub(node.last_update_ms) > self.config.stale_after_ms
        })
    }

    /// Effective trust weight of a node: decayed multiplicatively per
    /// missed window, floored, never zero. Fail-open for availability,
    /// fail-closed for trust weighting.
    #[must_use]
    pub fn node_weight(&self, id: &str, now_ms: u64) -> f64 {
        let Some(node) = self.node(id) else {
            return 0.0;
        };
        let node = node.read();
        let age = now_ms.saturating_sub(node.last_update_ms);
        if node.summary.count() == 0 || age <= self.config.stale_after_ms {
            return node.weight;
        }
        let windows = (age / self.config.stale_after_ms.max(1)) as i32;
        (node.weight * self.config.stale_decay.powi(windows)).max(self.config.min_stale_weight)
    }

    /// Audit hash of a node's merge chain.
    #[must_use]
    pub fn audit_hash(&self, id: &str) -> Option<Hash256> {
        self.node(id).map(|n| n.read().audit_hash)
    }

    /// Archived checkpoint epochs for a node.
    #[must_use]
    pub fn archived(&self, id: &str) -> Vec<ArchivedEpoch> {
        self.node(id).map_or_else(Vec::new, |n| n.read().archived.clone())
    }

    /// Standardized deviation of `value` against each ancestor baseline of
    /// `source`, leaf first, plus whether a 60% majority of levels flags
    /// it as anomalous.
    #[must_use]
    pub fn deviation_path(&self, source: &str, value: f64, z_threshold: f64) -> Vec<LevelDeviation> {
        let Some(leaf_id) = self.source_to_leaf.get(source).map(|l| l.clone()) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        let mut current = Some(leaf_id);
        while let Some(id) = current {
            let Some(node) = self.node(&id) else { break };
            let node = node.read();
            let sd = node.summary.variance().sqrt();
            let z = if sd > 0.0 {
                (value - node.summary.mean()).abs() / sd
            } else {
                0.0
            };
            result.push(LevelDeviation {
                node_id: node.id.clone(),
                level: node.level,
                z_score: z,
                is_anomalous: z > z_threshold,
            });
            current = node.parent.clone();
        }
        result
    }

    /// Whether a majority of hierarchy levels consider `value` anomalous.
    #[must_use]
    pub fn is_anomalous(&self, source: &str, value: f64, z_threshold: f64) -> bool {
        let path = self.deviation_path(source, value, z_threshold);
        if path.is_empty() {
            return false;
        }
        let votes = path.iter().filter(|d| d.is_anomalous).count();
        votes as f64 / path.len() as f64 >= 0.6
    }

    /// Number of sources assigned to leaves.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.source_to_leaf.len()
    }

    /// Total node count across all levels.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> AggregationTree {
        AggregationTree::new(
            AggregationConfig::default()
                .with_branching_factor(2)
                .with_max_leaf_size(2),
        )
    }

    #[test]
    fn test_single_ingest() {
        let tree = AggregationTree::default();
        let update = tree.ingest("src-1", 5.0, 100).unwrap();
        assert_eq!(update.leaf_id, "leaf_0");
        assert_eq!(
            update.propagation_path.last().map(String::as_str),
            Some(ROOT_ID)
        );

        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert_eq!(baseline.count, 1);
        assert!((baseline.mean - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_source_sticks_to_leaf() {
        let tree = small_tree();
        let a = tree.ingest("src-1", 1.0, 0).unwrap();
        let b = tree.ingest("src-1", 2.0, 1).unwrap();
        assert_eq!(a.leaf_id, b.leaf_id);
        assert_eq!(tree.source_count(), 1);
    }

    #[test]
    fn test_leaf_overflow_creates_new_leaf() {
        let tree = small_tree();
        tree.ingest("a", 1.0, 0).unwrap();
        tree.ingest("b", 1.0, 0).unwrap();
        let c = tree.ingest("c", 1.0, 0).unwrap();
        assert_ne!(c.leaf_id, "leaf_0");
    }

    #[test]
    fn test_global_matches_flat_welford() {
        let tree = small_tree();
        let values: Vec<f64> = (0..40).map(|i| f64::from(i) * 0.7 - 3.0).collect();
        let mut flat = WelfordSummary::new();
        for (i, &v) in values.iter().enumerate() {
            tree.ingest(&format!("src-{i}"), v, i as u64).unwrap();
            flat.push(v);
        }
        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert_eq!(baseline.count, flat.count());
        assert!((baseline.mean - flat.mean()).abs() < 1e-9);
        assert!((baseline.variance - flat.variance()).abs() < 1e-9);
    }

    #[test]
    fn test_propagation_is_logarithmic() {
        let tree = small_tree();
        for i in 0..30 {
            tree.ingest(&format!("src-{i}"), 1.0, 0).unwrap();
        }
        let update = tree.ingest("src-0", 1.0, 1).unwrap();
        // Path climbs levels, not sources.
        assert!(update.propagation_path.len() <= 3);
    }

    #[test]
    fn test_empty_children_skipped_in_merge() {
        let a = WelfordSummary::new();
        let mut b = WelfordSummary::new();
        b.push(4.0);
        let merged = AggregationTree::merge(&a, &b);
        assert_eq!(merged, b);
    }

    #[test]
    fn test_query_unknown_scope() {
        let tree = AggregationTree::default();
        let err = tree
            .query(&AggregationScope::Subtree("leaf_99".to_string()))
            .unwrap_err();
        assert!(matches!(err, EvidenceError::UnknownScope(_)));
    }

    #[test]
    fn test_query_subtree() {
        let tree = AggregationTree::default();
        let update = tree.ingest("src-1", 2.0, 0).unwrap();
        let leaf = tree
            .query(&AggregationScope::Subtree(update.leaf_id))
            .unwrap();
        assert_eq!(leaf.count, 1);
    }

    #[test]
    fn test_stale_child_decays_but_never_blocks() {
        let config = AggregationConfig::default().with_stale_after_ms(100);
        let tree = AggregationTree::new(config);
        let update = tree.ingest("src-1", 2.0, 0).unwrap();

        assert!(!tree.is_stale(&update.leaf_id, 50));
        assert!(tree.is_stale(&update.leaf_id, 500));

        let fresh = tree.node_weight(&update.leaf_id, 50);
        let stale = tree.node_weight(&update.leaf_id, 500);
        assert_eq!(fresh, 1.0);
        assert!(stale < fresh);
        assert!(stale >= 0.1);

        // The query still answers from last known stats.
        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert_eq!(baseline.count, 1);
    }

    #[test]
    fn test_stale_weight_floor() {
        let config = AggregationConfig::default().with_stale_after_ms(1);
        let tree = AggregationTree::new(config);
        let update = tree.ingest("src-1", 2.0, 0).unwrap();
        let weight = tree.node_weight(&update.leaf_id, 1_000_000);
        assert_eq!(weight, 0.1);
    }

    #[test]
    fn test_audit_hash_advances() {
        let tree = AggregationTree::default();
        let before = tree.audit_hash(ROOT_ID).unwrap();
        tree.ingest("src-1", 1.0, 0).unwrap();
        let after = tree.audit_hash(ROOT_ID).unwrap();
        assert_ne!(before, after);
        tree.ingest("src-1", 2.0, 1).unwrap();
        assert_ne!(after, tree.audit_hash(ROOT_ID).unwrap());
    }

    #[test]
    fn test_checkpoint_and_archive() {
        let config = AggregationConfig::default().with_checkpoint_count(3);
        let tree = AggregationTree::new(config);
        let mut leaf_id = String::new();
        for i in 0..7 {
            leaf_id = tree.ingest("src-1", f64::from(i), i as u64).unwrap().leaf_id;
        }
        let archived = tree.archived(&leaf_id);
        assert!(!archived.is_empty(), "high-water mark should checkpoint");
        assert_eq!(archived[0].epoch, 0);
        assert_eq!(archived[0].summary.count(), 3);

        // Live summary restarted rather than wrapping.
        let live = tree
            .query(&AggregationScope::Subtree(leaf_id))
            .unwrap();
        assert!(live.count < 7);
    }

    #[test]
    fn test_baseline_stability_range() {
        let tree = AggregationTree::default();
        for i in 0..100 {
            tree.ingest(&format!("src-{i}"), 0.5, 0).unwrap();
        }
        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert!(baseline.stability > 0.0 && baseline.stability <= 1.0);
    }

    #[test]
    fn test_baseline_roundtrip_summary() {
        let tree = AggregationTree::default();
        for i in 0..50 {
            tree.ingest("src-1", f64::from(i), 0).unwrap();
        }
        let baseline = tree.query(&AggregationScope::Global).unwrap();
        let summary = baseline.to_summary();
        assert_eq!(summary.count(), baseline.count);
        assert!((summary.variance() - baseline.variance).abs() < 1e-9);
    }

    #[test]
    fn test_deviation_path_flags_outlier() {
        let tree = AggregationTree::default();
        for i in 0..100 {
            // Tight cluster around 0.
            tree.ingest("src-1", f64::from(i % 5) * 0.01, i as u64).unwrap();
        }
        assert!(tree.is_anomalous("src-1", 1000.0, 3.0));
        assert!(!tree.is_anomalous("src-1", 0.02, 3.0));
    }

    #[test]
    fn test_deviation_path_unknown_source() {
        let tree = AggregationTree::default();
        assert!(tree.deviation_path("ghost", 1.0, 3.0).is_empty());
        assert!(!tree.is_anomalous("ghost", 1.0, 3.0));
    }

    #[test]
    fn test_tree_structure_counts() {
        let tree = small_tree();
        for i in 0..8 {
            tree.ingest(&format!("src-{i}"), 1.0, 0).unwrap();
        }
        // 8 sources at 2 per leaf => 4 leaves, plus internal structure.
        assert!(tree.node_count() > 4);
        assert_eq!(tree.source_count(), 8);
    }

    #[test]
    fn test_concurrent_fresh_sources_count_exactly_once() {
        // Narrow tree with one source per leaf, so every fresh source races
        // through node creation.
        let tree = Arc::new(AggregationTree::new(
            AggregationConfig::default()
                .with_branching_factor(2)
                .with_max_leaf_size(1),
        ));

        let mut handles = Vec::new();
        for t in 0..8 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    tree.ingest(&format!("src-{t}-{i}"), 1.0, 0).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert_eq!(
            baseline.count, 200,
            "every ingest must reach the root exactly once"
        );
        assert_eq!(tree.source_count(), 200);
        assert!((baseline.mean - 1.0).abs() < 1e-12);
        assert!(baseline.variance.abs() < 1e-12);
    }

    #[test]
    fn test_concurrent_updates_to_assigned_sources() {
        let tree = Arc::new(small_tree());
        for t in 0..4 {
            tree.ingest(&format!("src-{t}"), 0.0, 0).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..4 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 1..=50u64 {
                    tree.ingest(&format!("src-{t}"), 1.0, i).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let baseline = tree.query(&AggregationScope::Global).unwrap();
        assert_eq!(baseline.count, 204);
        assert_eq!(tree.source_count(), 4);
    }
}

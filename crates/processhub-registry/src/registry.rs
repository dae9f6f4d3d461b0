//! Local registry
//!
//! Each node owns one `LocalRegistry` per hub: the mapping
//! `child_id -> (spec, {node -> pid})`. The registry is mutated only by
//! the hub coordinator; every read hands out an immutable clone. All
//! remote merges are scoped to the contributing node's edges and gated
//! by that node's microsecond timestamp, so contributions from distinct
//! nodes commute.

use crate::error::{RegistryError, RegistryResult};
use crate::node::NodeId;
use processhub_core::child::{ChildId, ChildSpec, Pid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, trace};

// =============================================================================
// Snapshot and delta types
// =============================================================================

/// One node's self-asserted projection of its running children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContribution {
    /// Children the contributing node currently supervises
    pub children: BTreeMap<ChildId, (ChildSpec, Pid)>,
}

impl NodeContribution {
    /// Create an empty contribution
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of asserted children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the contribution asserts no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable view of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// The child's spec, immutable after first insert
    pub spec: ChildSpec,
    /// Nodes currently asserting a running replica, with their pids
    pub locations: BTreeMap<NodeId, Pid>,
}

/// Edges added and removed by one registry mutation.
///
/// The coordinator uses deltas to drive redundancy signals and hooks
/// without diffing full snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryDelta {
    /// Edges that appeared: (child, node, pid)
    pub added: Vec<(ChildId, NodeId, Pid)>,
    /// Edges that disappeared: (child, node)
    pub removed: Vec<(ChildId, NodeId)>,
}

impl RegistryDelta {
    /// Whether the mutation changed nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Fold another delta into this one
    pub fn extend(&mut self, other: RegistryDelta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }

    /// Distinct children touched by this delta
    pub fn changed_children(&self) -> BTreeSet<ChildId> {
        self.added
            .iter()
            .map(|(cid, _, _)| cid.clone())
            .chain(self.removed.iter().map(|(cid, _)| cid.clone()))
            .collect()
    }
}

// =============================================================================
// LocalRegistry
// =============================================================================

/// Per-hub registry of child locations.
pub struct LocalRegistry {
    local: NodeId,
    entries: RwLock<HashMap<ChildId, RegistryEntry>>,
    /// Per-contributor staleness watermark (microseconds, contributor's clock)
    last_seen_us: RwLock<HashMap<NodeId, u64>>,
}

impl LocalRegistry {
    /// Create an empty registry for the given local node
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            entries: RwLock::new(HashMap::new()),
            last_seen_us: RwLock::new(HashMap::new()),
        }
    }

    /// The node whose edges this registry asserts authoritatively
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    // =========================================================================
    // Local edge mutation
    // =========================================================================

    /// Record a locally supervised replica.
    ///
    /// The spec is immutable after the first insert; re-registering the
    /// same child with a different spec is an error.
    pub async fn insert_local(&self, spec: ChildSpec, pid: Pid) -> RegistryResult<RegistryDelta> {
        let mut entries = self.entries.write().await;
        let child_id = spec.id.clone();

        let entry = entries.entry(child_id.clone()).or_insert_with(|| RegistryEntry {
            spec: spec.clone(),
            locations: BTreeMap::new(),
        });

        if entry.spec != spec {
            return Err(RegistryError::SpecMismatch {
                child_id: child_id.to_string(),
            });
        }

        let mut delta = RegistryDelta::default();
        if entry.locations.insert(self.local.clone(), pid) != Some(pid) {
            delta.added.push((child_id, self.local.clone(), pid));
        }
        Ok(delta)
    }

    /// Remove the local replica of `child_id`.
    ///
    /// # Errors
    /// Returns [`RegistryError::ChildUnknown`] if no local replica exists.
    pub async fn remove_local(&self, child_id: &ChildId) -> RegistryResult<RegistryDelta> {
        let mut entries = self.entries.write().await;

        let entry = entries
            .get_mut(child_id)
            .ok_or_else(|| RegistryError::child_unknown(child_id))?;

        if entry.locations.remove(&self.local).is_none() {
            return Err(RegistryError::child_unknown(child_id));
        }

        if entry.locations.is_empty() {
            entries.remove(child_id);
        }

        Ok(RegistryDelta {
            added: Vec::new(),
            removed: vec![(child_id.clone(), self.local.clone())],
        })
    }

    /// The projection this node publishes in gossip rounds.
    pub async fn local_snapshot(&self) -> NodeContribution {
        let entries = self.entries.read().await;
        let children = entries
            .iter()
            .filter_map(|(cid, entry)| {
                entry
                    .locations
                    .get(&self.local)
                    .map(|pid| (cid.clone(), (entry.spec.clone(), *pid)))
            })
            .collect();
        NodeContribution { children }
    }

    // =========================================================================
    // Remote merges
    // =========================================================================

    /// Merge one node's full contribution from a gossip round.
    ///
    /// Appends every asserted `(child, node, pid)` edge and detaches the
    /// contributing node's edges that are absent from the contribution.
    /// Edges asserted by other nodes are never touched. Contributions
    /// older than the recorded watermark for `node` are skipped whole.
    pub async fn apply_contribution(
        &self,
        node: &NodeId,
        contribution: &NodeContribution,
        timestamp_us: u64,
    ) -> RegistryDelta {
        // Own edges are authoritative; a round echo must not resurrect
        // or detach them.
        if node == &self.local {
            return RegistryDelta::default();
        }

        if self.is_stale(node, timestamp_us).await {
            trace!(node = %node, timestamp_us, "skipping stale contribution");
            return RegistryDelta::default();
        }

        let mut entries = self.entries.write().await;
        let mut delta = RegistryDelta::default();

        // Append phase: upsert every asserted edge.
        for (child_id, (spec, pid)) in &contribution.children {
            let entry = entries.entry(child_id.clone()).or_insert_with(|| RegistryEntry {
                spec: spec.clone(),
                locations: BTreeMap::new(),
            });
            if entry.locations.insert(node.clone(), *pid) != Some(*pid) {
                delta.added.push((child_id.clone(), node.clone(), *pid));
            }
        }

        // Detach phase: drop this node's edges absent from its contribution.
        let absent: Vec<ChildId> = entries
            .iter()
            .filter(|(cid, entry)| {
                entry.locations.contains_key(node) && !contribution.children.contains_key(*cid)
            })
            .map(|(cid, _)| cid.clone())
            .collect();

        for child_id in absent {
            if let Some(entry) = entries.get_mut(&child_id) {
                entry.locations.remove(node);
                delta.removed.push((child_id.clone(), node.clone()));
                if entry.locations.is_empty() {
                    entries.remove(&child_id);
                }
            }
        }

        drop(entries);
        self.advance_watermark(node, timestamp_us).await;

        if !delta.is_empty() {
            debug!(
                node = %node,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "applied remote contribution"
            );
        }
        delta
    }

    /// Upsert edges asserted by `node` (out-of-band registration propagate).
    pub async fn apply_edges(
        &self,
        node: &NodeId,
        children: &[(ChildSpec, Pid)],
        timestamp_us: u64,
    ) -> RegistryDelta {
        if node == &self.local || self.is_stale(node, timestamp_us).await {
            return RegistryDelta::default();
        }

        let mut entries = self.entries.write().await;
        let mut delta = RegistryDelta::default();

        for (spec, pid) in children {
            let entry = entries.entry(spec.id.clone()).or_insert_with(|| RegistryEntry {
                spec: spec.clone(),
                locations: BTreeMap::new(),
            });
            if entry.locations.insert(node.clone(), *pid) != Some(*pid) {
                delta.added.push((spec.id.clone(), node.clone(), *pid));
            }
        }

        drop(entries);
        self.advance_watermark(node, timestamp_us).await;
        delta
    }

    /// Remove edges asserted by `node` (out-of-band unregistration propagate).
    pub async fn remove_edges(
        &self,
        node: &NodeId,
        children: &[ChildId],
        timestamp_us: u64,
    ) -> RegistryDelta {
        if node == &self.local || self.is_stale(node, timestamp_us).await {
            return RegistryDelta::default();
        }

        let mut entries = self.entries.write().await;
        let mut delta = RegistryDelta::default();

        for child_id in children {
            if let Some(entry) = entries.get_mut(child_id) {
                if entry.locations.remove(node).is_some() {
                    delta.removed.push((child_id.clone(), node.clone()));
                    if entry.locations.is_empty() {
                        entries.remove(child_id);
                    }
                }
            }
        }

        drop(entries);
        self.advance_watermark(node, timestamp_us).await;
        delta
    }

    /// Drop every edge asserted by `node` and forget its watermark.
    ///
    /// Called on membership loss. Forgetting the watermark lets the node
    /// rejoin with a fresh clock.
    pub async fn detach_node(&self, node: &NodeId) -> RegistryDelta {
        let mut entries = self.entries.write().await;
        let mut delta = RegistryDelta::default();

        let affected: Vec<ChildId> = entries
            .iter()
            .filter(|(_, entry)| entry.locations.contains_key(node))
            .map(|(cid, _)| cid.clone())
            .collect();

        for child_id in affected {
            if let Some(entry) = entries.get_mut(&child_id) {
                entry.locations.remove(node);
                delta.removed.push((child_id.clone(), node.clone()));
                if entry.locations.is_empty() {
                    entries.remove(&child_id);
                }
            }
        }

        drop(entries);
        self.last_seen_us.write().await.remove(node);
        delta
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Full `child -> locations` map.
    pub async fn which_children(&self) -> BTreeMap<ChildId, BTreeMap<NodeId, Pid>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(cid, entry)| (cid.clone(), entry.locations.clone()))
            .collect()
    }

    /// Locations of one child, in node order.
    pub async fn lookup(&self, child_id: &ChildId) -> Vec<(NodeId, Pid)> {
        let entries = self.entries.read().await;
        entries
            .get(child_id)
            .map(|entry| {
                entry
                    .locations
                    .iter()
                    .map(|(n, p)| (n.clone(), *p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clone of one entry.
    pub async fn entry(&self, child_id: &ChildId) -> Option<RegistryEntry> {
        self.entries.read().await.get(child_id).cloned()
    }

    /// Specs of children with a replica on `node`.
    pub async fn children_on(&self, node: &NodeId) -> Vec<ChildSpec> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.locations.contains_key(node))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    /// Number of known children.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the registry knows no children.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    // =========================================================================
    // Staleness watermark
    // =========================================================================

    async fn is_stale(&self, node: &NodeId, timestamp_us: u64) -> bool {
        self.last_seen_us
            .read()
            .await
            .get(node)
            .is_some_and(|&last| timestamp_us < last)
    }

    async fn advance_watermark(&self, node: &NodeId, timestamp_us: u64) {
        let mut watermarks = self.last_seen_us.write().await;
        let entry = watermarks.entry(node.clone()).or_insert(0);
        *entry = (*entry).max(timestamp_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn spec(s: &str) -> ChildSpec {
        ChildSpec::bare(ChildId::new(s).unwrap())
    }

    fn cid(s: &str) -> ChildId {
        ChildId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_remove_local() {
        let registry = LocalRegistry::new(node("a"));

        let delta = registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();
        assert_eq!(delta.added.len(), 1);

        // Same edge again is a no-op.
        let delta = registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();
        assert!(delta.is_empty());

        let delta = registry.remove_local(&cid("w1")).await.unwrap();
        assert_eq!(delta.removed, vec![(cid("w1"), node("a"))]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_unknown_child_errors() {
        let registry = LocalRegistry::new(node("a"));
        assert!(matches!(
            registry.remove_local(&cid("nope")).await,
            Err(RegistryError::ChildUnknown { .. })
        ));
    }

    #[tokio::test]
    async fn test_spec_is_immutable_after_first_insert() {
        let registry = LocalRegistry::new(node("a"));
        registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();

        let other = ChildSpec::new(cid("w1"), Bytes::from_static(b"different"));
        assert!(matches!(
            registry.insert_local(other, Pid::new(2)).await,
            Err(RegistryError::SpecMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_own_snapshot_is_noop() {
        let registry = LocalRegistry::new(node("a"));
        registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();

        let snapshot = registry.local_snapshot().await;
        let delta = registry
            .apply_contribution(&node("a"), &snapshot, 10)
            .await;
        assert!(delta.is_empty());
        assert_eq!(registry.lookup(&cid("w1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_contribution_append_and_detach() {
        let registry = LocalRegistry::new(node("a"));

        let mut contribution = NodeContribution::new();
        contribution
            .children
            .insert(cid("w1"), (spec("w1"), Pid::new(10)));
        contribution
            .children
            .insert(cid("w2"), (spec("w2"), Pid::new(20)));

        let delta = registry
            .apply_contribution(&node("b"), &contribution, 100)
            .await;
        assert_eq!(delta.added.len(), 2);

        // Next contribution no longer asserts w2: its edge detaches.
        let mut next = NodeContribution::new();
        next.children.insert(cid("w1"), (spec("w1"), Pid::new(10)));

        let delta = registry.apply_contribution(&node("b"), &next, 200).await;
        assert_eq!(delta.removed, vec![(cid("w2"), node("b"))]);
        assert!(registry.lookup(&cid("w2")).await.is_empty());
        assert_eq!(registry.lookup(&cid("w1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_never_touches_other_nodes_edges() {
        let registry = LocalRegistry::new(node("a"));
        registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();

        let mut from_b = NodeContribution::new();
        from_b.children.insert(cid("w1"), (spec("w1"), Pid::new(2)));
        registry.apply_contribution(&node("b"), &from_b, 100).await;

        // b stops asserting w1; a's own edge must survive.
        let delta = registry
            .apply_contribution(&node("b"), &NodeContribution::new(), 200)
            .await;
        assert_eq!(delta.removed, vec![(cid("w1"), node("b"))]);

        let locations = registry.lookup(&cid("w1")).await;
        assert_eq!(locations, vec![(node("a"), Pid::new(1))]);
    }

    #[tokio::test]
    async fn test_stale_contribution_is_skipped() {
        let registry = LocalRegistry::new(node("a"));

        let mut fresh = NodeContribution::new();
        fresh.children.insert(cid("w1"), (spec("w1"), Pid::new(1)));
        registry.apply_contribution(&node("b"), &fresh, 200).await;

        // An older, empty contribution must not detach the edge.
        let delta = registry
            .apply_contribution(&node("b"), &NodeContribution::new(), 100)
            .await;
        assert!(delta.is_empty());
        assert_eq!(registry.lookup(&cid("w1")).await.len(), 1);

        // Equal timestamp is not older: applying is an idempotent no-op.
        let delta = registry.apply_contribution(&node("b"), &fresh, 200).await;
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn test_propagate_edges_roundtrip() {
        let registry = LocalRegistry::new(node("a"));

        let delta = registry
            .apply_edges(&node("b"), &[(spec("w1"), Pid::new(5))], 100)
            .await;
        assert_eq!(delta.added.len(), 1);

        let delta = registry.remove_edges(&node("b"), &[cid("w1")], 150).await;
        assert_eq!(delta.removed.len(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_propagate_advances_watermark_over_round() {
        let registry = LocalRegistry::new(node("a"));

        // Out-of-band add at t=300.
        registry
            .apply_edges(&node("b"), &[(spec("w1"), Pid::new(5))], 300)
            .await;

        // A round snapshot taken at t=200 (before the add) must not
        // detach the newer edge.
        let delta = registry
            .apply_contribution(&node("b"), &NodeContribution::new(), 200)
            .await;
        assert!(delta.is_empty());
        assert_eq!(registry.lookup(&cid("w1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_node_drops_all_edges_and_watermark() {
        let registry = LocalRegistry::new(node("a"));
        registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();

        let mut from_b = NodeContribution::new();
        from_b.children.insert(cid("w1"), (spec("w1"), Pid::new(2)));
        from_b.children.insert(cid("w2"), (spec("w2"), Pid::new(3)));
        registry.apply_contribution(&node("b"), &from_b, 500).await;

        let delta = registry.detach_node(&node("b")).await;
        assert_eq!(delta.removed.len(), 2);
        assert!(registry.lookup(&cid("w2")).await.is_empty());

        // Watermark was forgotten: a rejoining b with an earlier clock
        // is accepted again.
        let delta = registry.apply_contribution(&node("b"), &from_b, 10).await;
        assert_eq!(delta.added.len(), 2);
    }

    #[tokio::test]
    async fn test_which_children_and_children_on() {
        let registry = LocalRegistry::new(node("a"));
        registry.insert_local(spec("w1"), Pid::new(1)).await.unwrap();
        registry.insert_local(spec("w2"), Pid::new(2)).await.unwrap();

        let all = registry.which_children().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[&cid("w1")].len(), 1);

        let local_children = registry.children_on(&node("a")).await;
        assert_eq!(local_children.len(), 2);
    }
}

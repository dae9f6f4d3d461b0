//! Distribution strategies
//!
//! A distribution strategy is a pure function from
//! `(child_id, nodes, replication_factor)` to an ordered owner list.
//! Every node evaluates it against its own view snapshot, so the output
//! must be fully determined by the inputs: no randomness, no hidden
//! state. The first owner in the returned order is the redundancy
//! primary.

use crate::node::NodeId;
use processhub_core::child::ChildId;
use processhub_core::constants::HASH_RING_VNODES_COUNT;
use siphasher::sip::SipHasher24;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

/// Hash arbitrary bytes to a ring token with SipHash-2-4.
///
/// Default (zero) keys keep the function identical on every node.
fn hash_token(data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// Owner selection for one hub.
pub trait DistributionStrategy: Send + Sync {
    /// Return up to `replication_factor` distinct owners for `child_id`,
    /// primary first. Deterministic in all inputs.
    fn owners(
        &self,
        child_id: &ChildId,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Vec<NodeId>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

// =============================================================================
// Consistent hashing ring
// =============================================================================

/// Consistent-hash distribution.
///
/// Each node owns [`HASH_RING_VNODES_COUNT`] tokens; a child maps to the
/// first `replication_factor` distinct nodes encountered walking the
/// ring clockwise from `hash(child_id)`. Node churn only remaps the
/// departed node's token ranges.
///
/// The ring is rebuilt from the node list on every call. Clusters are
/// tens of nodes; rebuilding keeps the strategy stateless and trivially
/// deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashRingDistribution;

impl HashRingDistribution {
    /// Create a new ring distribution
    pub fn new() -> Self {
        Self
    }

    fn build_ring(nodes: &[NodeId]) -> BTreeMap<u64, NodeId> {
        let mut ring = BTreeMap::new();
        for node in nodes {
            for vnode in 0..HASH_RING_VNODES_COUNT {
                let token = hash_token(format!("{}:{}", node, vnode).as_bytes());
                // Token collisions resolve to the lexicographically first
                // node so both colliding parties agree.
                ring.entry(token)
                    .and_modify(|existing: &mut NodeId| {
                        if node < existing {
                            *existing = node.clone();
                        }
                    })
                    .or_insert_with(|| node.clone());
            }
        }
        ring
    }
}

impl DistributionStrategy for HashRingDistribution {
    fn owners(
        &self,
        child_id: &ChildId,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Vec<NodeId> {
        if nodes.is_empty() || replication_factor == 0 {
            return Vec::new();
        }

        let ring = Self::build_ring(nodes);
        let token = hash_token(child_id.as_str().as_bytes());
        let want = replication_factor.min(nodes.len());

        let mut owners: Vec<NodeId> = Vec::with_capacity(want);
        let clockwise = ring
            .range(token..)
            .chain(ring.range(..token))
            .map(|(_, node)| node);

        for node in clockwise {
            if !owners.contains(node) {
                owners.push(node.clone());
                if owners.len() == want {
                    break;
                }
            }
        }

        debug_assert_eq!(owners.len(), want);
        owners
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }
}

// =============================================================================
// Uniform distribution
// =============================================================================

/// Modulo-hash distribution: sorted node list, start index
/// `hash(child_id) % n`, owners taken consecutively.
///
/// Cheaper than the ring but reshuffles broadly on membership change;
/// useful when churn is rare and placement spread matters most.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformDistribution;

impl UniformDistribution {
    /// Create a new uniform distribution
    pub fn new() -> Self {
        Self
    }
}

impl DistributionStrategy for UniformDistribution {
    fn owners(
        &self,
        child_id: &ChildId,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Vec<NodeId> {
        if nodes.is_empty() || replication_factor == 0 {
            return Vec::new();
        }

        let mut sorted: Vec<NodeId> = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let n = sorted.len();
        let want = replication_factor.min(n);
        let start = (hash_token(child_id.as_str().as_bytes()) % n as u64) as usize;

        (0..want).map(|i| sorted[(start + i) % n].clone()).collect()
    }

    fn name(&self) -> &'static str {
        "uniform"
    }
}

// =============================================================================
// Guided distribution
// =============================================================================

/// Operator-pinned placement: an explicit child -> owners table,
/// filtered to nodes present in the live view. Children absent from the
/// table fall back to the ring.
#[derive(Debug, Clone, Default)]
pub struct GuidedDistribution {
    table: HashMap<ChildId, Vec<NodeId>>,
    fallback: HashRingDistribution,
}

impl GuidedDistribution {
    /// Create a guided distribution from a placement table
    pub fn new(table: HashMap<ChildId, Vec<NodeId>>) -> Self {
        Self {
            table,
            fallback: HashRingDistribution::new(),
        }
    }
}

impl DistributionStrategy for GuidedDistribution {
    fn owners(
        &self,
        child_id: &ChildId,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Vec<NodeId> {
        match self.table.get(child_id) {
            Some(pinned) => pinned
                .iter()
                .filter(|n| nodes.contains(n))
                .take(replication_factor)
                .cloned()
                .collect(),
            None => self.fallback.owners(child_id, nodes, replication_factor),
        }
    }

    fn name(&self) -> &'static str {
        "guided"
    }
}

//! Cluster view
//!
//! Authoritative list of reachable peers for one hub, fed by the node
//! connectivity layer. Reads are snapshots; membership may change
//! between a read and any use of its result, and consumers must
//! tolerate that.

use crate::node::NodeId;
use processhub_core::constants::CLUSTER_NODES_COUNT_MAX;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// Capacity of the membership event channel
const MEMBERSHIP_EVENTS_BUFFER: usize = 256;

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node became reachable
    Joined(NodeId),
    /// A node became unreachable or left
    Left(NodeId),
}

/// Per-hub view of cluster membership
///
/// The local node is always a member of its own view. Peers are kept in
/// a `BTreeSet` so every snapshot comes out in the cluster-wide
/// lexicographic order.
pub struct ClusterView {
    local: NodeId,
    peers: RwLock<BTreeSet<NodeId>>,
    events_tx: broadcast::Sender<MembershipEvent>,
}

impl ClusterView {
    /// Create a view containing only the local node
    pub fn new(local: NodeId) -> Self {
        let (events_tx, _) = broadcast::channel(MEMBERSHIP_EVENTS_BUFFER);
        Self {
            local,
            peers: RwLock::new(BTreeSet::new()),
            events_tx,
        }
    }

    /// The local node's id
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Snapshot of current members in lexicographic order
    ///
    /// `include_local` controls whether the local node appears in the
    /// result.
    pub async fn nodes(&self, include_local: bool) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut nodes: Vec<NodeId> = peers.iter().cloned().collect();
        if include_local {
            nodes.push(self.local.clone());
            nodes.sort();
        }
        nodes
    }

    /// Number of members including the local node
    pub async fn len(&self) -> usize {
        self.peers.read().await.len() + 1
    }

    /// Whether `node` is currently a member (the local node always is)
    pub async fn is_member(&self, node: &NodeId) -> bool {
        if node == &self.local {
            return true;
        }
        self.peers.read().await.contains(node)
    }

    /// Record a peer joining. Returns false if it was already present.
    pub async fn node_joined(&self, node: NodeId) -> bool {
        if node == self.local {
            return false;
        }

        let inserted = {
            let mut peers = self.peers.write().await;
            debug_assert!(peers.len() < CLUSTER_NODES_COUNT_MAX);
            peers.insert(node.clone())
        };

        if inserted {
            info!(node = %node, "node joined cluster view");
            let _ = self.events_tx.send(MembershipEvent::Joined(node));
        }
        inserted
    }

    /// Record a peer leaving. Returns false if it was not present.
    pub async fn node_left(&self, node: &NodeId) -> bool {
        let removed = self.peers.write().await.remove(node);
        if removed {
            info!(node = %node, "node left cluster view");
            let _ = self.events_tx.send(MembershipEvent::Left(node.clone()));
        }
        removed
    }

    /// Subscribe to membership events
    ///
    /// Events emitted before the subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_view_contains_local() {
        let view = ClusterView::new(node("b"));
        assert!(view.is_member(&node("b")).await);
        assert_eq!(view.nodes(true).await, vec![node("b")]);
        assert!(view.nodes(false).await.is_empty());
        assert_eq!(view.len().await, 1);
    }

    #[tokio::test]
    async fn test_join_and_leave_ordering() {
        let view = ClusterView::new(node("b"));
        assert!(view.node_joined(node("c")).await);
        assert!(view.node_joined(node("a")).await);
        // Duplicate join is a no-op.
        assert!(!view.node_joined(node("c")).await);

        assert_eq!(
            view.nodes(true).await,
            vec![node("a"), node("b"), node("c")]
        );

        assert!(view.node_left(&node("c")).await);
        assert!(!view.node_left(&node("c")).await);
        assert_eq!(view.nodes(true).await, vec![node("a"), node("b")]);
    }

    #[tokio::test]
    async fn test_local_join_is_ignored() {
        let view = ClusterView::new(node("b"));
        assert!(!view.node_joined(node("b")).await);
        assert_eq!(view.len().await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let view = ClusterView::new(node("a"));
        let mut events = view.subscribe();

        view.node_joined(node("b")).await;
        view.node_left(&node("b")).await;

        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Joined(node("b")));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(node("b")));
    }
}

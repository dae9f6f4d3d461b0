//! Gossip synchronizer
//!
//! Periodic epidemic diffusion of registry snapshots. A round carries a
//! unique ref, per-node contributions with their origin timestamps, and
//! the set of nodes that already applied the merged data. Rounds give no
//! individual guarantee; convergence follows from periodic re-initiation
//! and last-writer-wins merges per contributing node.
//!
//! Out-of-band `propagate` messages diffuse single add/remove mutations
//! between rounds so registrations reach the cluster without waiting for
//! the next round.

use crate::config::SyncConfig;
use crate::error::HubResult;
use crate::rpc::{HubMessage, Transport};
use processhub_core::child::{ChildId, ChildSpec, HubId, Pid};
use processhub_core::io::IoContext;
use processhub_registry::{ClusterView, LocalRegistry, NodeContribution, NodeId, RegistryDelta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

// =============================================================================
// Wire types
// =============================================================================

/// Round token, unique to its originator.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct GossipRef {
    /// Node that minted the ref
    pub origin: NodeId,
    /// Originator-local sequence number
    pub seq: u64,
}

impl fmt::Display for GossipRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.seq)
    }
}

/// One node's contribution stamped with its own clock (microseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedContribution {
    /// The contributing node's self-asserted projection
    pub data: NodeContribution,
    /// Microsecond timestamp from the contributing node's clock
    pub timestamp_us: u64,
}

/// A sync round in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRound {
    /// Round token
    pub gossip_ref: GossipRef,
    /// Contributions assembled so far
    pub nodes_data: BTreeMap<NodeId, TimestampedContribution>,
    /// Nodes that have applied `nodes_data` locally
    pub sync_acks: BTreeSet<NodeId>,
}

/// Out-of-band registry mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PropagateOp {
    /// Upsert these replicas of the update node
    Add { children: Vec<(ChildSpec, Pid)> },
    /// Remove the update node's replicas of these children
    Rem { children: Vec<ChildId> },
}

/// A propagate message in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateRound {
    /// Round token
    pub gossip_ref: GossipRef,
    /// Nodes that have applied the mutation
    pub acks: BTreeSet<NodeId>,
    /// Node whose edges the mutation concerns
    pub update_node: NodeId,
    /// Microsecond timestamp from the update node's clock
    pub timestamp_us: u64,
    /// The mutation itself
    pub op: PropagateOp,
}

// =============================================================================
// Ref cache
// =============================================================================

/// Lifecycle of one ref in the local memo cache.
#[derive(Debug, Clone)]
enum RefState {
    /// Sync round awaiting full node coverage or full acks
    SyncCached {
        round: SyncRound,
        cached_at_us: u64,
    },
    /// Propagate already applied here; acks tracked for forwarding
    PropagateSeen {
        acks: BTreeSet<NodeId>,
        cached_at_us: u64,
    },
    /// Consumed; late echoes drop silently
    Invalidated { at_us: u64 },
}

impl RefState {
    fn cached_at_us(&self) -> u64 {
        match self {
            Self::SyncCached { cached_at_us, .. } | Self::PropagateSeen { cached_at_us, .. } => {
                *cached_at_us
            }
            Self::Invalidated { at_us } => *at_us,
        }
    }
}

/// Counters over the synchronizer's lifetime.
#[derive(Debug, Default)]
struct GossipCounters {
    rounds_initiated: AtomicU64,
    refs_invalidated: AtomicU64,
    late_echoes_dropped: AtomicU64,
    forwards_sent: AtomicU64,
}

/// Snapshot of gossip counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipStats {
    /// Rounds this node initiated
    pub rounds_initiated: u64,
    /// Refs this node marked invalidated
    pub refs_invalidated: u64,
    /// Messages dropped because their ref was already consumed
    pub late_echoes_dropped: u64,
    /// Forwarded gossip messages
    pub forwards_sent: u64,
}

// =============================================================================
// GossipSync
// =============================================================================

/// Per-hub gossip synchronizer.
pub struct GossipSync<T: Transport> {
    hub_id: HubId,
    view: Arc<ClusterView>,
    registry: Arc<LocalRegistry>,
    transport: Arc<T>,
    config: SyncConfig,
    io: IoContext,
    refs: Mutex<HashMap<GossipRef, RefState>>,
    seq: AtomicU64,
    counters: GossipCounters,
}

impl<T: Transport> GossipSync<T> {
    /// Create a synchronizer for one hub
    pub fn new(
        hub_id: HubId,
        view: Arc<ClusterView>,
        registry: Arc<LocalRegistry>,
        transport: Arc<T>,
        config: SyncConfig,
        io: IoContext,
    ) -> Self {
        Self {
            hub_id,
            view,
            registry,
            transport,
            config,
            io,
            refs: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            counters: GossipCounters::default(),
        }
    }

    fn mint_ref(&self) -> GossipRef {
        GossipRef {
            origin: self.view.local().clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> GossipStats {
        GossipStats {
            rounds_initiated: self.counters.rounds_initiated.load(Ordering::Relaxed),
            refs_invalidated: self.counters.refs_invalidated.load(Ordering::Relaxed),
            late_echoes_dropped: self.counters.late_echoes_dropped.load(Ordering::Relaxed),
            forwards_sent: self.counters.forwards_sent.load(Ordering::Relaxed),
        }
    }

    /// Pick up to `count` random distinct targets.
    fn sample(&self, mut candidates: Vec<NodeId>, count: usize) -> Vec<NodeId> {
        if candidates.len() <= count {
            return candidates;
        }
        // Partial Fisher-Yates driven by the injected RNG.
        for i in 0..count {
            let j = i + self.io.rng.gen_index(candidates.len() - i);
            candidates.swap(i, j);
        }
        candidates.truncate(count);
        candidates
    }

    /// Best-effort fanout send; unreachable targets are repaired by a
    /// later round, never retried here.
    async fn fan_out(&self, targets: &[NodeId], message: HubMessage) {
        for target in targets {
            match self.transport.send(target, message.clone()).await {
                Ok(()) => {
                    self.counters.forwards_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(target = %target, error = %e, "gossip send failed"),
            }
        }
    }

    // =========================================================================
    // Round initiation
    // =========================================================================

    /// Initiate a sync round if this node is eligible.
    ///
    /// With `restricted_init`, only the first node in the current view's
    /// sort order initiates; otherwise every node does.
    pub async fn maybe_initiate(&self) -> HubResult<()> {
        let members = self.view.nodes(true).await;
        if members.len() < 2 {
            return Ok(());
        }

        let local = self.view.local();
        if self.config.restricted_init && members.first() != Some(local) {
            return Ok(());
        }

        let now_us = self.io.time.now_us();
        let gossip_ref = self.mint_ref();
        let snapshot = self.registry.local_snapshot().await;

        let mut nodes_data = BTreeMap::new();
        nodes_data.insert(
            local.clone(),
            TimestampedContribution {
                data: snapshot,
                timestamp_us: now_us,
            },
        );

        let round = SyncRound {
            gossip_ref: gossip_ref.clone(),
            nodes_data,
            sync_acks: BTreeSet::new(),
        };

        self.refs.lock().await.insert(
            gossip_ref.clone(),
            RefState::SyncCached {
                round: round.clone(),
                cached_at_us: now_us,
            },
        );
        self.counters.rounds_initiated.fetch_add(1, Ordering::Relaxed);

        let peers: Vec<NodeId> = members.into_iter().filter(|n| n != local).collect();
        let targets = self.sample(peers, self.config.fanout);
        trace!(gossip_ref = %gossip_ref, targets = targets.len(), "initiating sync round");

        self.fan_out(
            &targets,
            HubMessage::Sync {
                hub_id: self.hub_id.clone(),
                round,
            },
        )
        .await;
        Ok(())
    }

    // =========================================================================
    // Sync rounds
    // =========================================================================

    /// Handle an incoming sync round.
    ///
    /// Returns the registry delta produced if this node applied the
    /// merged data (empty otherwise).
    pub async fn handle_sync(&self, from: &NodeId, incoming: SyncRound) -> HubResult<RegistryDelta> {
        let now_us = self.io.time.now_us();
        let local = self.view.local().clone();
        let members: BTreeSet<NodeId> = self.view.nodes(true).await.into_iter().collect();
        let gossip_ref = incoming.gossip_ref.clone();

        let mut refs = self.refs.lock().await;

        // Merge with whatever we already hold for this ref.
        let (mut nodes_data, mut sync_acks) = match refs.get(&gossip_ref) {
            Some(RefState::Invalidated { .. }) => {
                trace!(gossip_ref = %gossip_ref, from = %from, "dropping late sync echo");
                self.counters
                    .late_echoes_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(RegistryDelta::default());
            }
            Some(RefState::SyncCached { round: cached, .. }) => {
                let mut merged = cached.nodes_data.clone();
                for (node, contribution) in incoming.nodes_data {
                    match merged.get(&node) {
                        Some(existing) if existing.timestamp_us >= contribution.timestamp_us => {}
                        _ => {
                            merged.insert(node, contribution);
                        }
                    }
                }
                let mut acks = cached.sync_acks.clone();
                acks.extend(incoming.sync_acks);
                (merged, acks)
            }
            Some(RefState::PropagateSeen { .. }) => {
                warn!(gossip_ref = %gossip_ref, "sync round reusing a propagate ref");
                (incoming.nodes_data, incoming.sync_acks)
            }
            None => (incoming.nodes_data, incoming.sync_acks),
        };

        // Contribute our own snapshot if this round has not seen it.
        if !nodes_data.contains_key(&local) {
            nodes_data.insert(
                local.clone(),
                TimestampedContribution {
                    data: self.registry.local_snapshot().await,
                    timestamp_us: now_us,
                },
            );
        }

        let missing: Vec<NodeId> = members
            .iter()
            .filter(|n| !nodes_data.contains_key(*n))
            .cloned()
            .collect();

        if !missing.is_empty() {
            // Coverage incomplete: forward toward the missing nodes and
            // hold the data; do not apply yet.
            let round = SyncRound {
                gossip_ref: gossip_ref.clone(),
                nodes_data,
                sync_acks,
            };
            refs.insert(
                gossip_ref.clone(),
                RefState::SyncCached {
                    round: round.clone(),
                    cached_at_us: now_us,
                },
            );
            drop(refs);

            let targets = self.sample(missing, self.config.fanout);
            trace!(gossip_ref = %gossip_ref, targets = targets.len(), "forwarding incomplete round");
            self.fan_out(
                &targets,
                HubMessage::Sync {
                    hub_id: self.hub_id.clone(),
                    round,
                },
            )
            .await;
            return Ok(RegistryDelta::default());
        }

        // Full coverage: apply once, then chase unacked nodes.
        let mut delta = RegistryDelta::default();
        if !sync_acks.contains(&local) {
            for (node, contribution) in &nodes_data {
                delta.extend(
                    self.registry
                        .apply_contribution(node, &contribution.data, contribution.timestamp_us)
                        .await,
                );
            }
            sync_acks.insert(local.clone());
        }

        let unacked: Vec<NodeId> = members
            .iter()
            .filter(|n| !sync_acks.contains(*n))
            .cloned()
            .collect();

        if unacked.is_empty() {
            debug!(gossip_ref = %gossip_ref, "sync round complete");
            refs.insert(gossip_ref, RefState::Invalidated { at_us: now_us });
            self.counters.refs_invalidated.fetch_add(1, Ordering::Relaxed);
            drop(refs);
        } else {
            let round = SyncRound {
                gossip_ref: gossip_ref.clone(),
                nodes_data,
                sync_acks,
            };
            refs.insert(
                gossip_ref.clone(),
                RefState::SyncCached {
                    round: round.clone(),
                    cached_at_us: now_us,
                },
            );
            drop(refs);

            let targets = self.sample(unacked, self.config.fanout);
            self.fan_out(
                &targets,
                HubMessage::Sync {
                    hub_id: self.hub_id.clone(),
                    round,
                },
            )
            .await;
        }

        Ok(delta)
    }

    // =========================================================================
    // Out-of-band propagation
    // =========================================================================

    /// Diffuse a local registry mutation without waiting for the next
    /// round. The local registry must already reflect the mutation.
    pub async fn propagate(&self, op: PropagateOp) -> HubResult<()> {
        let members = self.view.nodes(true).await;
        if members.len() < 2 {
            return Ok(());
        }

        let local = self.view.local().clone();
        let now_us = self.io.time.now_us();
        let gossip_ref = self.mint_ref();

        let mut acks = BTreeSet::new();
        acks.insert(local.clone());

        let round = PropagateRound {
            gossip_ref: gossip_ref.clone(),
            acks: acks.clone(),
            update_node: local.clone(),
            timestamp_us: now_us,
            op,
        };

        self.refs.lock().await.insert(
            gossip_ref,
            RefState::PropagateSeen {
                acks,
                cached_at_us: now_us,
            },
        );

        let peers: Vec<NodeId> = members.into_iter().filter(|n| n != &local).collect();
        let targets = self.sample(peers, self.config.fanout);
        self.fan_out(
            &targets,
            HubMessage::Propagate {
                hub_id: self.hub_id.clone(),
                round,
            },
        )
        .await;
        Ok(())
    }

    /// Handle an incoming propagate message.
    ///
    /// The mutation is applied at most once per ref; repeats only merge
    /// ack sets.
    pub async fn handle_propagate(
        &self,
        from: &NodeId,
        incoming: PropagateRound,
    ) -> HubResult<RegistryDelta> {
        let now_us = self.io.time.now_us();
        let local = self.view.local().clone();
        let members: BTreeSet<NodeId> = self.view.nodes(true).await.into_iter().collect();
        let gossip_ref = incoming.gossip_ref.clone();

        let mut refs = self.refs.lock().await;

        let (mut acks, first_sighting) = match refs.get(&gossip_ref) {
            Some(RefState::Invalidated { .. }) => {
                trace!(gossip_ref = %gossip_ref, from = %from, "dropping late propagate echo");
                self.counters
                    .late_echoes_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(RegistryDelta::default());
            }
            Some(RefState::PropagateSeen { acks: cached, .. }) => {
                let mut merged = cached.clone();
                merged.extend(incoming.acks.iter().cloned());
                (merged, false)
            }
            Some(RefState::SyncCached { .. }) => {
                warn!(gossip_ref = %gossip_ref, "propagate reusing a sync ref");
                (incoming.acks.clone(), true)
            }
            None => (incoming.acks.clone(), true),
        };

        let mut delta = RegistryDelta::default();
        if first_sighting {
            delta = match &incoming.op {
                PropagateOp::Add { children } => {
                    self.registry
                        .apply_edges(&incoming.update_node, children, incoming.timestamp_us)
                        .await
                }
                PropagateOp::Rem { children } => {
                    self.registry
                        .remove_edges(&incoming.update_node, children, incoming.timestamp_us)
                        .await
                }
            };
        }
        acks.insert(local);

        let unacked: Vec<NodeId> = members
            .iter()
            .filter(|n| !acks.contains(*n))
            .cloned()
            .collect();

        if unacked.is_empty() {
            refs.insert(gossip_ref, RefState::Invalidated { at_us: now_us });
            self.counters.refs_invalidated.fetch_add(1, Ordering::Relaxed);
            drop(refs);
        } else {
            refs.insert(
                gossip_ref.clone(),
                RefState::PropagateSeen {
                    acks: acks.clone(),
                    cached_at_us: now_us,
                },
            );
            drop(refs);

            let round = PropagateRound {
                gossip_ref,
                acks,
                update_node: incoming.update_node,
                timestamp_us: incoming.timestamp_us,
                op: incoming.op,
            };
            let targets = self.sample(unacked, self.config.fanout);
            self.fan_out(
                &targets,
                HubMessage::Propagate {
                    hub_id: self.hub_id.clone(),
                    round,
                },
            )
            .await;
        }

        Ok(delta)
    }

    // =========================================================================
    // Ref expiry
    // =========================================================================

    /// Expire refs older than one sync interval.
    ///
    /// Live entries become invalidated (suppressing late echoes);
    /// entries invalidated for a further interval are dropped entirely.
    pub async fn purge_expired(&self) {
        let now_us = self.io.time.now_us();
        let ttl_us = self.config.sync_interval_ms.saturating_mul(1000);
        let mut refs = self.refs.lock().await;
        let mut invalidated = 0u64;

        refs.retain(|_, state| {
            now_us.saturating_sub(state.cached_at_us()) <= ttl_us.saturating_mul(2)
        });

        for state in refs.values_mut() {
            let expired = now_us.saturating_sub(state.cached_at_us()) > ttl_us;
            if expired && !matches!(state, RefState::Invalidated { .. }) {
                *state = RefState::Invalidated { at_us: now_us };
                invalidated += 1;
            }
        }

        if invalidated > 0 {
            debug!(count = invalidated, "invalidated expired gossip refs");
            self.counters
                .refs_invalidated
                .fetch_add(invalidated, Ordering::Relaxed);
        }
    }

    /// Number of refs currently tracked (for tests and introspection)
    pub async fn tracked_refs(&self) -> usize {
        self.refs.lock().await.len()
    }
}

//! Hub coordinator
//!
//! One coordinator per hub reacts to membership changes, serves incoming
//! hub messages, drives gossip initiation, and dispatches hooks. It is
//! the only writer of the hub's registry; every other component reads
//! snapshots.

use crate::error::{HubError, HubResult};
use crate::gossip::{GossipSync, PropagateOp};
use crate::hooks::{HookEvent, HookRegistry};
use crate::migration::HotSwapMigrator;
use crate::rpc::{next_request_id, ChildStartOutcome, HubMessage, Transport, TransportHandler};
use crate::supervisor::ChildSupervisor;
use async_trait::async_trait;
use processhub_core::child::{ChildId, ChildSpec, HubId};
use processhub_core::worker::WorkerMsg;
use processhub_registry::{
    ClusterView, DistributionStrategy, LocalRegistry, NodeId, RedundancyStrategy, RegistryDelta,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-hub orchestrator.
pub struct HubCoordinator<T: Transport> {
    pub(crate) hub_id: HubId,
    pub(crate) view: Arc<ClusterView>,
    pub(crate) registry: Arc<LocalRegistry>,
    pub(crate) supervisor: Arc<dyn ChildSupervisor>,
    pub(crate) transport: Arc<T>,
    pub(crate) gossip: GossipSync<T>,
    pub(crate) migrator: HotSwapMigrator<T>,
    pub(crate) distribution: Arc<dyn DistributionStrategy>,
    pub(crate) redundancy: RedundancyStrategy,
    pub(crate) hooks: Arc<HookRegistry>,
    start_timeout: Duration,
}

impl<T: Transport + 'static> HubCoordinator<T> {
    /// Wire up a coordinator from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub_id: HubId,
        view: Arc<ClusterView>,
        registry: Arc<LocalRegistry>,
        supervisor: Arc<dyn ChildSupervisor>,
        transport: Arc<T>,
        gossip: GossipSync<T>,
        migrator: HotSwapMigrator<T>,
        distribution: Arc<dyn DistributionStrategy>,
        redundancy: RedundancyStrategy,
        hooks: Arc<HookRegistry>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            hub_id,
            view,
            registry,
            supervisor,
            transport,
            gossip,
            migrator,
            distribution,
            redundancy,
            hooks,
            start_timeout,
        }
    }

    // =========================================================================
    // Local child lifecycle
    // =========================================================================

    /// Start a child on this node, register it, and diffuse the edge.
    ///
    /// If a handed-over state is pending for the child it is delivered
    /// to the fresh worker before anything else.
    pub async fn start_local(&self, spec: &ChildSpec) -> HubResult<ChildStartOutcome> {
        let outcome = self.supervisor.start_child(spec).await?;
        let delta = self.registry.insert_local(spec.clone(), outcome.pid()).await?;

        if let Some(state) = self.migrator.take_pending(&spec.id).await {
            debug!(child_id = %spec.id, "delivering pending handover state");
            if let Some(worker) = self.supervisor.worker(&spec.id).await {
                worker.send(WorkerMsg::Handover { state }).await;
            }
        }

        if !delta.is_empty() {
            self.gossip
                .propagate(PropagateOp::Add {
                    children: vec![(spec.clone(), outcome.pid())],
                })
                .await?;
            self.hooks
                .dispatch(HookEvent::ChildStarted {
                    child_id: spec.id.clone(),
                    node: self.view.local().clone(),
                })
                .await;
            self.post_update(&delta).await;
        }

        Ok(outcome)
    }

    /// Terminate a local child, unregister it, and diffuse the removal.
    pub async fn stop_local(&self, child_id: &ChildId) -> HubResult<()> {
        self.supervisor.terminate_child(child_id).await?;
        let delta = self.registry.remove_local(child_id).await?;

        self.gossip
            .propagate(PropagateOp::Rem {
                children: vec![child_id.clone()],
            })
            .await?;
        self.hooks
            .dispatch(HookEvent::ChildStopped {
                child_id: child_id.clone(),
                node: self.view.local().clone(),
            })
            .await;
        self.post_update(&delta).await;
        Ok(())
    }

    // =========================================================================
    // Redundancy dispatch
    // =========================================================================

    /// React to a locations change: recompute replica modes and signal
    /// the local replica's worker. Remote replicas are signaled by their
    /// own node when the same delta reaches it through gossip.
    pub async fn post_update(&self, delta: &RegistryDelta) {
        if delta.is_empty() {
            return;
        }

        let members = self.view.nodes(true).await;
        let local = self.view.local();

        for child_id in delta.changed_children() {
            let Some(entry) = self.registry.entry(&child_id).await else {
                continue;
            };
            let owners = self.distribution.owners(
                &child_id,
                &members,
                self.redundancy.replication_factor(),
            );

            for (node, _pid, mode) in self.redundancy.assign_modes(&owners, &entry.locations) {
                if &node != local {
                    continue;
                }
                if let Some(worker) = self.supervisor.worker(&child_id).await {
                    worker.send(WorkerMsg::RedundancySignal { mode }).await;
                }
                self.hooks
                    .dispatch(HookEvent::RedundancySignal {
                        child_id: child_id.clone(),
                        mode,
                    })
                    .await;
            }
        }
    }

    // =========================================================================
    // Membership events
    // =========================================================================

    /// Handle a node joining: extend the view, then realize the new
    /// placement. Children whose ownership moved entirely to the joined
    /// node hot-swap toward it; children it now co-owns with us gain a
    /// replica there without losing the local one.
    pub async fn on_node_joined(&self, joined: NodeId) -> HubResult<()> {
        if !self.view.node_joined(joined.clone()).await {
            return Ok(());
        }
        info!(node = %joined, "handling cluster join");
        self.hooks
            .dispatch(HookEvent::ClusterJoin {
                node: joined.clone(),
            })
            .await;

        let members = self.view.nodes(true).await;
        let local = self.view.local().clone();
        let replication_factor = self.redundancy.replication_factor();

        let mut to_migrate = Vec::new();
        let mut to_replicate = Vec::new();
        for spec in self.registry.children_on(&local).await {
            let owners = self
                .distribution
                .owners(&spec.id, &members, replication_factor);
            if !owners.contains(&joined) {
                continue;
            }
            if owners.contains(&local) {
                to_replicate.push(spec);
            } else {
                to_migrate.push(spec);
            }
        }

        // Replica additions keep the local replica alive.
        for spec in to_replicate {
            let request = HubMessage::StartChildReq {
                hub_id: self.hub_id.clone(),
                request_id: next_request_id(),
                spec: spec.clone(),
                reply_to: local.clone(),
            };
            match self
                .transport
                .send_and_recv(&joined, request, self.start_timeout)
                .await
            {
                Ok(HubMessage::ChildStartResp { result: Ok(_), .. }) => {
                    debug!(child_id = %spec.id, node = %joined, "replica added on joined node");
                }
                Ok(HubMessage::ChildStartResp {
                    result: Err(reason),
                    ..
                }) => warn!(child_id = %spec.id, node = %joined, reason = %reason, "replica add failed"),
                Ok(other) => warn!(child_id = %spec.id, "unexpected response: {:?}", other),
                Err(e) => warn!(child_id = %spec.id, node = %joined, error = %e, "replica add failed"),
            }
        }

        if !to_migrate.is_empty() {
            let outcome = self.migrator.migrate_batch(to_migrate, &joined).await?;
            if !outcome.migrated.is_empty() {
                let mut delta = RegistryDelta::default();
                for child_id in &outcome.migrated {
                    match self.registry.remove_local(child_id).await {
                        Ok(d) => delta.extend(d),
                        Err(e) => debug!(child_id = %child_id, error = %e, "unregister after migration"),
                    }
                }
                self.gossip
                    .propagate(PropagateOp::Rem {
                        children: outcome.migrated.clone(),
                    })
                    .await?;
                self.hooks
                    .dispatch(HookEvent::ChildrenMigrated {
                        children: outcome.migrated,
                        target: joined,
                    })
                    .await;
                self.post_update(&delta).await;
            }
        }

        Ok(())
    }

    /// Handle a node leaving: drop its edges, then adopt every orphaned
    /// child this node now owns, consulting the pending-handover buffer
    /// for shipped state.
    pub async fn on_node_left(&self, left: &NodeId) -> HubResult<()> {
        let orphaned = self.registry.children_on(left).await;
        if !self.view.node_left(left).await {
            return Ok(());
        }
        info!(node = %left, orphaned = orphaned.len(), "handling cluster leave");
        self.hooks
            .dispatch(HookEvent::ClusterLeave { node: left.clone() })
            .await;

        let delta = self.registry.detach_node(left).await;
        self.post_update(&delta).await;

        let members = self.view.nodes(true).await;
        let local = self.view.local().clone();
        let replication_factor = self.redundancy.replication_factor();

        for spec in orphaned {
            let owners = self
                .distribution
                .owners(&spec.id, &members, replication_factor);
            if !owners.contains(&local) {
                continue;
            }
            let hosted_here = self
                .registry
                .lookup(&spec.id)
                .await
                .iter()
                .any(|(node, _)| node == &local);
            if hosted_here {
                continue;
            }
            if let Err(e) = self.start_local(&spec).await {
                warn!(child_id = %spec.id, error = %e, "failed to adopt orphaned child");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Periodic work
    // =========================================================================

    /// One gossip tick: expire stale refs and settled migration
    /// records, then initiate if eligible.
    pub async fn gossip_tick(&self) {
        self.gossip.purge_expired().await;
        self.migrator.cleanup_records().await;
        if let Err(e) = self.gossip.maybe_initiate().await {
            warn!(error = %e, "gossip initiation failed");
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> TransportHandler for HubCoordinator<T> {
    async fn handle(&self, from: &NodeId, message: HubMessage) -> Option<HubMessage> {
        if message.hub_id() != &self.hub_id {
            warn!(
                from = %from,
                theirs = %message.hub_id(),
                ours = %self.hub_id,
                "dropping message for foreign hub"
            );
            return None;
        }

        match message {
            HubMessage::Sync { round, .. } => {
                match self.gossip.handle_sync(from, round).await {
                    Ok(delta) => self.post_update(&delta).await,
                    Err(e) => warn!(from = %from, error = %e, "sync handling failed"),
                }
                None
            }

            HubMessage::Propagate { round, .. } => {
                match self.gossip.handle_propagate(from, round).await {
                    Ok(delta) => self.post_update(&delta).await,
                    Err(e) => warn!(from = %from, error = %e, "propagate handling failed"),
                }
                None
            }

            HubMessage::StartChildReq {
                request_id, spec, ..
            } => {
                let child_id = spec.id.clone();
                let result = self
                    .start_local(&spec)
                    .await
                    .map_err(|e| e.to_string());
                Some(HubMessage::ChildStartResp {
                    hub_id: self.hub_id.clone(),
                    request_id,
                    child_id,
                    result,
                })
            }

            HubMessage::HandoverShip { states, .. } => {
                let mut to_buffer = Vec::new();
                for (child_id, state) in states {
                    match self.supervisor.worker(&child_id).await {
                        Some(worker) => {
                            debug!(child_id = %child_id, "delivering shipped state to running worker");
                            worker.send(WorkerMsg::Handover { state }).await;
                        }
                        None => to_buffer.push((child_id, state)),
                    }
                }
                if !to_buffer.is_empty() {
                    self.migrator.buffer_states(to_buffer).await;
                }
                None
            }

            HubMessage::TerminateChild { child_id, .. } => {
                if let Err(e) = self.stop_local(&child_id).await {
                    debug!(child_id = %child_id, error = %e, "remote terminate request");
                }
                None
            }

            HubMessage::ChildStartResp { .. } => {
                warn!(from = %from, "received response message in handler");
                None
            }
        }
    }
}

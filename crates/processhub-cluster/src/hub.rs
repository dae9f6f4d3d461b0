//! Hub: the public face of one ProcessHub instance
//!
//! A hub owns its coordinator, drives the periodic gossip tick, and
//! exposes the host-application API: child lifecycle, registry reads,
//! membership feed, and hook registration. One node must not start the
//! same hub twice; a duplicate aborts startup.

use crate::config::HubConfig;
use crate::coordinator::HubCoordinator;
use crate::error::{HubError, HubResult};
use crate::gossip::GossipSync;
use crate::hooks::{Hook, HookCallback, HookRegistry};
use crate::migration::HotSwapMigrator;
use crate::rpc::{next_request_id, HubMessage, Transport};
use crate::supervisor::ChildSupervisor;
use processhub_core::child::{ChildId, ChildSpec, HubId, Pid};
use processhub_core::io::IoContext;
use processhub_registry::{
    ClusterView, LocalRegistry, NodeId, RedundancyStrategy, RegistryEntry,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Process-wide hub id claims
// =============================================================================

fn active_hubs() -> &'static StdMutex<HashSet<String>> {
    static ACTIVE: OnceLock<StdMutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| StdMutex::new(HashSet::new()))
}

// A hub is identified by (hub_id, node): the same hub may span many
// nodes hosted in one process, but one node must not start it twice.
fn hub_claim_key(hub_id: &HubId, node: &NodeId) -> String {
    format!("{}@{}", hub_id, node)
}

fn claim_hub_id(hub_id: &HubId, node: &NodeId) -> HubResult<()> {
    let mut hubs = active_hubs().lock().expect("hub id registry poisoned");
    if !hubs.insert(hub_claim_key(hub_id, node)) {
        return Err(HubError::HubAlreadyStarted {
            hub_id: hub_id.to_string(),
        });
    }
    Ok(())
}

fn release_hub_id(hub_id: &HubId, node: &NodeId) {
    if let Ok(mut hubs) = active_hubs().lock() {
        hubs.remove(&hub_claim_key(hub_id, node));
    }
}

// =============================================================================
// Hub lifecycle and reports
// =============================================================================

/// Hub lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Hub not started
    Stopped,
    /// Hub is initializing
    Initializing,
    /// Hub is running
    Running,
    /// Hub is shutting down
    ShuttingDown,
}

/// Per-child outcome of `start_children`
#[derive(Debug, Clone)]
pub struct ChildStartReport {
    /// The child this report concerns
    pub child_id: ChildId,
    /// Owners on which a replica is now running
    pub started_on: Vec<NodeId>,
    /// Owners whose start failed, with the reason
    pub failures: Vec<(NodeId, String)>,
}

impl ChildStartReport {
    /// Whether at least one replica started
    pub fn is_started(&self) -> bool {
        !self.started_on.is_empty()
    }
}

/// Per-child outcome of `stop_children`
#[derive(Debug, Clone)]
pub struct ChildStopReport {
    /// The child this report concerns
    pub child_id: ChildId,
    /// Nodes whose replica was asked to stop
    pub stopped_on: Vec<NodeId>,
    /// Why the child could not be stopped, if it could not
    pub error: Option<String>,
}

// =============================================================================
// Hub
// =============================================================================

/// One running hub instance.
pub struct Hub<T: Transport + 'static> {
    config: HubConfig,
    coordinator: Arc<HubCoordinator<T>>,
    state: RwLock<HubState>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl<T: Transport + 'static> Hub<T> {
    /// Start a hub over the given transport and supervisor.
    ///
    /// Subscribing the transport and claiming the hub id are fatal on
    /// failure; the hub either comes up whole or not at all.
    pub async fn start(
        config: HubConfig,
        transport: Arc<T>,
        supervisor: Arc<dyn ChildSupervisor>,
        io: IoContext,
    ) -> HubResult<Arc<Self>> {
        config.validate()?;
        let local = transport.local_node().clone();
        claim_hub_id(&config.hub_id, &local)?;
        info!(hub_id = %config.hub_id, node = %local, "starting hub");

        let view = Arc::new(ClusterView::new(local.clone()));
        let registry = Arc::new(LocalRegistry::new(local.clone()));
        let distribution = config.distribution.build();
        let redundancy = match RedundancyStrategy::new(config.replication_factor) {
            Ok(redundancy) => redundancy,
            Err(e) => {
                release_hub_id(&config.hub_id, &local);
                return Err(e.into());
            }
        };
        let hooks = Arc::new(HookRegistry::new());

        let gossip = GossipSync::new(
            config.hub_id.clone(),
            view.clone(),
            registry.clone(),
            transport.clone(),
            config.sync.clone(),
            io.clone(),
        );
        let migrator = HotSwapMigrator::new(
            config.hub_id.clone(),
            view.clone(),
            registry.clone(),
            supervisor.clone(),
            transport.clone(),
            distribution.clone(),
            config.replication_factor,
            config.migration.clone(),
            io,
        );
        let coordinator = Arc::new(HubCoordinator::new(
            config.hub_id.clone(),
            view,
            registry,
            supervisor,
            transport.clone(),
            gossip,
            migrator,
            distribution,
            redundancy,
            hooks,
            config.migration.migration_timeout(),
        ));

        let hub = Arc::new(Self {
            config,
            coordinator: coordinator.clone(),
            state: RwLock::new(HubState::Initializing),
            tick_task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        });

        if let Err(e) = transport.set_handler(coordinator.clone()).await {
            release_hub_id(&hub.config.hub_id, &local);
            return Err(e);
        }
        if let Err(e) = transport.start().await {
            release_hub_id(&hub.config.hub_id, &local);
            return Err(e);
        }

        // Periodic gossip tick.
        let tick_interval = hub.config.sync.sync_interval();
        let tick_shutdown = hub.shutdown.clone();
        let tick_coordinator = coordinator;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick_shutdown.notified() => break,
                    _ = tokio::time::sleep(tick_interval) => {
                        tick_coordinator.gossip_tick().await;
                    }
                }
            }
        });
        *hub.tick_task.lock().await = Some(task);

        *hub.state.write().await = HubState::Running;
        Ok(hub)
    }

    /// This hub's id
    pub fn hub_id(&self) -> &HubId {
        &self.config.hub_id
    }

    /// This hub's node id
    pub fn local_node(&self) -> &NodeId {
        self.coordinator.view.local()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> HubState {
        *self.state.read().await
    }

    /// Whether the hub serves requests
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == HubState::Running
    }

    async fn ensure_running(&self) -> HubResult<()> {
        if !self.is_running().await {
            return Err(HubError::NotStarted);
        }
        Ok(())
    }

    /// Stop the hub gracefully.
    ///
    /// With handover enabled, every local worker's state is shipped to
    /// its new owners before the transport detaches.
    pub async fn stop(&self) -> HubResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != HubState::Running {
                return Err(HubError::NotStarted);
            }
            *state = HubState::ShuttingDown;
        }
        info!(hub_id = %self.config.hub_id, "stopping hub");

        if let Err(e) = self.coordinator.migrator.shutdown_handover().await {
            warn!(error = %e, "shutdown handover failed");
        }

        self.shutdown.notify_waiters();
        if let Some(task) = self.tick_task.lock().await.take() {
            task.abort();
        }
        self.coordinator.transport.stop().await?;

        release_hub_id(&self.config.hub_id, self.coordinator.view.local());
        *self.state.write().await = HubState::Stopped;
        Ok(())
    }

    // =========================================================================
    // Membership feed
    // =========================================================================

    /// Report a node as reachable (from the connectivity layer)
    pub async fn node_up(&self, node: NodeId) -> HubResult<()> {
        self.ensure_running().await?;
        self.coordinator.on_node_joined(node).await
    }

    /// Report a node as unreachable or departed
    pub async fn node_down(&self, node: &NodeId) -> HubResult<()> {
        self.ensure_running().await?;
        self.coordinator.on_node_left(node).await
    }

    /// Current members, local node included
    pub async fn nodes(&self) -> Vec<NodeId> {
        self.coordinator.view.nodes(true).await
    }

    // =========================================================================
    // Child API
    // =========================================================================

    /// Start children on their distribution-assigned owners.
    ///
    /// Failures are per child (and per owner); one failed start never
    /// poisons the rest of the batch.
    pub async fn start_children(
        &self,
        specs: Vec<ChildSpec>,
    ) -> HubResult<Vec<ChildStartReport>> {
        self.ensure_running().await?;

        let members = self.coordinator.view.nodes(true).await;
        let local = self.coordinator.view.local().clone();
        let replication_factor = self.config.replication_factor;
        let mut reports = Vec::with_capacity(specs.len());

        for spec in specs {
            let owners = self
                .coordinator
                .distribution
                .owners(&spec.id, &members, replication_factor);

            let mut report = ChildStartReport {
                child_id: spec.id.clone(),
                started_on: Vec::new(),
                failures: Vec::new(),
            };

            for owner in owners {
                if owner == local {
                    match self.coordinator.start_local(&spec).await {
                        Ok(_) => report.started_on.push(owner),
                        Err(e) => report.failures.push((owner, e.to_string())),
                    }
                    continue;
                }

                let request = HubMessage::StartChildReq {
                    hub_id: self.config.hub_id.clone(),
                    request_id: next_request_id(),
                    spec: spec.clone(),
                    reply_to: local.clone(),
                };
                match self
                    .coordinator
                    .transport
                    .send_and_recv(&owner, request, self.config.migration.migration_timeout())
                    .await
                {
                    Ok(HubMessage::ChildStartResp { result: Ok(_), .. }) => {
                        report.started_on.push(owner);
                    }
                    Ok(HubMessage::ChildStartResp {
                        result: Err(reason),
                        ..
                    }) => report.failures.push((owner, reason)),
                    Ok(_) => report.failures.push((owner, "unexpected response".into())),
                    Err(e) => report.failures.push((owner, e.to_string())),
                }
            }

            if report.started_on.is_empty() && report.failures.is_empty() {
                report
                    .failures
                    .push((local.clone(), "no owners available".into()));
            }
            reports.push(report);
        }

        Ok(reports)
    }

    /// Stop children on every node hosting a replica.
    pub async fn stop_children(&self, children: Vec<ChildId>) -> HubResult<Vec<ChildStopReport>> {
        self.ensure_running().await?;

        let local = self.coordinator.view.local().clone();
        let mut reports = Vec::with_capacity(children.len());

        for child_id in children {
            let locations = self.coordinator.registry.lookup(&child_id).await;
            if locations.is_empty() {
                reports.push(ChildStopReport {
                    child_id: child_id.clone(),
                    stopped_on: Vec::new(),
                    error: Some(HubError::child_unknown(&child_id).to_string()),
                });
                continue;
            }

            let mut report = ChildStopReport {
                child_id: child_id.clone(),
                stopped_on: Vec::new(),
                error: None,
            };

            for (node, _) in locations {
                if node == local {
                    match self.coordinator.stop_local(&child_id).await {
                        Ok(()) => report.stopped_on.push(node),
                        Err(e) => report.error = Some(e.to_string()),
                    }
                    continue;
                }

                let terminate = HubMessage::TerminateChild {
                    hub_id: self.config.hub_id.clone(),
                    child_id: child_id.clone(),
                };
                match self.coordinator.transport.send(&node, terminate).await {
                    Ok(()) => report.stopped_on.push(node),
                    Err(e) => debug!(child_id = %child_id, node = %node, error = %e, "remote stop failed"),
                }
            }
            reports.push(report);
        }

        Ok(reports)
    }

    /// Full child -> locations view of this node's registry
    pub async fn which_children(&self) -> BTreeMap<ChildId, BTreeMap<NodeId, Pid>> {
        self.coordinator.registry.which_children().await
    }

    /// Locations of one child
    pub async fn child_lookup(&self, child_id: &ChildId) -> Vec<(NodeId, Pid)> {
        self.coordinator.registry.lookup(child_id).await
    }

    /// Registry entry of one child, if known
    pub async fn child_entry(&self, child_id: &ChildId) -> Option<RegistryEntry> {
        self.coordinator.registry.entry(child_id).await
    }

    /// Register a hook callback
    pub async fn on(&self, hook: Hook, callback: HookCallback) {
        self.coordinator.hooks.on(hook, callback).await;
    }
}

impl<T: Transport + 'static> Drop for Hub<T> {
    fn drop(&mut self) {
        // Releasing a claim twice is harmless; this covers hubs dropped
        // without an explicit stop().
        release_hub_id(&self.config.hub_id, self.coordinator.view.local());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{MemoryNetwork, MemoryTransport};
    use crate::supervisor::LocalSupervisor;
    use bytes::Bytes;
    use processhub_core::io::StdRng;
    use processhub_core::worker::HubWorker;

    struct Null;

    impl HubWorker for Null {
        fn export_state(&self) -> Bytes {
            Bytes::new()
        }
        fn adopt_state(&mut self, _state: Bytes) {}
    }

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn cid(s: &str) -> ChildId {
        ChildId::new(s).unwrap()
    }

    fn spec(s: &str) -> ChildSpec {
        ChildSpec::bare(cid(s))
    }

    fn supervisor() -> Arc<LocalSupervisor> {
        Arc::new(LocalSupervisor::new(
            Arc::new(|_spec: &ChildSpec| Box::new(Null) as Box<dyn HubWorker>),
            Arc::new(StdRng::with_seed(31)),
        ))
    }

    async fn single_node_hub(hub_name: &str) -> Arc<Hub<MemoryTransport>> {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::create(network, node("a")).await;
        Hub::start(
            HubConfig::for_testing(HubId::new(hub_name).unwrap()),
            transport,
            supervisor(),
            IoContext::production(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_hub_lifecycle() {
        let hub = single_node_hub("lifecycle-hub").await;
        assert_eq!(hub.state().await, HubState::Running);
        assert!(hub.is_running().await);
        assert_eq!(hub.local_node(), &node("a"));

        hub.stop().await.unwrap();
        assert_eq!(hub.state().await, HubState::Stopped);
        assert!(matches!(hub.stop().await, Err(HubError::NotStarted)));
    }

    #[tokio::test]
    async fn test_duplicate_hub_rejected_per_node() {
        let hub = single_node_hub("dup-hub").await;

        // Same hub on the same node: fatal.
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::create(network, node("a")).await;
        let second = Hub::start(
            HubConfig::for_testing(HubId::new("dup-hub").unwrap()),
            transport,
            supervisor(),
            IoContext::production(),
        )
        .await;
        assert!(matches!(second, Err(HubError::HubAlreadyStarted { .. })));

        // Same hub on another node of the cluster: fine.
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::create(network, node("b")).await;
        let peer = Hub::start(
            HubConfig::for_testing(HubId::new("dup-hub").unwrap()),
            transport,
            supervisor(),
            IoContext::production(),
        )
        .await
        .unwrap();
        peer.stop().await.unwrap();

        // Stopping releases the claim for reuse.
        hub.stop().await.unwrap();
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::create(network, node("a")).await;
        let third = Hub::start(
            HubConfig::for_testing(HubId::new("dup-hub").unwrap()),
            transport,
            supervisor(),
            IoContext::production(),
        )
        .await
        .unwrap();
        third.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_children_single_node() {
        let hub = single_node_hub("start-hub").await;

        let reports = hub
            .start_children(vec![spec("w1"), spec("w2")])
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(report.is_started());
            assert_eq!(report.started_on, vec![node("a")]);
            assert!(report.failures.is_empty());
        }

        let children = hub.which_children().await;
        assert_eq!(children.len(), 2);
        assert_eq!(hub.child_lookup(&cid("w1")).await.len(), 1);

        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_children_reports_unknown() {
        let hub = single_node_hub("stop-hub").await;
        hub.start_children(vec![spec("w1")]).await.unwrap();

        let reports = hub
            .stop_children(vec![cid("w1"), cid("ghost")])
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);

        assert_eq!(reports[0].stopped_on, vec![node("a")]);
        assert!(reports[0].error.is_none());

        assert!(reports[1].stopped_on.is_empty());
        assert!(reports[1].error.as_deref().unwrap().contains("ghost"));

        assert!(hub.which_children().await.is_empty());
        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_api_rejected_when_not_running() {
        let hub = single_node_hub("closed-hub").await;
        hub.stop().await.unwrap();

        assert!(matches!(
            hub.start_children(vec![spec("w1")]).await,
            Err(HubError::NotStarted)
        ));
        assert!(matches!(
            hub.node_up(node("b")).await,
            Err(HubError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::create(network, node("a")).await;

        let mut config = HubConfig::for_testing(HubId::new("bad-config-hub").unwrap());
        config.replication_factor = 0;

        let result = Hub::start(config, transport, supervisor(), IoContext::production()).await;
        assert!(matches!(
            result,
            Err(HubError::InvalidConfiguration { .. })
        ));
    }
}

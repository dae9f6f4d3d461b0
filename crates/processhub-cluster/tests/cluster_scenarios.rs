//! Multi-node cluster scenarios over the in-memory transport.
//!
//! Each test assembles a small cluster of hubs sharing one
//! `MemoryNetwork`, with probe workers that expose their state and the
//! redundancy signals they receive.

use bytes::Bytes;
use processhub_cluster::{
    ChildSupervisor, Hub, HubConfig, LocalSupervisor, MemoryNetwork, MemoryTransport,
};
use processhub_core::child::{ChildId, ChildSpec, HubId};
use processhub_core::io::{IoContext, StdRng};
use processhub_core::worker::{HubWorker, RedundancyMode, WorkerMsg};
use processhub_registry::{DistributionStrategy, HashRingDistribution, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Probe workers
// =============================================================================

/// Per-node observation of worker states and redundancy signals.
#[derive(Clone, Default)]
struct NodeProbe {
    states: Arc<Mutex<HashMap<ChildId, u64>>>,
    modes: Arc<Mutex<HashMap<ChildId, Vec<RedundancyMode>>>>,
}

impl NodeProbe {
    fn state_of(&self, child_id: &ChildId) -> Option<u64> {
        self.states.lock().unwrap().get(child_id).copied()
    }

    fn last_mode(&self, child_id: &ChildId) -> Option<RedundancyMode> {
        self.modes
            .lock()
            .unwrap()
            .get(child_id)
            .and_then(|modes| modes.last().copied())
    }
}

/// Counter worker: adopts 8-byte big-endian states and reports every
/// redundancy signal to its node's probe.
struct ProbeWorker {
    child_id: ChildId,
    probe: NodeProbe,
    value: u64,
}

impl ProbeWorker {
    fn new(spec: &ChildSpec, probe: NodeProbe) -> Self {
        let value = decode_counter(&spec.start_params).unwrap_or(0);
        probe
            .states
            .lock()
            .unwrap()
            .insert(spec.id.clone(), value);
        Self {
            child_id: spec.id.clone(),
            probe,
            value,
        }
    }
}

impl HubWorker for ProbeWorker {
    fn export_state(&self) -> Bytes {
        counter_bytes(self.value)
    }

    fn adopt_state(&mut self, state: Bytes) {
        if let Some(value) = decode_counter(&state) {
            self.value = value;
            self.probe
                .states
                .lock()
                .unwrap()
                .insert(self.child_id.clone(), value);
        }
    }

    fn on_redundancy_change(&mut self, mode: RedundancyMode) {
        self.probe
            .modes
            .lock()
            .unwrap()
            .entry(self.child_id.clone())
            .or_default()
            .push(mode);
    }
}

fn counter_bytes(value: u64) -> Bytes {
    Bytes::from(value.to_be_bytes().to_vec())
}

fn decode_counter(bytes: &Bytes) -> Option<u64> {
    if bytes.len() != 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(u64::from_be_bytes(buf))
}

// =============================================================================
// Cluster harness
// =============================================================================

struct TestNode {
    node: NodeId,
    hub: Arc<Hub<MemoryTransport>>,
    supervisor: Arc<LocalSupervisor>,
    probe: NodeProbe,
}

async fn add_node(
    network: &Arc<MemoryNetwork>,
    hub_name: &str,
    name: &str,
    configure: &dyn Fn(HubConfig) -> HubConfig,
) -> TestNode {
    let node = NodeId::new(name).unwrap();
    let probe = NodeProbe::default();

    let factory_probe = probe.clone();
    let seed = name.bytes().map(u64::from).sum::<u64>() + 1;
    let supervisor = Arc::new(LocalSupervisor::new(
        Arc::new(move |spec: &ChildSpec| {
            Box::new(ProbeWorker::new(spec, factory_probe.clone())) as Box<dyn HubWorker>
        }),
        Arc::new(StdRng::with_seed(seed)),
    ));

    let transport = MemoryTransport::create(network.clone(), node.clone()).await;
    let config = configure(HubConfig::for_testing(HubId::new(hub_name).unwrap()));
    let hub = Hub::start(config, transport, supervisor.clone(), IoContext::production())
        .await
        .unwrap();

    TestNode {
        node,
        hub,
        supervisor,
        probe,
    }
}

async fn start_cluster(
    hub_name: &str,
    names: &[&str],
    configure: &dyn Fn(HubConfig) -> HubConfig,
) -> (Arc<MemoryNetwork>, Vec<TestNode>) {
    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(names.len());
    for name in names {
        nodes.push(add_node(&network, hub_name, name, configure).await);
    }

    // Full-mesh membership.
    for i in 0..nodes.len() {
        for j in 0..nodes.len() {
            if i != j {
                let peer = nodes[j].node.clone();
                nodes[i].hub.node_up(peer).await.unwrap();
            }
        }
    }

    (network, nodes)
}

fn cid(s: &str) -> ChildId {
    ChildId::new(s).unwrap()
}

fn spec(s: &str) -> ChildSpec {
    ChildSpec::bare(cid(s))
}

/// Find a child id whose ring placement satisfies `pred`.
fn find_cid(prefix: &str, pred: impl Fn(&ChildId) -> bool) -> ChildId {
    for i in 0..10_000 {
        let candidate = cid(&format!("{}-{}", prefix, i));
        if pred(&candidate) {
            return candidate;
        }
    }
    panic!("no child id under prefix {} satisfies the placement predicate", prefix);
}

fn owners(child_id: &ChildId, names: &[&str], replication_factor: usize) -> Vec<String> {
    let nodes: Vec<NodeId> = names.iter().map(|n| NodeId::new(*n).unwrap()).collect();
    HashRingDistribution::new()
        .owners(child_id, &nodes, replication_factor)
        .into_iter()
        .map(|n| n.as_str().to_string())
        .collect()
}

macro_rules! eventually {
    ($timeout_ms:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_millis($timeout_ms);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within {}ms: {}",
                $timeout_ms,
                stringify!($cond)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

async fn set_worker_state(node: &TestNode, child_id: &ChildId, value: u64) {
    let worker = node.supervisor.worker(child_id).await.unwrap();
    worker
        .send(WorkerMsg::Handover {
            state: counter_bytes(value),
        })
        .await;
    let probe = node.probe.clone();
    let child_id = child_id.clone();
    eventually!(1_000, probe.state_of(&child_id) == Some(value));
}

async fn hosts(node: &TestNode, child_id: &ChildId) -> bool {
    node.supervisor.worker(child_id).await.is_some()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn basic_registration_converges_everywhere() {
    let (_network, nodes) =
        start_cluster("scenario-basic", &["a", "b", "c"], &|config| config).await;

    let reports = nodes[0].hub.start_children(vec![spec("w1")]).await.unwrap();
    assert!(reports[0].is_started());
    assert_eq!(reports[0].started_on.len(), 1);

    // Exactly one node supervises the child locally.
    let mut local_count = 0;
    for node in &nodes {
        if hosts(node, &cid("w1")).await {
            local_count += 1;
        }
    }
    assert_eq!(local_count, 1);

    // Every node's registry converges to the same single location.
    let expected = reports[0].started_on[0].clone();
    for node in &nodes {
        let hub = &node.hub;
        eventually!(2_000, {
            let children = hub.which_children().await;
            children
                .get(&cid("w1"))
                .is_some_and(|locations| {
                    locations.len() == 1 && locations.contains_key(&expected)
                })
        });
    }
}

#[tokio::test]
async fn join_hot_swaps_owned_child_with_state() {
    let configure = |config: HubConfig| config.with_handover();
    let (network, nodes) = start_cluster("scenario-swap", &["a", "b"], &configure).await;

    // A child currently owned by a, owned by c once c joins.
    let child = find_cid("swap", |candidate| {
        owners(candidate, &["a", "b"], 1) == ["a"]
            && owners(candidate, &["a", "b", "c"], 1) == ["c"]
    });

    nodes[0]
        .hub
        .start_children(vec![ChildSpec::bare(child.clone())])
        .await
        .unwrap();
    assert!(hosts(&nodes[0], &child).await);
    set_worker_state(&nodes[0], &child, 42).await;

    // c joins and learns the cluster before the others see it.
    let joined = add_node(&network, "scenario-swap", "c", &configure).await;
    joined.hub.node_up(nodes[0].node.clone()).await.unwrap();
    joined.hub.node_up(nodes[1].node.clone()).await.unwrap();
    nodes[0].hub.node_up(joined.node.clone()).await.unwrap();
    nodes[1].hub.node_up(joined.node.clone()).await.unwrap();

    // The child moves to c with its state intact.
    let probe = joined.probe.clone();
    eventually!(3_000, {
        hosts(&joined, &child).await && probe.state_of(&child) == Some(42)
    });
    eventually!(3_000, !hosts(&nodes[0], &child).await);

    // Registries converge on the new location.
    for node in [&nodes[1], &joined] {
        let hub = &node.hub;
        eventually!(2_000, {
            let locations = hub.child_lookup(&child).await;
            locations.len() == 1 && locations[0].0 == joined.node
        });
    }
}

#[tokio::test]
async fn graceful_leave_hands_state_to_new_owner() {
    let configure = |config: HubConfig| config.with_replication_factor(2).with_handover();
    let (_network, nodes) = start_cluster("scenario-leave", &["a", "b", "c"], &configure).await;

    // Owned by exactly {a, b}, with a the primary.
    let child = find_cid("leave", |candidate| {
        owners(candidate, &["a", "b", "c"], 2) == ["a", "b"]
    });

    nodes[0]
        .hub
        .start_children(vec![ChildSpec::bare(child.clone())])
        .await
        .unwrap();
    eventually!(2_000, hosts(&nodes[0], &child).await && hosts(&nodes[1], &child).await);
    set_worker_state(&nodes[0], &child, 77).await;

    // a leaves gracefully; its state ships ahead of the membership event.
    nodes[0].hub.stop().await.unwrap();
    nodes[1].hub.node_down(&nodes[0].node).await.unwrap();
    nodes[2].hub.node_down(&nodes[0].node).await.unwrap();

    // c adopts the child with the exact state a held at shutdown.
    let probe = nodes[2].probe.clone();
    eventually!(3_000, {
        hosts(&nodes[2], &child).await && probe.state_of(&child) == Some(77)
    });
    // b keeps its replica.
    assert!(hosts(&nodes[1], &child).await);

    eventually!(2_000, {
        let locations = nodes[2].hub.child_lookup(&child).await;
        locations.len() == 2
            && locations.iter().any(|(n, _)| n == &nodes[1].node)
            && locations.iter().any(|(n, _)| n == &nodes[2].node)
    });
}

#[tokio::test]
async fn replication_factor_two_assigns_and_promotes_modes() {
    let configure = |config: HubConfig| config.with_replication_factor(2);
    let (_network, nodes) = start_cluster("scenario-modes", &["a", "b", "c"], &configure).await;

    // After the primary dies the standby must rank first among the
    // survivors, so promotion is stable even once the third node adds
    // the second replica back.
    let child = find_cid("w4", |candidate| {
        let all = owners(candidate, &["a", "b", "c"], 2);
        let remaining: Vec<&str> = ["a", "b", "c"]
            .iter()
            .copied()
            .filter(|n| *n != all[0])
            .collect();
        owners(candidate, &remaining, 2).first() == Some(&all[1])
    });
    let owner_names = owners(&child, &["a", "b", "c"], 2);
    let primary = nodes
        .iter()
        .position(|n| n.node.as_str() == owner_names[0])
        .unwrap();
    let standby = nodes
        .iter()
        .position(|n| n.node.as_str() == owner_names[1])
        .unwrap();

    nodes[0]
        .hub
        .start_children(vec![ChildSpec::bare(child.clone())])
        .await
        .unwrap();

    let primary_probe = nodes[primary].probe.clone();
    let standby_probe = nodes[standby].probe.clone();
    eventually!(2_000, {
        primary_probe.last_mode(&child) == Some(RedundancyMode::Active)
            && standby_probe.last_mode(&child) == Some(RedundancyMode::Passive)
    });

    // Kill the active replica's node: the passive replica is promoted.
    nodes[primary].hub.stop().await.unwrap();
    for (i, node) in nodes.iter().enumerate() {
        if i != primary {
            node.hub.node_down(&nodes[primary].node).await.unwrap();
        }
    }

    eventually!(2_000, standby_probe.last_mode(&child) == Some(RedundancyMode::Active));
}

#[tokio::test]
async fn partitioned_registrations_converge_after_heal() {
    let (network, nodes) =
        start_cluster("scenario-heal", &["a", "b", "c", "d"], &|config| config).await;

    let w5 = find_cid("w5", |candidate| {
        owners(candidate, &["a", "b", "c", "d"], 1) == ["a"]
    });
    let w6 = find_cid("w6", |candidate| {
        owners(candidate, &["a", "b", "c", "d"], 1) == ["d"]
    });

    let side_ab = [nodes[0].node.clone(), nodes[1].node.clone()];
    let side_cd = [nodes[2].node.clone(), nodes[3].node.clone()];
    network.partition(&side_ab, &side_cd).await;

    nodes[0]
        .hub
        .start_children(vec![ChildSpec::bare(w5.clone())])
        .await
        .unwrap();
    nodes[3]
        .hub
        .start_children(vec![ChildSpec::bare(w6.clone())])
        .await
        .unwrap();

    // Each registration crosses its own side of the partition only.
    eventually!(2_000, !nodes[1].hub.child_lookup(&w5).await.is_empty());
    eventually!(2_000, !nodes[2].hub.child_lookup(&w6).await.is_empty());
    assert!(nodes[1].hub.child_lookup(&w6).await.is_empty());
    assert!(nodes[2].hub.child_lookup(&w5).await.is_empty());

    network.heal().await;

    // Two sync intervals after healing, everyone sees both children.
    for node in &nodes {
        let hub = &node.hub;
        eventually!(3_000, {
            !hub.child_lookup(&w5).await.is_empty() && !hub.child_lookup(&w6).await.is_empty()
        });
    }
}

#[tokio::test]
async fn retention_expiry_terminates_without_handover() {
    let configure = |config: HubConfig| {
        let mut config = config;
        config.migration.retention_ms = 100;
        config.migration.handover = false;
        config
    };
    let (network, nodes) = start_cluster("scenario-retention", &["a"], &configure).await;

    // Owned by b once b joins.
    let child = find_cid("retain", |candidate| {
        owners(candidate, &["a", "b"], 1) == ["b"]
    });
    nodes[0]
        .hub
        .start_children(vec![ChildSpec::bare(child.clone())])
        .await
        .unwrap();
    assert!(hosts(&nodes[0], &child).await);

    let joined = add_node(&network, "scenario-retention", "b", &configure).await;
    joined.hub.node_up(nodes[0].node.clone()).await.unwrap();

    // node_up drives the whole migration round, including retention.
    let started_at = std::time::Instant::now();
    nodes[0].hub.node_up(joined.node.clone()).await.unwrap();
    let elapsed = started_at.elapsed();

    // The local replica was held for the retention window, then
    // terminated without waiting for any handover.
    assert!(
        elapsed >= Duration::from_millis(100),
        "terminated before retention: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(300),
        "terminated far past retention: {:?}",
        elapsed
    );
    assert!(!hosts(&nodes[0], &child).await);
    assert!(hosts(&joined, &child).await);
}

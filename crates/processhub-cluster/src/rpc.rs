//! Inter-node messages and transport
//!
//! Explicit message types; the transport itself is a trait so any
//! reliable typed node-to-node delivery can back a hub. `MemoryTransport`
//! delivers through channels in-process and supports partition injection
//! for tests.

use crate::error::{HubError, HubResult};
use crate::gossip::{PropagateRound, SyncRound};
use async_trait::async_trait;
use bytes::Bytes;
use processhub_core::child::{ChildId, ChildSpec, HubId, Pid};
use processhub_registry::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Request correlation id
pub type RequestId = u64;

/// Mint a request id unique within this process
pub fn next_request_id() -> RequestId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

/// Outcome of starting a child on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChildStartOutcome {
    /// A fresh replica was started
    Started { pid: Pid },
    /// A replica was already running; treated as success
    AlreadyStarted { pid: Pid },
}

impl ChildStartOutcome {
    /// The pid of the running replica
    pub fn pid(&self) -> Pid {
        match self {
            Self::Started { pid } | Self::AlreadyStarted { pid } => *pid,
        }
    }
}

/// Messages exchanged between hub nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Gossip round message
    Sync { hub_id: HubId, round: SyncRound },

    /// Out-of-band registry mutation diffusion
    Propagate {
        hub_id: HubId,
        round: PropagateRound,
    },

    /// Ask the receiving node to start a child locally
    StartChildReq {
        hub_id: HubId,
        request_id: RequestId,
        spec: ChildSpec,
        reply_to: NodeId,
    },

    /// Response to a start request
    ChildStartResp {
        hub_id: HubId,
        request_id: RequestId,
        child_id: ChildId,
        result: Result<ChildStartOutcome, String>,
    },

    /// Deliver handed-over worker states to the receiving node
    HandoverShip {
        hub_id: HubId,
        states: Vec<(ChildId, Bytes)>,
    },

    /// Ask the receiving node to terminate its replica of a child
    TerminateChild { hub_id: HubId, child_id: ChildId },
}

impl HubMessage {
    /// The hub this message belongs to
    pub fn hub_id(&self) -> &HubId {
        match self {
            Self::Sync { hub_id, .. }
            | Self::Propagate { hub_id, .. }
            | Self::StartChildReq { hub_id, .. }
            | Self::ChildStartResp { hub_id, .. }
            | Self::HandoverShip { hub_id, .. }
            | Self::TerminateChild { hub_id, .. } => hub_id,
        }
    }

    /// The correlation id, if this message has one
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::StartChildReq { request_id, .. } | Self::ChildStartResp { request_id, .. } => {
                Some(*request_id)
            }
            _ => None,
        }
    }

    /// Whether this message answers a pending request
    pub fn is_response(&self) -> bool {
        matches!(self, Self::ChildStartResp { .. })
    }
}

// =============================================================================
// Transport traits
// =============================================================================

/// Node-to-node message transport
///
/// Abstracts the delivery mechanism (in-memory channels, TCP, ...).
/// Delivery is best-effort: lost messages are repaired by later gossip
/// rounds, never retried per message.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific node
    async fn send(&self, target: &NodeId, message: HubMessage) -> HubResult<()>;

    /// Send a request and wait for its response
    async fn send_and_recv(
        &self,
        target: &NodeId,
        message: HubMessage,
        timeout: Duration,
    ) -> HubResult<HubMessage>;

    /// Register the handler for incoming messages
    async fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> HubResult<()>;

    /// Start receiving
    async fn start(&self) -> HubResult<()>;

    /// Stop receiving and detach from the network
    async fn stop(&self) -> HubResult<()>;

    /// This transport's node id
    fn local_node(&self) -> &NodeId;
}

/// Handler for incoming messages
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Handle an incoming message, optionally producing a response that
    /// the transport routes back to the sender.
    async fn handle(&self, from: &NodeId, message: HubMessage) -> Option<HubMessage>;
}

// =============================================================================
// In-memory transport
// =============================================================================

/// Shared in-process network connecting `MemoryTransport` endpoints.
///
/// Supports symmetric partitions between node groups; a blocked or
/// missing route surfaces as `NodeUnreachable`, matching how a real
/// transport reports connectivity loss.
pub struct MemoryNetwork {
    links: RwLock<HashMap<NodeId, mpsc::Sender<(NodeId, HubMessage)>>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
        })
    }

    async fn register(&self, node: NodeId, sender: mpsc::Sender<(NodeId, HubMessage)>) {
        self.links.write().await.insert(node, sender);
    }

    async fn unregister(&self, node: &NodeId) {
        self.links.write().await.remove(node);
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, message: HubMessage) -> HubResult<()> {
        if self
            .blocked
            .read()
            .await
            .contains(&(from.clone(), to.clone()))
        {
            return Err(HubError::node_unreachable(to, "partitioned"));
        }

        let links = self.links.read().await;
        let sender = links
            .get(to)
            .ok_or_else(|| HubError::node_unreachable(to, "no route"))?;

        sender
            .send((from.clone(), message))
            .await
            .map_err(|_| HubError::node_unreachable(to, "channel closed"))
    }

    /// Block all traffic between the two groups, both directions
    pub async fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut blocked = self.blocked.write().await;
        for a in group_a {
            for b in group_b {
                blocked.insert((a.clone(), b.clone()));
                blocked.insert((b.clone(), a.clone()));
            }
        }
    }

    /// Remove every partition
    pub async fn heal(&self) {
        self.blocked.write().await.clear();
    }
}

/// In-memory transport endpoint for one node
pub struct MemoryTransport {
    node: NodeId,
    network: Arc<MemoryNetwork>,
    receiver: Mutex<Option<mpsc::Receiver<(NodeId, HubMessage)>>>,
    handler: Arc<RwLock<Option<Arc<dyn TransportHandler>>>>,
    pending: Arc<RwLock<HashMap<RequestId, oneshot::Sender<HubMessage>>>>,
    running: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Depth of each endpoint's inbound queue
const MEMORY_TRANSPORT_QUEUE_DEPTH: usize = 1024;

impl MemoryTransport {
    /// Create an endpoint and attach it to the network
    pub async fn create(network: Arc<MemoryNetwork>, node: NodeId) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(MEMORY_TRANSPORT_QUEUE_DEPTH);
        network.register(node.clone(), tx).await;

        Arc::new(Self {
            node,
            network,
            receiver: Mutex::new(Some(rx)),
            handler: Arc::new(RwLock::new(None)),
            pending: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            loop_task: Mutex::new(None),
        })
    }

    async fn process_messages(
        local: NodeId,
        network: Arc<MemoryNetwork>,
        mut receiver: mpsc::Receiver<(NodeId, HubMessage)>,
        handler: Arc<RwLock<Option<Arc<dyn TransportHandler>>>>,
        pending: Arc<RwLock<HashMap<RequestId, oneshot::Sender<HubMessage>>>>,
    ) {
        while let Some((from, message)) = receiver.recv().await {
            // Responses resolve pending requests instead of reaching the
            // handler.
            if message.is_response() {
                if let Some(request_id) = message.request_id() {
                    if let Some(waiter) = pending.write().await.remove(&request_id) {
                        let _ = waiter.send(message);
                        continue;
                    }
                }
                debug!(from = %from, "dropping response with no pending waiter");
                continue;
            }

            let current = handler.read().await.clone();
            match current {
                Some(h) => {
                    if let Some(response) = h.handle(&from, message).await {
                        if let Err(e) = network.deliver(&local, &from, response).await {
                            debug!(to = %from, error = %e, "failed to route response");
                        }
                    }
                }
                None => warn!(from = %from, "message received before handler was set"),
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &NodeId, message: HubMessage) -> HubResult<()> {
        self.network.deliver(&self.node, target, message).await
    }

    async fn send_and_recv(
        &self,
        target: &NodeId,
        message: HubMessage,
        timeout: Duration,
    ) -> HubResult<HubMessage> {
        let request_id = message
            .request_id()
            .ok_or_else(|| HubError::internal("message has no request id"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        if let Err(e) = self.send(target, message).await {
            self.pending.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HubError::node_unreachable(target, "response channel closed")),
            Err(_) => {
                self.pending.write().await.remove(&request_id);
                Err(HubError::send_timeout(target, timeout.as_millis() as u64))
            }
        }
    }

    async fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> HubResult<()> {
        *self.handler.write().await = Some(handler);
        Ok(())
    }

    async fn start(&self) -> HubResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HubError::AlreadyStarted);
        }

        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| HubError::internal("receiver already taken"))?;

        let task = tokio::spawn(Self::process_messages(
            self.node.clone(),
            self.network.clone(),
            receiver,
            self.handler.clone(),
            self.pending.clone(),
        ));
        *self.loop_task.lock().await = Some(task);

        Ok(())
    }

    async fn stop(&self) -> HubResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.network.unregister(&self.node).await;
        if let Some(task) = self.loop_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    fn local_node(&self) -> &NodeId {
        &self.node
    }
}

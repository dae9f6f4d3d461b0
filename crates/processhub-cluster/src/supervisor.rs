//! Local supervisor seam
//!
//! The hub never spawns workers itself; it asks the node's supervisor
//! collaborator through [`ChildSupervisor`]. `LocalSupervisor` is the
//! in-process implementation used by tests and single-binary
//! deployments: it runs each child as a [`spawn_worker`] task built by a
//! user-supplied factory.

use crate::error::{HubError, HubResult};
use crate::rpc::ChildStartOutcome;
use async_trait::async_trait;
use processhub_core::child::{ChildId, ChildSpec, Pid};
use processhub_core::io::RngProvider;
use processhub_core::worker::{spawn_worker, HubWorker, WorkerHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builds a worker instance from its spec.
pub type WorkerFactory = Arc<dyn Fn(&ChildSpec) -> Box<dyn HubWorker> + Send + Sync>;

/// What the hub needs from the node-local supervisor.
#[async_trait]
pub trait ChildSupervisor: Send + Sync {
    /// Start a child, or report the existing replica.
    ///
    /// Starting a child that is already running is not an error: it
    /// returns `AlreadyStarted` with the existing pid, which migration
    /// treats as success.
    async fn start_child(&self, spec: &ChildSpec) -> HubResult<ChildStartOutcome>;

    /// Terminate a running child.
    ///
    /// # Errors
    /// Returns [`HubError::ChildUnknown`] if no such child runs locally.
    async fn terminate_child(&self, child_id: &ChildId) -> HubResult<()>;

    /// Mailbox handle of a running child, if any
    async fn worker(&self, child_id: &ChildId) -> Option<WorkerHandle>;

    /// Mailbox handles of every running child
    async fn local_children(&self) -> Vec<WorkerHandle>;
}

/// In-process supervisor running workers as tokio tasks.
pub struct LocalSupervisor {
    factory: WorkerFactory,
    rng: Arc<dyn RngProvider>,
    children: RwLock<HashMap<ChildId, (WorkerHandle, JoinHandle<()>)>>,
}

impl LocalSupervisor {
    /// Create a supervisor that builds workers with `factory`
    pub fn new(factory: WorkerFactory, rng: Arc<dyn RngProvider>) -> Self {
        Self {
            factory,
            rng,
            children: RwLock::new(HashMap::new()),
        }
    }

    /// Number of running children
    pub async fn len(&self) -> usize {
        self.children.read().await.len()
    }

    /// Whether no children run locally
    pub async fn is_empty(&self) -> bool {
        self.children.read().await.is_empty()
    }
}

#[async_trait]
impl ChildSupervisor for LocalSupervisor {
    async fn start_child(&self, spec: &ChildSpec) -> HubResult<ChildStartOutcome> {
        let mut children = self.children.write().await;

        if let Some((handle, _)) = children.get(&spec.id) {
            debug!(child_id = %spec.id, pid = %handle.pid(), "child already running");
            return Ok(ChildStartOutcome::AlreadyStarted { pid: handle.pid() });
        }

        let pid = Pid::new(self.rng.next_u64());
        let worker = (self.factory)(spec);
        let (handle, task) = spawn_worker(spec.id.clone(), pid, worker);

        info!(child_id = %spec.id, pid = %pid, "started child");
        children.insert(spec.id.clone(), (handle, task));
        Ok(ChildStartOutcome::Started { pid })
    }

    async fn terminate_child(&self, child_id: &ChildId) -> HubResult<()> {
        let (_, task) = self
            .children
            .write()
            .await
            .remove(child_id)
            .ok_or_else(|| HubError::child_unknown(child_id))?;

        task.abort();
        info!(child_id = %child_id, "terminated child");
        Ok(())
    }

    async fn worker(&self, child_id: &ChildId) -> Option<WorkerHandle> {
        self.children
            .read()
            .await
            .get(child_id)
            .map(|(handle, _)| handle.clone())
    }

    async fn local_children(&self) -> Vec<WorkerHandle> {
        self.children
            .read()
            .await
            .values()
            .map(|(handle, _)| handle.clone())
            .collect()
    }
}

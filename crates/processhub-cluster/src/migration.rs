//! Hot-swap migrator
//!
//! Moves running children to a newly eligible owner without visible
//! downtime. A migration round starts the children remotely, optionally
//! hands each worker's in-memory state over, and terminates the local
//! replicas either when their handover completes or when the single
//! global retention deadline fires, whichever comes first.

use crate::config::MigrationConfig;
use crate::error::{HubError, HubResult};
use crate::rpc::{next_request_id, HubMessage, Transport};
use crate::supervisor::ChildSupervisor;
use bytes::Bytes;
use processhub_core::child::{ChildId, ChildSpec, HubId, Pid};
use processhub_core::io::IoContext;
use processhub_core::worker::WorkerMsg;
use processhub_registry::{ClusterView, DistributionStrategy, LocalRegistry, NodeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Migration state machine
// =============================================================================

/// Per-child migration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPhase {
    /// No migration in progress
    #[default]
    Idle,
    /// Waiting for the remote start response
    AwaitStart,
    /// Remote replica started; waiting for the worker's state export
    HandoverInFlight,
    /// Remote replica started; holding the local replica until retention
    Retaining,
    /// Local replica terminated
    Terminated,
}

impl MigrationPhase {
    /// Whether the migration still holds a local replica
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::AwaitStart | Self::HandoverInFlight | Self::Retaining)
    }

    /// Valid phase transitions
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::AwaitStart)
                // Start failure aborts this child only.
                | (Self::AwaitStart, Self::Idle)
                | (Self::AwaitStart, Self::HandoverInFlight)
                | (Self::AwaitStart, Self::Retaining)
                // retention_over terminates from any live phase.
                | (Self::AwaitStart, Self::Terminated)
                | (Self::HandoverInFlight, Self::Terminated)
                | (Self::Retaining, Self::Terminated)
        )
    }
}

/// Record of one child's migration round.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// The child being migrated
    pub child_id: ChildId,
    /// Node the child is leaving
    pub source: NodeId,
    /// Node the child is moving to
    pub target: NodeId,
    /// Current phase
    pub phase: MigrationPhase,
    /// Whether the worker's state reached the target
    pub state_transferred: bool,
    /// When the round started (µs, local clock)
    pub started_at_us: u64,
    /// When the local replica terminated (µs, local clock)
    pub completed_at_us: Option<u64>,
    /// What went wrong, if anything did
    pub error: Option<String>,
}

impl MigrationRecord {
    fn new(child_id: ChildId, source: NodeId, target: NodeId, started_at_us: u64) -> Self {
        Self {
            child_id,
            source,
            target,
            phase: MigrationPhase::Idle,
            state_transferred: false,
            started_at_us,
            completed_at_us: None,
            error: None,
        }
    }

    fn transition(&mut self, next: MigrationPhase) {
        assert!(
            self.phase.can_transition_to(next),
            "invalid migration transition from {:?} to {:?} for {}",
            self.phase,
            next,
            self.child_id
        );
        self.phase = next;
    }
}

/// Result of one migration round.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    /// Children whose local replica was terminated after a successful
    /// remote start
    pub migrated: Vec<ChildId>,
    /// Children whose remote start failed, with the reason
    pub failed: Vec<(ChildId, String)>,
}

// =============================================================================
// HotSwapMigrator
// =============================================================================

/// Relocates live children between nodes, with optional state handover
/// and a retention grace window.
pub struct HotSwapMigrator<T: Transport> {
    hub_id: HubId,
    view: Arc<ClusterView>,
    registry: Arc<LocalRegistry>,
    supervisor: Arc<dyn ChildSupervisor>,
    transport: Arc<T>,
    distribution: Arc<dyn DistributionStrategy>,
    replication_factor: usize,
    config: MigrationConfig,
    io: IoContext,
    /// States shipped to this node for children that have not started yet
    pending_handover: Mutex<HashMap<ChildId, Bytes>>,
    records: Mutex<HashMap<ChildId, MigrationRecord>>,
}

impl<T: Transport> HotSwapMigrator<T> {
    /// Create a migrator for one hub
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub_id: HubId,
        view: Arc<ClusterView>,
        registry: Arc<LocalRegistry>,
        supervisor: Arc<dyn ChildSupervisor>,
        transport: Arc<T>,
        distribution: Arc<dyn DistributionStrategy>,
        replication_factor: usize,
        config: MigrationConfig,
        io: IoContext,
    ) -> Self {
        Self {
            hub_id,
            view,
            registry,
            supervisor,
            transport,
            distribution,
            replication_factor,
            config,
            io,
            pending_handover: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record of the most recent migration round for a child
    pub async fn record(&self, child_id: &ChildId) -> Option<MigrationRecord> {
        self.records.lock().await.get(child_id).cloned()
    }

    async fn set_record(&self, record: MigrationRecord) {
        self.records
            .lock()
            .await
            .insert(record.child_id.clone(), record);
    }

    async fn update_record(&self, child_id: &ChildId, f: impl FnOnce(&mut MigrationRecord)) {
        if let Some(record) = self.records.lock().await.get_mut(child_id) {
            f(record);
        }
    }

    // =========================================================================
    // Migration round
    // =========================================================================

    /// Migrate `children` from this node to `target`.
    ///
    /// Per-child start failures never abort the batch. One global
    /// retention deadline is armed at the first successful start; when
    /// it fires, every remaining migrating child terminates immediately.
    pub async fn migrate_batch(
        &self,
        children: Vec<ChildSpec>,
        target: &NodeId,
    ) -> HubResult<MigrationOutcome> {
        if !self.view.is_member(target).await {
            return Err(HubError::NotInCluster {
                node: target.to_string(),
            });
        }

        let mut outcome = MigrationOutcome::default();
        if children.is_empty() {
            return Ok(outcome);
        }

        let local = self.view.local().clone();
        let now_us = self.io.time.now_us();

        // Phase 1: start every child on the target.
        let mut started: Vec<ChildSpec> = Vec::with_capacity(children.len());
        let mut deadline: Option<Instant> = None;

        for spec in children {
            let child_id = spec.id.clone();
            let mut record =
                MigrationRecord::new(child_id.clone(), local.clone(), target.clone(), now_us);
            record.transition(MigrationPhase::AwaitStart);
            self.set_record(record).await;

            let request = HubMessage::StartChildReq {
                hub_id: self.hub_id.clone(),
                request_id: next_request_id(),
                spec: spec.clone(),
                reply_to: local.clone(),
            };

            let response = self
                .transport
                .send_and_recv(target, request, self.config.migration_timeout())
                .await;

            match response {
                Ok(HubMessage::ChildStartResp {
                    result: Ok(start), ..
                }) => {
                    debug!(
                        child_id = %child_id,
                        target = %target,
                        pid = %start.pid(),
                        "remote start succeeded"
                    );
                    // The retention timer is global, armed once at the
                    // first start.
                    deadline.get_or_insert_with(|| Instant::now() + self.config.retention());
                    started.push(spec);
                }
                Ok(HubMessage::ChildStartResp {
                    result: Err(reason),
                    ..
                }) => {
                    warn!(child_id = %child_id, target = %target, reason = %reason, "remote start failed");
                    self.update_record(&child_id, |r| {
                        r.transition(MigrationPhase::Idle);
                        r.error = Some(reason.clone());
                    })
                    .await;
                    outcome.failed.push((child_id, reason));
                }
                Ok(other) => {
                    warn!(child_id = %child_id, "unexpected start response: {:?}", other);
                    self.update_record(&child_id, |r| r.transition(MigrationPhase::Idle))
                        .await;
                    outcome.failed.push((child_id, "unexpected response".into()));
                }
                Err(e) => {
                    warn!(child_id = %child_id, target = %target, error = %e, "remote start failed");
                    self.update_record(&child_id, |r| r.transition(MigrationPhase::Idle))
                        .await;
                    outcome.failed.push((child_id, e.to_string()));
                }
            }
        }

        let deadline = match deadline {
            Some(deadline) => deadline,
            None => return Ok(outcome),
        };

        // Phase 2: per child, wait for handover or the retention deadline.
        let mut retention_over = false;
        for spec in &started {
            let child_id = &spec.id;

            if !retention_over {
                if self.config.handover {
                    retention_over = self.run_handover(child_id, target, deadline).await;
                } else {
                    self.update_record(child_id, |r| r.transition(MigrationPhase::Retaining))
                        .await;
                    sleep_until(deadline).await;
                    retention_over = true;
                }
            }

            if let Err(e) = self.supervisor.terminate_child(child_id).await {
                debug!(child_id = %child_id, error = %e, "local terminate after migration");
            }
            let completed = self.io.time.now_us();
            self.update_record(child_id, |r| {
                r.transition(MigrationPhase::Terminated);
                r.completed_at_us = Some(completed);
            })
            .await;
            outcome.migrated.push(child_id.clone());
        }

        info!(
            target = %target,
            migrated = outcome.migrated.len(),
            failed = outcome.failed.len(),
            "migration round finished"
        );
        Ok(outcome)
    }

    /// Drive one child's handover; returns true if retention expired.
    async fn run_handover(&self, child_id: &ChildId, target: &NodeId, deadline: Instant) -> bool {
        let handle = match self.supervisor.worker(child_id).await {
            Some(handle) => handle,
            None => {
                // Nothing local to hand over; hold until retention like a
                // plain migration.
                self.update_record(child_id, |r| r.transition(MigrationPhase::Retaining))
                    .await;
                sleep_until(deadline).await;
                return true;
            }
        };

        self.update_record(child_id, |r| r.transition(MigrationPhase::HandoverInFlight))
            .await;

        let (state_tx, state_rx) = oneshot::channel();
        handle
            .send(WorkerMsg::HandoverStart {
                child_id: child_id.clone(),
                state_tx,
            })
            .await;

        tokio::select! {
            exported = state_rx => {
                match exported {
                    Ok(state) => {
                        self.update_record(child_id, |r| r.state_transferred = true).await;
                        let ship = HubMessage::HandoverShip {
                            hub_id: self.hub_id.clone(),
                            states: vec![(child_id.clone(), state)],
                        };
                        if let Err(e) = self.transport.send(target, ship).await {
                            warn!(child_id = %child_id, target = %target, error = %e, "state shipment failed");
                        }
                    }
                    Err(_) => {
                        debug!(child_id = %child_id, "worker gone before exporting state");
                    }
                }
                false
            }
            _ = sleep_until(deadline) => {
                let timeout = HubError::HandoverTimeout {
                    child_id: child_id.to_string(),
                };
                warn!(child_id = %child_id, "{}; forcing termination", timeout);
                self.update_record(child_id, |r| r.error = Some(timeout.to_string()))
                    .await;
                true
            }
        }
    }

    // =========================================================================
    // Shutdown handover
    // =========================================================================

    /// Collect every local worker's state and ship each to a new owner
    /// that does not already hold the child. Called on graceful leave
    /// when handover is enabled.
    pub async fn shutdown_handover(&self) -> HubResult<()> {
        if !self.config.handover {
            return Ok(());
        }

        let workers = self.supervisor.local_children().await;
        if workers.is_empty() {
            return Ok(());
        }

        let (reply_tx, mut reply_rx) = mpsc::channel(workers.len());
        for worker in &workers {
            worker
                .send(WorkerMsg::GetState {
                    reply: reply_tx.clone(),
                })
                .await;
        }
        drop(reply_tx);

        let deadline = Instant::now() + self.config.shutdown_handover_timeout();
        let mut states: Vec<(ChildId, Bytes)> = Vec::with_capacity(workers.len());
        loop {
            match timeout_at(deadline, reply_rx.recv()).await {
                Ok(Some(pair)) => {
                    states.push(pair);
                    if states.len() == workers.len() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        collected = states.len(),
                        expected = workers.len(),
                        "shutdown handover window expired"
                    );
                    break;
                }
            }
        }

        let local = self.view.local().clone();
        let peers: Vec<NodeId> = self
            .view
            .nodes(true)
            .await
            .into_iter()
            .filter(|n| n != &local)
            .collect();
        if peers.is_empty() {
            debug!("no peers to receive shutdown handover");
            return Ok(());
        }

        // Ship each state to one new owner that does not already host
        // the child.
        let mut shipments: HashMap<NodeId, Vec<(ChildId, Bytes)>> = HashMap::new();
        for (child_id, state) in states {
            let owners = self
                .distribution
                .owners(&child_id, &peers, self.replication_factor);
            let holders: BTreeSet<NodeId> = self
                .registry
                .lookup(&child_id)
                .await
                .into_iter()
                .map(|(node, _)| node)
                .collect();

            match owners.into_iter().find(|owner| !holders.contains(owner)) {
                Some(target) => {
                    shipments.entry(target).or_default().push((child_id, state));
                }
                None => {
                    debug!(child_id = %child_id, "every new owner already hosts a replica");
                }
            }
        }

        for (target, states) in shipments {
            info!(target = %target, children = states.len(), "shipping shutdown handover states");
            let ship = HubMessage::HandoverShip {
                hub_id: self.hub_id.clone(),
                states,
            };
            if let Err(e) = self.transport.send(&target, ship).await {
                warn!(target = %target, error = %e, "shutdown handover shipment failed");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Pending-handover buffer (receiving side)
    // =========================================================================

    /// Buffer shipped states for children not yet running here.
    pub async fn buffer_states(&self, states: Vec<(ChildId, Bytes)>) {
        let mut pending = self.pending_handover.lock().await;
        for (child_id, state) in states {
            pending.insert(child_id, state);
        }
    }

    /// Take the buffered state for a child that just started locally.
    pub async fn take_pending(&self, child_id: &ChildId) -> Option<Bytes> {
        self.pending_handover.lock().await.remove(child_id)
    }

    /// Number of buffered states (for tests and introspection)
    pub async fn pending_len(&self) -> usize {
        self.pending_handover.lock().await.len()
    }

    /// Drop settled migration records older than their bounded lifetime
    /// (`max(migration_timeout, retention)`).
    pub async fn cleanup_records(&self) {
        let now_us = self.io.time.now_us();
        let lifetime_us = self
            .config
            .migration_timeout_ms
            .max(self.config.retention_ms)
            .saturating_mul(1000);
        self.records.lock().await.retain(|_, record| {
            record.phase.is_in_progress()
                || now_us.saturating_sub(record.started_at_us) <= lifetime_us
        });
    }
}

//! Worker protocol
//!
//! The message set a cooperating worker handles so the hub can hot-swap
//! it between nodes, plus a library helper that runs the protocol for
//! any [`HubWorker`] implementation.
//!
//! Workers are black boxes to the hub: the hub only ever talks to them
//! through [`WorkerMsg`]. Sends to a worker that has already gone away
//! are ignored, never errors.

use crate::child::{ChildId, Pid};
use crate::constants::WORKER_MAILBOX_DEPTH_MAX;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

// =============================================================================
// RedundancyMode
// =============================================================================

/// Mode assigned to one replica of a child by the redundancy strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyMode {
    /// Designated primary replica
    Active,
    /// Standby replica
    Passive,
}

impl fmt::Display for RedundancyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Passive => write!(f, "passive"),
        }
    }
}

// =============================================================================
// WorkerMsg
// =============================================================================

/// Messages a worker must handle to cooperate with the hub.
#[derive(Debug)]
pub enum WorkerMsg {
    /// A hot-swap of this worker has started. The worker exports its
    /// state through `state_tx`; completing the send doubles as the
    /// retention acknowledgement, after which the migrator ships the
    /// state to the new replica and terminates this one.
    HandoverStart {
        child_id: ChildId,
        state_tx: oneshot::Sender<Bytes>,
    },

    /// Adopt `state` as the worker's state (incoming side of a handover).
    Handover { state: Bytes },

    /// Reply with `(child_id, state)` on `reply`. Used by graceful
    /// shutdown to collect every local worker's state.
    GetState {
        reply: mpsc::Sender<(ChildId, Bytes)>,
    },

    /// Informational notice that this replica's mode changed.
    RedundancySignal { mode: RedundancyMode },
}

// =============================================================================
// WorkerHandle
// =============================================================================

/// Sending side of a worker's mailbox.
///
/// Cheap to clone. `send` swallows delivery failures: a worker that has
/// terminated simply no longer receives protocol messages.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    child_id: ChildId,
    pid: Pid,
    tx: mpsc::Sender<WorkerMsg>,
}

impl WorkerHandle {
    /// Create a handle from its parts
    pub fn new(child_id: ChildId, pid: Pid, tx: mpsc::Sender<WorkerMsg>) -> Self {
        Self { child_id, pid, tx }
    }

    /// The child this handle addresses
    pub fn child_id(&self) -> &ChildId {
        &self.child_id
    }

    /// The pid minted for this replica
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a protocol message; absent recipients are ignored.
    pub async fn send(&self, msg: WorkerMsg) {
        if self.tx.send(msg).await.is_err() {
            debug!(child_id = %self.child_id, "dropping message to absent worker");
        }
    }
}

// =============================================================================
// HubWorker
// =============================================================================

/// Implemented by user workers that opt into hot-swap.
///
/// `spawn_worker` runs the full [`WorkerMsg`] protocol on top of these
/// three methods, so most workers never touch the raw messages.
pub trait HubWorker: Send + 'static {
    /// Serialize the worker's current state for handover
    fn export_state(&self) -> Bytes;

    /// Replace the worker's state with a handed-over snapshot
    fn adopt_state(&mut self, state: Bytes);

    /// Notification that this replica's redundancy mode changed
    fn on_redundancy_change(&mut self, _mode: RedundancyMode) {}
}

impl HubWorker for Box<dyn HubWorker> {
    fn export_state(&self) -> Bytes {
        (**self).export_state()
    }

    fn adopt_state(&mut self, state: Bytes) {
        (**self).adopt_state(state)
    }

    fn on_redundancy_change(&mut self, mode: RedundancyMode) {
        (**self).on_redundancy_change(mode)
    }
}

/// Spawn a worker task running the hot-swap protocol for `worker`.
///
/// Returns the mailbox handle and the join handle of the worker task.
/// The task ends when every handle clone is dropped or the task is
/// aborted by the supervisor.
pub fn spawn_worker<W: HubWorker>(
    child_id: ChildId,
    pid: Pid,
    mut worker: W,
) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WorkerMsg>(WORKER_MAILBOX_DEPTH_MAX);
    let handle = WorkerHandle::new(child_id.clone(), pid, tx);

    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::HandoverStart { child_id, state_tx } => {
                    debug!(child_id = %child_id, "worker exporting state for handover");
                    let _ = state_tx.send(worker.export_state());
                }
                WorkerMsg::Handover { state } => {
                    worker.adopt_state(state);
                }
                WorkerMsg::GetState { reply } => {
                    let _ = reply.send((child_id.clone(), worker.export_state())).await;
                }
                WorkerMsg::RedundancySignal { mode } => {
                    worker.on_redundancy_change(mode);
                }
            }
        }
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: u64,
        last_mode: Option<RedundancyMode>,
    }

    impl HubWorker for Counter {
        fn export_state(&self) -> Bytes {
            Bytes::from(self.value.to_be_bytes().to_vec())
        }

        fn adopt_state(&mut self, state: Bytes) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&state);
            self.value = u64::from_be_bytes(buf);
        }

        fn on_redundancy_change(&mut self, mode: RedundancyMode) {
            self.last_mode = Some(mode);
        }
    }

    fn test_child_id() -> ChildId {
        ChildId::new("w1").unwrap()
    }

    #[tokio::test]
    async fn test_worker_exports_state_on_handover_start() {
        let (handle, task) = spawn_worker(
            test_child_id(),
            Pid::new(1),
            Counter {
                value: 42,
                last_mode: None,
            },
        );

        let (state_tx, state_rx) = oneshot::channel();
        handle
            .send(WorkerMsg::HandoverStart {
                child_id: test_child_id(),
                state_tx,
            })
            .await;

        let state = state_rx.await.unwrap();
        assert_eq!(state, Bytes::from(42u64.to_be_bytes().to_vec()));
        task.abort();
    }

    #[tokio::test]
    async fn test_worker_adopts_state_then_reports_it() {
        let (handle, task) = spawn_worker(
            test_child_id(),
            Pid::new(2),
            Counter {
                value: 0,
                last_mode: None,
            },
        );

        handle
            .send(WorkerMsg::Handover {
                state: Bytes::from(7u64.to_be_bytes().to_vec()),
            })
            .await;

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        handle.send(WorkerMsg::GetState { reply: reply_tx }).await;

        let (cid, state) = reply_rx.recv().await.unwrap();
        assert_eq!(cid, test_child_id());
        assert_eq!(state, Bytes::from(7u64.to_be_bytes().to_vec()));
        task.abort();
    }

    #[tokio::test]
    async fn test_send_to_absent_worker_is_ignored() {
        let (handle, task) = spawn_worker(
            test_child_id(),
            Pid::new(3),
            Counter {
                value: 0,
                last_mode: None,
            },
        );
        task.abort();
        // Give the abort a chance to close the mailbox.
        tokio::task::yield_now().await;

        handle
            .send(WorkerMsg::RedundancySignal {
                mode: RedundancyMode::Active,
            })
            .await;
    }
}

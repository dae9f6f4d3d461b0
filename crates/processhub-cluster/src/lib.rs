//! ProcessHub Cluster
//!
//! The cluster coordination engine of ProcessHub: distribution-driven
//! placement realized through gossip synchronization and hot-swap
//! migration, orchestrated per hub by a coordinator.
//!
//! # Overview
//!
//! - [`Hub`]: the host-application API (start/stop children, registry
//!   reads, membership feed, hooks)
//! - [`GossipSync`]: epidemic diffusion of registry snapshots with
//!   ref-tracked acknowledgements
//! - [`HotSwapMigrator`]: live relocation of workers with optional state
//!   handover and a retention grace window
//! - [`HubCoordinator`]: reacts to membership changes and serves the
//!   wire protocol
//! - [`Transport`] / [`MemoryTransport`]: the node-to-node delivery seam
//!   and its in-process implementation

mod config;
mod coordinator;
mod error;
mod gossip;
mod hooks;
mod hub;
mod migration;
mod rpc;
mod supervisor;

pub use config::{DistributionKind, HubConfig, MigrationConfig, SyncConfig};
pub use coordinator::HubCoordinator;
pub use error::{HubError, HubResult};
pub use gossip::{
    GossipRef, GossipStats, GossipSync, PropagateOp, PropagateRound, SyncRound,
    TimestampedContribution,
};
pub use hooks::{Hook, HookCallback, HookEvent, HookRegistry};
pub use hub::{ChildStartReport, ChildStopReport, Hub, HubState};
pub use migration::{HotSwapMigrator, MigrationOutcome, MigrationPhase, MigrationRecord};
pub use rpc::{
    next_request_id, ChildStartOutcome, HubMessage, MemoryNetwork, MemoryTransport, RequestId,
    Transport, TransportHandler,
};
pub use supervisor::{ChildSupervisor, LocalSupervisor, WorkerFactory};

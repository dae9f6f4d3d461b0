//! Hub event hooks
//!
//! Host applications register callbacks per hook kind; the coordinator
//! dispatches events as they happen. Callbacks run inline on the
//! coordinator's task and must not block.

use processhub_core::child::ChildId;
use processhub_core::worker::RedundancyMode;
use processhub_registry::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Hook kinds a host application can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// A child replica started somewhere in the cluster
    ChildStarted,
    /// A child replica stopped somewhere in the cluster
    ChildStopped,
    /// A migration round finished on this node
    ChildrenMigrated,
    /// A local replica's redundancy mode changed
    RedundancySignal,
    /// A node joined the cluster view
    ClusterJoin,
    /// A node left the cluster view
    ClusterLeave,
}

/// Event payload delivered to hook callbacks.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// A replica of `child_id` started on `node`
    ChildStarted { child_id: ChildId, node: NodeId },
    /// A replica of `child_id` stopped on `node`
    ChildStopped { child_id: ChildId, node: NodeId },
    /// These children migrated toward `target`
    ChildrenMigrated {
        children: Vec<ChildId>,
        target: NodeId,
    },
    /// The local replica of `child_id` was assigned `mode`
    RedundancySignal {
        child_id: ChildId,
        mode: RedundancyMode,
    },
    /// `node` joined the view
    ClusterJoin { node: NodeId },
    /// `node` left the view
    ClusterLeave { node: NodeId },
}

impl HookEvent {
    /// The hook kind this event belongs to
    pub fn hook(&self) -> Hook {
        match self {
            Self::ChildStarted { .. } => Hook::ChildStarted,
            Self::ChildStopped { .. } => Hook::ChildStopped,
            Self::ChildrenMigrated { .. } => Hook::ChildrenMigrated,
            Self::RedundancySignal { .. } => Hook::RedundancySignal,
            Self::ClusterJoin { .. } => Hook::ClusterJoin,
            Self::ClusterLeave { .. } => Hook::ClusterLeave,
        }
    }
}

/// Registered hook callback.
pub type HookCallback = Arc<dyn Fn(HookEvent) + Send + Sync>;

/// Per-hub callback registry.
#[derive(Default)]
pub struct HookRegistry {
    callbacks: RwLock<HashMap<Hook, Vec<HookCallback>>>,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for a hook kind
    pub async fn on(&self, hook: Hook, callback: HookCallback) {
        self.callbacks
            .write()
            .await
            .entry(hook)
            .or_default()
            .push(callback);
    }

    /// Dispatch an event to every callback registered for its kind
    pub async fn dispatch(&self, event: HookEvent) {
        let callbacks = self.callbacks.read().await;
        if let Some(registered) = callbacks.get(&event.hook()) {
            for callback in registered {
                callback(event.clone());
            }
        }
    }
}

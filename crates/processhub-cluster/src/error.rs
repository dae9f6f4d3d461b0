//! Hub error types
//!
//! Errors local to a single child never poison a batch; batch results
//! enumerate per-child outcomes. Fatal conditions (duplicate hub id,
//! lifecycle misuse) abort loudly.

use processhub_core::child::Pid;
use processhub_registry::{NodeId, RegistryError};
use thiserror::Error;

/// Result type for hub operations
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Hub-level errors
#[derive(Error, Debug)]
pub enum HubError {
    /// Requested target is not a current cluster member
    #[error("node {node} is not in the cluster")]
    NotInCluster { node: String },

    /// Operation on a child the hub does not know
    #[error("unknown child: {child_id}")]
    ChildUnknown { child_id: String },

    /// Child already running; non-fatal during migration
    #[error("child {child_id} already started with {pid}")]
    ChildAlreadyStarted { child_id: String, pid: Pid },

    /// Remote or local start failed; aborts migration for this child only
    #[error("start of child {child_id} failed: {reason}")]
    StartFailed { child_id: String, reason: String },

    /// Worker did not complete handover within retention
    #[error("handover for child {child_id} timed out")]
    HandoverTimeout { child_id: String },

    /// Node cannot be reached; surfaces as a node-left event upstream
    #[error("node {node} not reachable: {reason}")]
    NodeUnreachable { node: String, reason: String },

    /// Request timed out waiting for a response
    #[error("request to {node} timed out after {timeout_ms}ms")]
    SendTimeout { node: String, timeout_ms: u64 },

    /// A hub with this id already runs in this process
    #[error("hub {hub_id} already started in this process")]
    HubAlreadyStarted { hub_id: String },

    /// Lifecycle misuse
    #[error("hub already started")]
    AlreadyStarted,

    /// Lifecycle misuse
    #[error("hub not started")]
    NotStarted,

    /// Configuration rejected at startup
    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Local supervisor collaborator failed
    #[error("supervisor failed for child {child_id}: {reason}")]
    SupervisorFailed { child_id: String, reason: String },

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] processhub_core::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    /// Create a node unreachable error
    pub fn node_unreachable(node: &NodeId, reason: impl Into<String>) -> Self {
        Self::NodeUnreachable {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a send timeout error
    pub fn send_timeout(node: &NodeId, timeout_ms: u64) -> Self {
        Self::SendTimeout {
            node: node.to_string(),
            timeout_ms,
        }
    }

    /// Create a start failed error
    pub fn start_failed(child_id: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            child_id: child_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an unknown-child error
    pub fn child_unknown(child_id: impl std::fmt::Display) -> Self {
        Self::ChildUnknown {
            child_id: child_id.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retriable through a later gossip round or
    /// membership change
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NodeUnreachable { .. } | Self::SendTimeout { .. } | Self::StartFailed { .. }
        )
    }
}

//! Registry error types

use thiserror::Error;

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Registry-specific errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Invalid node identifier
    #[error("invalid node id: {id}, reason: {reason}")]
    InvalidNodeId { id: String, reason: String },

    /// Requested node is not a current cluster member
    #[error("node {node} is not in the cluster")]
    NotInCluster { node: String },

    /// Operation on a child the registry does not know
    #[error("unknown child: {child_id}")]
    ChildUnknown { child_id: String },

    /// A child spec conflicts with the one already registered
    #[error("child {child_id} already registered with a different spec")]
    SpecMismatch { child_id: String },

    /// Replication factor outside the supported range
    #[error("replication factor {requested} outside range 1..={limit}")]
    ReplicationFactorInvalid { requested: usize, limit: usize },

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] processhub_core::Error),
}

impl RegistryError {
    /// Create a not-in-cluster error
    pub fn not_in_cluster(node: impl std::fmt::Display) -> Self {
        Self::NotInCluster {
            node: node.to_string(),
        }
    }

    /// Create an unknown-child error
    pub fn child_unknown(child_id: impl std::fmt::Display) -> Self {
        Self::ChildUnknown {
            child_id: child_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::not_in_cluster("node-9");
        assert!(err.to_string().contains("node-9"));

        let err = RegistryError::child_unknown("w1");
        assert!(err.to_string().contains("w1"));
    }
}

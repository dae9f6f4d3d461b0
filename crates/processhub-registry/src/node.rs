//! Node identity
//!
//! Node ids are opaque strings with a lexicographic total order. The
//! order is load-bearing: restricted gossip initiation and redundancy
//! ranking both pick "the first node" by this ordering, so it must be
//! identical on every member.

use crate::error::{RegistryError, RegistryResult};
use processhub_core::constants::NODE_ID_LENGTH_BYTES_MAX;
use processhub_core::io::RngProvider;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a cluster node
///
/// Node ids should be stable across restarts for the same physical node,
/// typically derived from hostname or configured explicitly.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId with validation
    ///
    /// # Errors
    /// Returns error if the id is empty, too long, or contains invalid
    /// characters (allowed: alphanumeric, dash, underscore, dot).
    pub fn new(id: impl Into<String>) -> RegistryResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(RegistryError::InvalidNodeId {
                id,
                reason: "node id cannot be empty".into(),
            });
        }

        if id.len() > NODE_ID_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidNodeId {
                id: id.clone(),
                reason: format!(
                    "node id length {} exceeds limit {}",
                    id.len(),
                    NODE_ID_LENGTH_BYTES_MAX
                ),
            });
        }

        let valid = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid {
            return Err(RegistryError::InvalidNodeId {
                id,
                reason: "node id contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    /// Create a NodeId without validation (for internal use)
    ///
    /// # Safety
    /// Caller must ensure the id is valid.
    #[doc(hidden)]
    pub fn new_unchecked(id: String) -> Self {
        debug_assert!(!id.is_empty());
        debug_assert!(id.len() <= NODE_ID_LENGTH_BYTES_MAX);
        Self(id)
    }

    /// Get the node id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a node id from the hostname plus a random suffix
    pub fn generate(rng: &dyn RngProvider) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let suffix = rng.next_u64() as u32;
        let id = format!("{}-{:08x}", host, suffix);

        let truncated = if id.len() > NODE_ID_LENGTH_BYTES_MAX {
            id[..NODE_ID_LENGTH_BYTES_MAX].to_string()
        } else {
            id
        };

        Self::new_unchecked(truncated)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processhub_core::io::StdRng;

    #[test]
    fn test_node_id_valid() {
        let id = NodeId::new("node-a").unwrap();
        assert_eq!(id.as_str(), "node-a");
        assert_eq!(format!("{}", id), "node-a");
    }

    #[test]
    fn test_node_id_invalid() {
        assert!(matches!(
            NodeId::new(""),
            Err(RegistryError::InvalidNodeId { .. })
        ));
        assert!(NodeId::new("node/a").is_err());
        assert!(NodeId::new("a".repeat(NODE_ID_LENGTH_BYTES_MAX + 1)).is_err());
    }

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let a = NodeId::new("alpha").unwrap();
        let b = NodeId::new("bravo").unwrap();
        let c = NodeId::new("charlie").unwrap();

        let mut nodes = vec![c.clone(), a.clone(), b.clone()];
        nodes.sort();
        assert_eq!(nodes, vec![a, b, c]);
    }

    #[test]
    fn test_node_id_generate() {
        let rng = StdRng::with_seed(3);
        let a = NodeId::generate(&rng);
        let b = NodeId::generate(&rng);
        assert_ne!(a, b);
        assert!(a.as_str().len() <= NODE_ID_LENGTH_BYTES_MAX);
    }
}

//! Hub and child identity types
//!
//! Explicit validation on construction, immutable after creation.

use crate::constants::{CHILD_ID_LENGTH_BYTES_MAX, HUB_ID_LENGTH_BYTES_MAX};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

fn valid_chars(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

// =============================================================================
// HubId
// =============================================================================

/// Name of one logical hub.
///
/// Multiple hubs may coexist in one process; they share nothing. A hub id
/// scopes every registry entry, gossip round, and migration.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct HubId(String);

impl HubId {
    /// Create a new HubId with validation
    ///
    /// # Errors
    /// Returns error if the id is empty, too long, or contains invalid characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidHubId {
                id,
                reason: "hub id cannot be empty".into(),
            });
        }

        if id.len() > HUB_ID_LENGTH_BYTES_MAX {
            return Err(Error::InvalidHubId {
                id: id.clone(),
                reason: format!(
                    "hub id length {} exceeds limit {}",
                    id.len(),
                    HUB_ID_LENGTH_BYTES_MAX
                ),
            });
        }

        if !valid_chars(&id) {
            return Err(Error::InvalidHubId {
                id,
                reason: "hub id contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    /// Get the hub id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for HubId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// ChildId
// =============================================================================

/// Stable identifier of a child worker, unique within its hub.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChildId(String);

impl ChildId {
    /// Create a new ChildId with validation
    ///
    /// # Errors
    /// Returns error if the id is empty, too long, or contains invalid characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::invalid_child_id(id, "child id cannot be empty"));
        }

        if id.len() > CHILD_ID_LENGTH_BYTES_MAX {
            return Err(Error::ChildIdTooLong {
                length: id.len(),
                limit: CHILD_ID_LENGTH_BYTES_MAX,
            });
        }

        if !valid_chars(&id) {
            return Err(Error::invalid_child_id(
                id,
                "child id contains invalid characters",
            ));
        }

        Ok(Self(id))
    }

    /// Create a ChildId without validation (for internal use)
    ///
    /// # Safety
    /// Caller must ensure the id is valid.
    #[doc(hidden)]
    pub fn new_unchecked(id: String) -> Self {
        debug_assert!(!id.is_empty());
        debug_assert!(id.len() <= CHILD_ID_LENGTH_BYTES_MAX);
        Self(id)
    }

    /// Get the child id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ChildId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Pid
// =============================================================================

/// Opaque handle of a running replica, minted by the supervising node.
///
/// A pid only identifies a worker on the node that asserted it; remote
/// nodes treat it as a token for equality checks and display.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Pid(u64);

impl Pid {
    /// Wrap a raw pid token
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw token
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid-{:012x}", self.0)
    }
}

// =============================================================================
// ChildSpec
// =============================================================================

/// Immutable description of how to start a child.
///
/// `start_params` is opaque payload understood only by the local
/// supervisor collaborator; the hub never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Unique child identifier
    pub id: ChildId,
    /// Opaque start payload for the supervisor
    pub start_params: Bytes,
}

impl ChildSpec {
    /// Create a new child spec
    pub fn new(id: ChildId, start_params: Bytes) -> Self {
        Self { id, start_params }
    }

    /// Create a spec with empty start params
    pub fn bare(id: ChildId) -> Self {
        Self {
            id,
            start_params: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_id_valid() {
        let id = HubId::new("orders-hub").unwrap();
        assert_eq!(id.as_str(), "orders-hub");
        assert_eq!(format!("{}", id), "orders-hub");
    }

    #[test]
    fn test_hub_id_invalid() {
        assert!(HubId::new("").is_err());
        assert!(HubId::new("a b").is_err());
        assert!(HubId::new("a".repeat(HUB_ID_LENGTH_BYTES_MAX + 1)).is_err());
    }

    #[test]
    fn test_child_id_valid() {
        let id = ChildId::new("worker-1").unwrap();
        assert_eq!(id.as_str(), "worker-1");
    }

    #[test]
    fn test_child_id_invalid_empty() {
        assert!(matches!(
            ChildId::new(""),
            Err(Error::InvalidChildId { .. })
        ));
    }

    #[test]
    fn test_child_id_too_long() {
        let long = "a".repeat(CHILD_ID_LENGTH_BYTES_MAX + 1);
        assert!(matches!(
            ChildId::new(long),
            Err(Error::ChildIdTooLong { .. })
        ));
    }

    #[test]
    fn test_child_id_invalid_chars() {
        assert!(ChildId::new("w/1").is_err());
    }

    #[test]
    fn test_pid_display() {
        let pid = Pid::new(0xabc);
        assert_eq!(format!("{}", pid), "pid-000000000abc");
    }

    #[test]
    fn test_child_spec() {
        let spec = ChildSpec::bare(ChildId::new("w1").unwrap());
        assert!(spec.start_params.is_empty());

        let spec = ChildSpec::new(ChildId::new("w2").unwrap(), Bytes::from_static(b"cfg"));
        assert_eq!(spec.start_params, Bytes::from_static(b"cfg"));
    }
}

//! Redundancy strategy
//!
//! Decides, among the replicas of one child, which is active and which
//! are passive, and re-decides every time the child's locations change.

use crate::error::{RegistryError, RegistryResult};
use crate::node::NodeId;
use processhub_core::child::Pid;
use processhub_core::constants::REPLICATION_FACTOR_MAX;
use processhub_core::worker::RedundancyMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replica mode assignment for one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyStrategy {
    replication_factor: usize,
}

impl Default for RedundancyStrategy {
    fn default() -> Self {
        Self {
            replication_factor: 1,
        }
    }
}

impl RedundancyStrategy {
    /// Create a strategy with the given replication factor
    ///
    /// # Errors
    /// Returns error unless `1 <= replication_factor <= REPLICATION_FACTOR_MAX`.
    pub fn new(replication_factor: usize) -> RegistryResult<Self> {
        if replication_factor == 0 || replication_factor > REPLICATION_FACTOR_MAX {
            return Err(RegistryError::ReplicationFactorInvalid {
                requested: replication_factor,
                limit: REPLICATION_FACTOR_MAX,
            });
        }
        Ok(Self { replication_factor })
    }

    /// The number of replicas this strategy maintains per child
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Assign a mode to every current replica of one child.
    ///
    /// `owners` is the distribution strategy's ordered owner list; the
    /// first owner actually hosting a replica is active, every other
    /// replica passive. A replica running on a node outside the owner
    /// list (possible mid-migration) stays passive. If no owner hosts a
    /// replica yet, the lexicographically first replica is promoted so
    /// exactly one active exists whenever any replica runs.
    pub fn assign_modes(
        &self,
        owners: &[NodeId],
        locations: &BTreeMap<NodeId, Pid>,
    ) -> Vec<(NodeId, Pid, RedundancyMode)> {
        if locations.is_empty() {
            return Vec::new();
        }

        let active_node = owners
            .iter()
            .find(|owner| locations.contains_key(*owner))
            .cloned()
            .unwrap_or_else(|| {
                // BTreeMap iterates in node order; unwrap is safe because
                // locations is non-empty.
                locations.keys().next().cloned().unwrap()
            });

        locations
            .iter()
            .map(|(node, pid)| {
                let mode = if *node == active_node {
                    RedundancyMode::Active
                } else {
                    RedundancyMode::Passive
                };
                (node.clone(), *pid, mode)
            })
            .collect()
    }
}

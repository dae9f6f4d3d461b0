//! ProcessHub Registry
//!
//! Cluster view, per-node registry, and placement strategies for
//! ProcessHub.
//!
//! # Overview
//!
//! This crate provides:
//! - `NodeId` and the per-hub `ClusterView` membership snapshot
//! - `LocalRegistry`: the child -> locations mapping each node publishes
//!   and converges through gossip
//! - Distribution strategies (consistent-hash ring, uniform, guided)
//! - The redundancy strategy that ranks replicas active/passive

mod distribution;
mod error;
mod node;
mod redundancy;
mod registry;
mod view;

pub use distribution::{
    DistributionStrategy, GuidedDistribution, HashRingDistribution, UniformDistribution,
};
pub use error::{RegistryError, RegistryResult};
pub use node::NodeId;
pub use redundancy::RedundancyStrategy;
pub use registry::{LocalRegistry, NodeContribution, RegistryDelta, RegistryEntry};
pub use view::{ClusterView, MembershipEvent};

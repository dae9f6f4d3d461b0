//! Hub configuration
//!
//! Explicit configuration with bounded values; one `HubConfig` per hub.

use crate::error::{HubError, HubResult};
use processhub_core::child::{ChildId, HubId};
use processhub_core::constants::{
    MIGRATION_TIMEOUT_MS_DEFAULT, REPLICATION_FACTOR_MAX, RETENTION_MS_DEFAULT,
    SHUTDOWN_HANDOVER_TIMEOUT_MS_DEFAULT, SYNC_FANOUT_DEFAULT, SYNC_INTERVAL_MS_DEFAULT,
};
use processhub_registry::{
    DistributionStrategy, GuidedDistribution, HashRingDistribution, NodeId, UniformDistribution,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Gossip synchronization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between gossip rounds in milliseconds
    pub sync_interval_ms: u64,
    /// Number of recipients per forwarding step
    pub fanout: usize,
    /// If true, only the first node in sort order initiates rounds
    pub restricted_init: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: SYNC_INTERVAL_MS_DEFAULT,
            fanout: SYNC_FANOUT_DEFAULT,
            restricted_init: true,
        }
    }
}

impl SyncConfig {
    /// Sync interval as a Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Hot-swap migration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Grace window before force-terminating a migrating child
    pub retention_ms: u64,
    /// Whether to transfer in-memory worker state
    pub handover: bool,
    /// Per-child timeout for the remote start
    pub migration_timeout_ms: u64,
    /// Window for collecting worker states at graceful shutdown
    pub shutdown_handover_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retention_ms: RETENTION_MS_DEFAULT,
            handover: false,
            migration_timeout_ms: MIGRATION_TIMEOUT_MS_DEFAULT,
            shutdown_handover_timeout_ms: SHUTDOWN_HANDOVER_TIMEOUT_MS_DEFAULT,
        }
    }
}

impl MigrationConfig {
    /// Retention window as a Duration
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Remote start timeout as a Duration
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    /// Shutdown handover window as a Duration
    pub fn shutdown_handover_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_handover_timeout_ms)
    }
}

/// Which distribution strategy the hub uses
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistributionKind {
    /// Consistent-hash ring (default)
    #[default]
    ConsistentHash,
    /// Modulo hashing over the sorted node list
    Uniform,
    /// Operator-pinned placement table with ring fallback
    Guided {
        /// Explicit child -> owners table
        table: HashMap<ChildId, Vec<NodeId>>,
    },
}

impl DistributionKind {
    /// Build the strategy this kind names
    pub fn build(&self) -> Arc<dyn DistributionStrategy> {
        match self {
            Self::ConsistentHash => Arc::new(HashRingDistribution::new()),
            Self::Uniform => Arc::new(UniformDistribution::new()),
            Self::Guided { table } => Arc::new(GuidedDistribution::new(table.clone())),
        }
    }
}

/// Per-hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Name of this hub
    pub hub_id: HubId,
    /// Replicas per child
    pub replication_factor: usize,
    /// Gossip parameters
    pub sync: SyncConfig,
    /// Migration parameters
    pub migration: MigrationConfig,
    /// Distribution strategy selection
    pub distribution: DistributionKind,
}

impl HubConfig {
    /// Create a configuration with defaults for the given hub
    pub fn new(hub_id: HubId) -> Self {
        Self {
            hub_id,
            replication_factor: 1,
            sync: SyncConfig::default(),
            migration: MigrationConfig::default(),
            distribution: DistributionKind::default(),
        }
    }

    /// Set the replication factor
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Set the gossip parameters
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Set the migration parameters
    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Enable state handover on migration and shutdown
    pub fn with_handover(mut self) -> Self {
        self.migration.handover = true;
        self
    }

    /// Set the distribution strategy
    pub fn with_distribution(mut self, distribution: DistributionKind) -> Self {
        self.distribution = distribution;
        self
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> HubResult<()> {
        if self.replication_factor == 0 || self.replication_factor > REPLICATION_FACTOR_MAX {
            return Err(HubError::InvalidConfiguration {
                field: "replication_factor".into(),
                reason: format!("must be in 1..={}", REPLICATION_FACTOR_MAX),
            });
        }

        if self.sync.sync_interval_ms == 0 {
            return Err(HubError::InvalidConfiguration {
                field: "sync.sync_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }

        if self.sync.fanout == 0 {
            return Err(HubError::InvalidConfiguration {
                field: "sync.fanout".into(),
                reason: "must be positive".into(),
            });
        }

        if self.migration.migration_timeout_ms == 0 {
            return Err(HubError::InvalidConfiguration {
                field: "migration.migration_timeout_ms".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(())
    }

    /// Configuration for tests: short intervals, unrestricted initiation
    pub fn for_testing(hub_id: HubId) -> Self {
        Self {
            hub_id,
            replication_factor: 1,
            sync: SyncConfig {
                sync_interval_ms: 100,
                fanout: 3,
                restricted_init: false,
            },
            migration: MigrationConfig {
                retention_ms: 200,
                handover: false,
                migration_timeout_ms: 1000,
                shutdown_handover_timeout_ms: 500,
            },
            distribution: DistributionKind::ConsistentHash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_id() -> HubId {
        HubId::new("test-hub").unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = HubConfig::new(hub_id());
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.sync.sync_interval_ms, SYNC_INTERVAL_MS_DEFAULT);
        assert_eq!(config.sync.fanout, SYNC_FANOUT_DEFAULT);
        assert!(config.sync.restricted_init);
        assert!(!config.migration.handover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builders() {
        let config = HubConfig::new(hub_id())
            .with_replication_factor(2)
            .with_handover()
            .with_distribution(DistributionKind::Uniform);

        assert_eq!(config.replication_factor, 2);
        assert!(config.migration.handover);
        assert!(matches!(config.distribution, DistributionKind::Uniform));
    }

    #[test]
    fn test_config_validation() {
        let mut config = HubConfig::new(hub_id());
        config.replication_factor = 0;
        assert!(matches!(
            config.validate(),
            Err(HubError::InvalidConfiguration { .. })
        ));

        let mut config = HubConfig::new(hub_id());
        config.sync.fanout = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::new(hub_id());
        config.replication_factor = REPLICATION_FACTOR_MAX + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_distribution_kind_builds() {
        assert_eq!(
            DistributionKind::ConsistentHash.build().name(),
            "consistent_hash"
        );
        assert_eq!(DistributionKind::Uniform.build().name(), "uniform");

        let guided = DistributionKind::Guided {
            table: HashMap::new(),
        };
        assert_eq!(guided.build().name(), "guided");
    }

    #[test]
    fn test_durations() {
        let config = HubConfig::for_testing(hub_id());
        assert_eq!(config.sync.sync_interval(), Duration::from_millis(100));
        assert_eq!(config.migration.retention(), Duration::from_millis(200));
        assert!(config.migration.migration_timeout() > Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}

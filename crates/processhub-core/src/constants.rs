//! Explicit limits for ProcessHub
//!
//! All limits use big-endian naming (most significant first) and carry
//! their unit in the name.

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum length of a hub identifier in bytes
pub const HUB_ID_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a child identifier in bytes
pub const CHILD_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a node identifier in bytes
pub const NODE_ID_LENGTH_BYTES_MAX: usize = 128;

// =============================================================================
// Cluster Limits
// =============================================================================

/// Maximum number of nodes in a hub cluster
pub const CLUSTER_NODES_COUNT_MAX: usize = 1000;

/// Maximum replication factor for a single child
pub const REPLICATION_FACTOR_MAX: usize = 16;

/// Virtual nodes per physical node on the consistent-hash ring
pub const HASH_RING_VNODES_COUNT: usize = 64;

// =============================================================================
// Worker Limits
// =============================================================================

/// Maximum size of a worker's handover state in bytes (10 MiB)
pub const WORKER_STATE_SIZE_BYTES_MAX: usize = 10 * 1024 * 1024;

/// Maximum depth of a worker mailbox
pub const WORKER_MAILBOX_DEPTH_MAX: usize = 10_000;

// =============================================================================
// Timing Defaults
// =============================================================================

/// Default interval between gossip synchronization rounds (15 sec)
pub const SYNC_INTERVAL_MS_DEFAULT: u64 = 15 * 1000;

/// Default number of gossip recipients per forwarding step
pub const SYNC_FANOUT_DEFAULT: usize = 3;

/// Default timeout for a remote child start during migration (15 sec)
pub const MIGRATION_TIMEOUT_MS_DEFAULT: u64 = 15 * 1000;

/// Default retention grace window before force-terminating a migrating child (5 sec)
pub const RETENTION_MS_DEFAULT: u64 = 5 * 1000;

/// Default window for collecting worker states during graceful shutdown (5 sec)
pub const SHUTDOWN_HANDOVER_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(CLUSTER_NODES_COUNT_MAX >= 1);
    assert!(REPLICATION_FACTOR_MAX >= 1);
    assert!(HASH_RING_VNODES_COUNT >= 1);
    assert!(SYNC_FANOUT_DEFAULT >= 1);
    assert!(RETENTION_MS_DEFAULT <= MIGRATION_TIMEOUT_MS_DEFAULT);
    assert!(WORKER_STATE_SIZE_BYTES_MAX <= 100 * 1024 * 1024);
};

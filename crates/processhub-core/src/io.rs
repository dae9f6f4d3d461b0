//! I/O abstraction layer
//!
//! All non-deterministic inputs (time, randomness) go through these
//! traits so the same coordination logic runs in production and under
//! simulated clocks in tests. Gossip timestamps are microseconds from
//! the contributing node's clock; skew up to one sync interval is
//! tolerated because merges are per-contributing-node.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Time Provider
// ============================================================================

/// Time provider abstraction
///
/// Code that needs current time or sleep must use this trait rather than
/// `SystemTime::now()` directly.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Get current time in microseconds since epoch
    fn now_us(&self) -> u64;

    /// Get current time in milliseconds since epoch
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    /// Sleep for the specified duration
    async fn sleep_ms(&self, ms: u64);
}

/// Production time provider using the system clock
#[derive(Debug, Clone, Default)]
pub struct WallClock;

impl WallClock {
    /// Create a new wall clock time provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

/// Manually-advanced clock for tests
#[derive(Debug)]
pub struct MockClock {
    time_us: AtomicU64,
}

impl MockClock {
    /// Create a mock clock starting at the given microsecond timestamp
    pub fn new(initial_us: u64) -> Self {
        Self {
            time_us: AtomicU64::new(initial_us),
        }
    }

    /// Advance time by the given microseconds
    pub fn advance_us(&self, us: u64) {
        self.time_us.fetch_add(us, Ordering::SeqCst);
    }

    /// Set time to a specific value
    pub fn set_us(&self, us: u64) {
        self.time_us.store(us, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for MockClock {
    fn now_us(&self) -> u64 {
        self.time_us.load(Ordering::SeqCst)
    }

    async fn sleep_ms(&self, ms: u64) {
        // Advance simulated time; yield so other tasks can observe it.
        self.advance_us(ms * 1000);
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// RNG Provider
// ============================================================================

/// Random number generator abstraction
///
/// Used for gossip fanout sampling and pid minting. Not cryptographically
/// secure.
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random usize in range [0, bound)
    fn gen_index(&self, bound: usize) -> usize {
        assert!(bound > 0, "bound must be positive");
        (self.next_u64() % bound as u64) as usize
    }
}

/// Production RNG using an atomic xorshift64* state
///
/// Lock-free and thread-safe; seedable for reproducible tests.
#[derive(Debug)]
pub struct StdRng {
    state: AtomicU64,
}

impl Default for StdRng {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRng {
    /// Create a new RNG seeded from the system clock
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            | 1;

        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Create with a specific seed (for testing)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed | 1),
        }
    }
}

impl RngProvider for StdRng {
    fn next_u64(&self) -> u64 {
        // xorshift64* over a CAS loop
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;

            match self.state.compare_exchange_weak(
                state,
                x,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return x.wrapping_mul(0x2545_F491_4F6C_DD1D),
                Err(s) => state = s,
            }
        }
    }
}

// ============================================================================
// I/O Context
// ============================================================================

/// Bundle of all I/O providers
///
/// Pass this through the hub instead of individual providers; swap the
/// members for mock implementations in tests.
#[derive(Debug, Clone)]
pub struct IoContext {
    /// Time provider
    pub time: Arc<dyn TimeProvider>,
    /// RNG provider
    pub rng: Arc<dyn RngProvider>,
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Create production I/O context with the real wall clock and RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClock::new()),
            rng: Arc::new(StdRng::new()),
        }
    }

    /// Create a deterministic context for tests
    pub fn deterministic(clock: Arc<MockClock>, seed: u64) -> Self {
        Self {
            time: clock,
            rng: Arc::new(StdRng::with_seed(seed)),
        }
    }
}

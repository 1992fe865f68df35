//! Lock and semaphore manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default read quorum fraction.
pub const DEFAULT_RQUORUM: f64 = 0.51;
/// Default write quorum fraction.
pub const DEFAULT_WQUORUM: f64 = 0.51;
/// Default replica count used for quorum targets.
pub const DEFAULT_LOCK_RFACTOR: usize = 3;
/// Default lower bound for retry back-off.
pub const MIN_WAIT_TIMEOUT_MS: u64 = 10;
/// Default upper bound for retry back-off.
pub const MAX_WAIT_TIMEOUT_MS: u64 = 100;
/// Default per-request deadline for lock and semaphore calls.
pub const REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Distributed lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Fraction of replicas that must grant a read lock.
    pub rquorum: f64,

    /// Fraction of replicas that must grant a write lock.
    pub wquorum: f64,

    /// Replica count per lock id. Distinct from the ring's virtual-copy
    /// factor.
    pub rfactor: usize,

    /// Lower bound of the uniform-random retry back-off.
    pub min_wait_timeout: Duration,

    /// Upper bound of the uniform-random retry back-off.
    pub max_wait_timeout: Duration,

    /// Default deadline for one quorum round trip.
    pub request_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            rquorum: DEFAULT_RQUORUM,
            wquorum: DEFAULT_WQUORUM,
            rfactor: DEFAULT_LOCK_RFACTOR,
            min_wait_timeout: Duration::from_millis(MIN_WAIT_TIMEOUT_MS),
            max_wait_timeout: Duration::from_millis(MAX_WAIT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }
}

impl LockConfig {
    /// Sets the read quorum fraction.
    pub fn with_rquorum(mut self, rquorum: f64) -> Self {
        self.rquorum = rquorum;
        self
    }

    /// Sets the write quorum fraction.
    pub fn with_wquorum(mut self, wquorum: f64) -> Self {
        self.wquorum = wquorum;
        self
    }

    /// Sets the replica count per lock id.
    pub fn with_rfactor(mut self, rfactor: usize) -> Self {
        self.rfactor = rfactor;
        self
    }

    /// Sets the retry back-off bounds.
    pub fn with_wait_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_wait_timeout = min;
        self.max_wait_timeout = max;
        self
    }
}

/// Distributed semaphore manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    /// Lower bound of the uniform-random retry back-off.
    pub min_wait_timeout: Duration,

    /// Upper bound of the uniform-random retry back-off.
    pub max_wait_timeout: Duration,

    /// Default deadline for one owner round trip.
    pub request_timeout: Duration,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            min_wait_timeout: Duration::from_millis(MIN_WAIT_TIMEOUT_MS),
            max_wait_timeout: Duration::from_millis(MAX_WAIT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }
}

impl SemaphoreConfig {
    /// Sets the retry back-off bounds.
    pub fn with_wait_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_wait_timeout = min;
        self.max_wait_timeout = max;
        self
    }
}

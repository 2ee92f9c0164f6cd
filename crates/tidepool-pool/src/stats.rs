//! Pool statistics types

use serde::{Deserialize, Serialize};

/// Snapshot of a connection pool's current state
///
/// Provides insight into pool utilization and saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total number of live connections (idle + checked out)
    total: usize,
    /// Number of idle connections available in the pool
    idle: usize,
    /// Number of connections currently borrowed
    checked_out: usize,
    /// Number of callers waiting in `acquire`
    waiting: usize,
}

impl PoolStats {
    /// Create new pool statistics
    pub fn new(total: usize, idle: usize, checked_out: usize, waiting: usize) -> Self {
        Self {
            total,
            idle,
            checked_out,
            waiting,
        }
    }

    /// Get the total number of live connections
    pub fn total(&self) -> usize {
        self.total
    }

    /// Get the number of idle connections
    pub fn idle(&self) -> usize {
        self.idle
    }

    /// Get the number of checked-out (borrowed) connections
    pub fn checked_out(&self) -> usize {
        self.checked_out
    }

    /// Get the number of waiting callers
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Calculate pool utilization as a fraction (0.0 to 1.0)
    ///
    /// Returns 0.0 if no connections are live.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.checked_out as f64 / self.total as f64
        }
    }

    /// Check if every live connection is currently borrowed
    pub fn is_saturated(&self) -> bool {
        self.idle == 0 && self.total > 0
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

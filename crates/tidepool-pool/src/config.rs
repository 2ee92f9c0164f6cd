//! Pool configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a connection pool
///
/// Controls pool sizing, timeouts, and the health-check trust window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections eagerly created on first use
    min_size: usize,
    /// Maximum number of live connections allowed in the pool
    max_size: usize,
    /// Timeout in milliseconds when acquiring a connection from the pool
    connect_timeout_ms: u64,
    /// Timeout in milliseconds before an idle connection is retired
    idle_timeout_ms: u64,
    /// Timeout in milliseconds for a single create/probe/close operation
    operation_timeout_ms: u64,
    /// Window in milliseconds during which a recently used connection is
    /// handed out again without an active probe
    health_check_interval_ms: u64,
}

impl PoolConfig {
    /// Create a new pool configuration with the given min and max sizes
    ///
    /// # Panics
    ///
    /// Panics if `min_size > max_size` or if `max_size` is 0.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        assert!(
            max_size > 0,
            "max_size must be greater than 0, got {}",
            max_size
        );
        assert!(
            min_size <= max_size,
            "min_size ({}) cannot exceed max_size ({})",
            min_size,
            max_size
        );

        Self {
            min_size,
            max_size,
            connect_timeout_ms: 30_000,       // 30 seconds default
            idle_timeout_ms: 600_000,         // 10 minutes default
            operation_timeout_ms: 5_000,      // 5 seconds default
            health_check_interval_ms: 30_000, // 30 seconds default
        }
    }

    /// Set the connect (acquire wait) timeout in milliseconds
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn with_idle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Set the per-operation (create/probe/close) timeout in milliseconds
    pub fn with_operation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout_ms = timeout_ms;
        self
    }

    /// Set the health-check trust window in milliseconds
    ///
    /// A connection idle less than this long is handed out without an
    /// active probe. Shorter windows detect dead connections faster at the
    /// cost of extra round-trips.
    pub fn with_health_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.health_check_interval_ms = interval_ms;
        self
    }

    /// Get the warm-up target size
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Get the maximum pool size
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Get the connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the idle timeout as a Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Get the per-operation timeout as a Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Get the health-check trust window as a Duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl Default for PoolConfig {
    /// Create a default pool configuration
    ///
    /// Defaults:
    /// - min_size: 1
    /// - max_size: 10
    /// - connect_timeout: 30 seconds
    /// - idle_timeout: 10 minutes
    /// - operation_timeout: 5 seconds
    /// - health_check_interval: 30 seconds
    fn default() -> Self {
        Self::new(1, 10)
    }
}

//! Tracked pool entry wrapping a raw driver connection

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidepool_core::{PoolResult, RawConnection};
use uuid::Uuid;

use crate::ping::ping_connection;

/// Lifecycle state of a pooled connection
///
/// Encoded as an explicit tri-state rather than an optional timestamp so
/// that every transition is visible to the type checker. `Retired` is
/// terminal: a retired connection has had its physical handle closed and
/// never re-enters the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Sitting in the idle queue, available for hand-out
    Idle {
        /// When the connection entered the idle queue
        since: Instant,
    },
    /// Exclusively held by one borrower
    InUse,
    /// Permanently removed from the pool; physical handle closed
    Retired,
}

/// A connection tracked by the pool
///
/// Wraps the raw driver connection with identity, lifecycle state, and
/// idempotent close semantics. Created only by the pool; callers see it
/// through the `PooledConnection` borrow guard.
pub struct PoolConnection {
    id: Uuid,
    raw: Arc<dyn RawConnection>,
    state: ConnState,
    healthy: bool,
}

impl PoolConnection {
    /// Wrap a freshly created raw connection, starting life idle and healthy.
    pub(crate) fn new(raw: Arc<dyn RawConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw,
            state: ConnState::Idle {
                since: Instant::now(),
            },
            healthy: true,
        }
    }

    /// Process-unique identifier, assigned at creation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying raw connection
    pub fn raw(&self) -> &Arc<dyn RawConnection> {
        &self.raw
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether the most recent probe or reset succeeded
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// How long the connection has been idle, if it is idle
    pub fn idle_for(&self) -> Option<Duration> {
        match self.state {
            ConnState::Idle { since } => Some(since.elapsed()),
            ConnState::InUse | ConnState::Retired => None,
        }
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = ConnState::InUse;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnState::Idle {
            since: Instant::now(),
        };
    }

    /// One-way transition; used by the pool after any failed operation on
    /// this connection. An unhealthy connection is always retired.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Active liveness probe, bounded by `limit`.
    ///
    /// Updates the health flag with the outcome.
    pub async fn is_alive(&mut self, limit: Duration) -> bool {
        let alive = matches!(
            tokio::time::timeout(limit, ping_connection(self.raw.as_ref())).await,
            Ok(Ok(_))
        );
        if !alive {
            self.healthy = false;
        }
        alive
    }

    /// Clear transient session state via the driver.
    pub async fn reset(&mut self) -> PoolResult<()> {
        match self.raw.reset().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.healthy = false;
                Err(e)
            }
        }
    }

    /// Close the physical connection. Idempotent: a second call is a no-op.
    pub async fn close(&mut self) {
        if self.state == ConnState::Retired {
            return;
        }
        self.state = ConnState::Retired;
        if let Err(e) = self.raw.close().await {
            tracing::debug!(id = %self.id, error = %e, "error closing connection");
        }
    }
}

impl fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.id)
            .field("driver", &self.raw.driver_name())
            .field("state", &self.state)
            .field("healthy", &self.healthy)
            .finish()
    }
}

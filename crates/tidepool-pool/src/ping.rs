//! Connection liveness probe
//!
//! Runs the driver's cheap no-op query and measures the round-trip time.
//! Used by the pool for pre-hand-out health checks.

use std::time::{Duration, Instant};

use tidepool_core::RawConnection;

/// Result of a ping operation
pub type PingResult = Result<Duration, PingError>;

/// Error that can occur during a ping operation
#[derive(Debug, Clone)]
pub enum PingError {
    /// The connection is closed
    ConnectionClosed,
    /// The probe query failed
    ProbeFailed(String),
}

impl std::fmt::Display for PingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PingError::ConnectionClosed => write!(f, "Connection is closed"),
            PingError::ProbeFailed(msg) => write!(f, "Probe query failed: {}", msg),
        }
    }
}

impl std::error::Error for PingError {}

/// Ping a raw connection to check that it is alive.
///
/// Returns the round-trip time on success. A closed connection fails
/// without touching the driver.
pub async fn ping_connection(conn: &dyn RawConnection) -> PingResult {
    if conn.is_closed() {
        return Err(PingError::ConnectionClosed);
    }

    let start = Instant::now();
    match conn.ping().await {
        Ok(()) => Ok(start.elapsed()),
        Err(e) => Err(PingError::ProbeFailed(e.to_string())),
    }
}

//! Error types for tidepool

use std::time::Duration;

use thiserror::Error;

/// Error type for pool operations
///
/// `acquire()` surfaces exactly two of these to callers: `ConnectTimeout`
/// and `PoolClosed`. The remaining variants exist for driver and factory
/// implementations; inside the pool they are caught and resolved by
/// retiring the affected connection.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool was at capacity and no connection became available before
    /// the connect timeout expired.
    #[error("timed out waiting for a connection after {waited:?}")]
    ConnectTimeout {
        /// How long the caller actually waited before giving up
        waited: Duration,
    },

    /// The pool has been closed; no further connections will be handed out.
    #[error("pool is closed")]
    PoolClosed,

    /// The connection factory failed to produce a usable connection.
    #[error("failed to create connection: {0}")]
    ConnectionCreate(String),

    /// A driver-level operation (query, reset, close) failed.
    #[error("driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

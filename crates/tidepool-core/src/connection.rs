//! The raw connection contract between the pool and a database driver

use crate::PoolResult;
use async_trait::async_trait;

/// A raw physical connection to a backing store
///
/// This is the entire surface the pool needs from a driver: a cheap
/// liveness probe, a way to clear transient session state between
/// borrowers, and a close. Everything else a driver offers (queries,
/// transactions, prepared statements) is out of the pool's sight.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "duckdb", "mysql")
    fn driver_name(&self) -> &str;

    /// Cheap liveness probe, typically a no-op query like `SELECT 1`.
    ///
    /// The pool calls this before handing out a connection that has been
    /// idle longer than the trust window. A failure means the connection
    /// is retired, never that the error reaches a caller.
    async fn ping(&self) -> PoolResult<()>;

    /// Clear transient session state left over from the previous borrower.
    ///
    /// Typically rolls back any open transaction. Called by the pool on
    /// every release; a failure retires the connection instead of
    /// recycling it.
    async fn reset(&self) -> PoolResult<()>;

    /// Close the physical connection.
    ///
    /// The pool guarantees it invokes this at most once per connection;
    /// drivers do not need their own idempotence guard.
    async fn close(&self) -> PoolResult<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;
}

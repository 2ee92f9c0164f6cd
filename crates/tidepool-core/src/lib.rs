//! Tidepool Core - Boundary abstractions for the tidepool connection pool
//!
//! This crate defines the contract between the pooling engine and the
//! database drivers it manages:
//!
//! - `RawConnection` - Trait a driver connection must implement to be pooled
//! - `PoolError` / `PoolResult` - Error taxonomy surfaced by the pool
//!
//! The wire-level driver itself (sockets, file handles, SQL) lives outside
//! this workspace; the pool only ever talks to it through `RawConnection`.

mod connection;
mod error;

pub use connection::*;
pub use error::*;

//! Tidepool - Bounded async connection pooling
//!
//! This crate implements the pooling engine shared by the tidepool database
//! adapters: a bounded registry of reusable connections handed out
//! exclusively to concurrent callers, with health checking, lazy warm-up,
//! idle retirement, and a clean bounded shutdown.
//!
//! # Example
//!
//! ```ignore
//! use tidepool_pool::{ConnectionPool, PoolConfig};
//!
//! let config = PoolConfig::new(2, 16)
//!     .with_connect_timeout_ms(5_000)
//!     .with_idle_timeout_ms(300_000);
//!
//! let pool = ConnectionPool::new(config, factory);
//! let conn = pool.acquire().await?;
//! conn.raw().ping().await?;
//! conn.release().await;
//! // or let the guard drop; release happens either way
//! ```

mod config;
mod connection;
mod ping;
mod pool;
mod stats;


pub use config::PoolConfig;
pub use connection::{ConnState, PoolConnection};
pub use ping::{PingError, PingResult, ping_connection};
pub use pool::{ConnectionFactory, ConnectionPool, PooledConnection};
pub use stats::PoolStats;

//! Cached PostgreSQL connections and pools behind one configuration source.
//!
//! A [`ConnectionManager`] turns a [`ConnectionConfig`] plus a
//! [`ConnectionType`] into a shared [`Handle`]. Repeated requests with the
//! same configuration content return the same handle, built exactly once
//! even under concurrent threads or tasks.
//!
//! # Connection types
//!
//! - `normal`: one blocking connection shared by all callers
//! - `pool`: a blocking pool (`r2d2`); each thread borrows its own connection
//! - `async`: one `tokio-postgres` connection
//! - `async_pool`: an async pool (`deadpool`); each task borrows its own
//!   connection per pool
//!
//! # Example
//!
//! ```no_run
//! use pgkeeper::{ConnectionConfig, ConnectionManager, ConnectionType};
//!
//! # async fn run() -> pgkeeper::Result<()> {
//! let manager = ConnectionManager::new();
//! let config = ConnectionConfig::new(ConnectionType::AsyncPool)
//!     .with_setting("host", "localhost")
//!     .with_setting("dbname", "app");
//!
//! let handle = manager.acquire_async(&config, None).await?;
//! let Some(pool) = handle.as_async_pool() else {
//!     return Ok(());
//! };
//! pool.transaction(async {
//!     pool.execute("UPDATE jobs SET state = 'done' WHERE id = 7").await?;
//!     Ok(())
//! })
//! .await?;
//!
//! manager.clear_async().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `tls` (default): TLS for `sslmode` other than `disable`
//! - `metrics`: counters and histograms through the `metrics` facade
//! - `test-utils`: the scripted [`testing::MockDriver`]

pub mod cache;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod factory;
pub mod fingerprint;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod session;
pub mod sql;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types for convenience
pub use cache::{CacheInfo, ConnectionCache, TeardownReport};
pub use config::{ConnectionConfig, ConnectionType, PoolSettings, SettingValue, Settings};
pub use connection::{
    AsyncConnection, AsyncPoolConnection, ConnectionState, Handle, NormalConnection,
    PoolConnection, PoolStatus,
};
pub use cursor::{AsyncCursor, Cursor};
pub use driver::{PostgresDriver, QueryResult, Row};
pub use error::{Error, Result, StateError};
pub use factory::ConnectionFactory;
pub use fingerprint::Fingerprint;
pub use lifecycle::LifecycleGuard;
pub use manager::ConnectionManager;

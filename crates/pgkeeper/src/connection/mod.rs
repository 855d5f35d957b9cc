//! The four connection variants and the [`Handle`] union over them.
//!
//! | variant | scheduling | unit of work |
//! |---|---|---|
//! | [`NormalConnection`] | blocking, one connection | [`NormalConnection::transaction`] |
//! | [`PoolConnection`] | blocking pool, many threads | [`PoolConnection::transaction`], [`PoolConnection::acquire`] |
//! | [`AsyncConnection`] | async, one connection | [`AsyncConnection::transaction`] |
//! | [`AsyncPoolConnection`] | async pool, many tasks | [`AsyncPoolConnection::transaction`], [`AsyncPoolConnection::acquire`] |
//!
//! Pooled variants keep per-caller borrow records: thread-local for
//! [`PoolConnection`], task-local for [`AsyncPoolConnection`], both keyed by
//! the pool's [`InstanceId`] so nested scopes over different pools never mix.

mod async_conn;
mod async_pool;
mod normal;
mod pool;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use self::async_conn::{AsyncConnection, AsyncTransaction};
pub use self::async_pool::{AsyncPoolConnection, PooledAsyncSession};
pub use self::normal::{NormalConnection, Transaction};
pub use self::pool::{PoolConnection, PoolScope, PooledSession};
use crate::Result;
use crate::config::{ConnectionType, Settings};
use crate::driver::ConnectParams;

/// Process-unique identity of a handle.
pub type InstanceId = u64;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_instance_id() -> InstanceId {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or disconnected and reconnectable.
    Uninitialized,
    Open,
    /// Pooled variants only: at least one connection is lent out.
    Borrowed,
    /// Torn down; every further operation fails.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Open => "open",
            Self::Borrowed => "borrowed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Physical connections currently open.
    pub size: usize,
    /// Connections idle in the pool.
    pub available: usize,
    pub max_size: usize,
}

impl PoolStatus {
    pub const fn in_use(&self) -> usize {
        self.size.saturating_sub(self.available)
    }
}

/// Validated pool parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    pub min_size: u32,
    pub max_size: u32,
    pub timeout: Duration,
    pub max_idle: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub check_on_checkout: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            timeout: Duration::from_secs(30),
            max_idle: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(3600)),
            check_on_checkout: false,
        }
    }
}

impl PoolOptions {
    /// Connections held at once by `test_connection`.
    pub fn hold_count(&self) -> u32 {
        self.max_size.min(self.min_size + 1)
    }
}

/// Everything a variant needs besides its connector.
#[derive(Debug, Clone, Default)]
pub struct HandleOptions {
    pub params: ConnectParams,
    /// GUCs issued with `SET` on connect (single) or checkout (pooled).
    pub session_settings: Settings,
    pub pool: PoolOptions,
}

/// Combine the body's outcome with the commit/rollback that ended it. The
/// body's error wins; a failed commit fails an otherwise successful body.
pub(crate) fn settle<T>(body: Result<T>, end: Result<()>) -> Result<T> {
    match (body, end) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(end)) => {
            tracing::warn!(error = %end, "Rollback after failed transaction also failed");
            Err(e)
        }
    }
}

/// Lifecycle surface shared by every variant.
pub trait Lifecycle: Send + Sync {
    fn id(&self) -> InstanceId;

    fn connection_type(&self) -> ConnectionType;

    fn state(&self) -> ConnectionState;

    /// Best-effort, non-blocking-on-I/O teardown. Terminal.
    fn close(&self) -> Result<()>;
}

/// A cached handle: one of the four variants.
#[derive(Debug, Clone)]
pub enum Handle {
    Normal(Arc<NormalConnection>),
    Pool(Arc<PoolConnection>),
    Async(Arc<AsyncConnection>),
    AsyncPool(Arc<AsyncPoolConnection>),
}

impl Handle {
    fn lifecycle(&self) -> &dyn Lifecycle {
        match self {
            Self::Normal(c) => c.as_ref(),
            Self::Pool(c) => c.as_ref(),
            Self::Async(c) => c.as_ref(),
            Self::AsyncPool(c) => c.as_ref(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.lifecycle().id()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.lifecycle().connection_type()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state()
    }

    /// Same underlying instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    pub fn close(&self) -> Result<()> {
        self.lifecycle().close()
    }

    /// Teardown from async code; waits for in-flight async work to finish.
    pub async fn close_async(&self) -> Result<()> {
        match self {
            Self::Async(c) => c.disconnect_final().await,
            Self::AsyncPool(c) => c.close_pool(),
            Self::Normal(_) | Self::Pool(_) => {
                let handle = self.clone();
                tokio::task::spawn_blocking(move || handle.close())
                    .await
                    .map_err(|e| crate::Error::teardown(format!("close task failed: {e}")))?
            }
        }
    }

    pub(crate) fn connect(&self) -> Result<()> {
        match self {
            Self::Normal(c) => c.connect(),
            Self::Pool(c) => c.connect(),
            Self::Async(_) | Self::AsyncPool(_) => Err(crate::Error::config(format!(
                "'{}' handles must be connected from async code",
                self.connection_type()
            ))),
        }
    }

    pub(crate) async fn connect_async(&self) -> Result<()> {
        match self {
            Self::Async(c) => c.connect().await,
            Self::AsyncPool(c) => c.connect().await,
            Self::Normal(_) | Self::Pool(_) => Err(crate::Error::config(format!(
                "'{}' handles must be connected from blocking code",
                self.connection_type()
            ))),
        }
    }

    pub fn as_normal(&self) -> Option<&Arc<NormalConnection>> {
        match self {
            Self::Normal(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_pool(&self) -> Option<&Arc<PoolConnection>> {
        match self {
            Self::Pool(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_async(&self) -> Option<&Arc<AsyncConnection>> {
        match self {
            Self::Async(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_async_pool(&self) -> Option<&Arc<AsyncPoolConnection>> {
        match self {
            Self::AsyncPool(c) => Some(c),
            _ => None,
        }
    }
}

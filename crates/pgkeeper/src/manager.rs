//! The public registry: configuration in, shared handle out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::{CacheInfo, ConnectionCache, TeardownReport};
use crate::config::{ConnectionConfig, ConnectionType};
use crate::connection::Handle;
use crate::driver::{AsyncConnector, PostgresDriver, SyncConnector};
use crate::factory::{ConnectionFactory, prepare};
use crate::fingerprint::Fingerprint;
use crate::lifecycle::LifecycleGuard;
use crate::{Error, Result};

/// Hands out one shared handle per (configuration, connection type).
///
/// Blocking variants (`normal`, `pool`) are acquired with
/// [`ConnectionManager::acquire`], async variants (`async`, `async_pool`)
/// with [`ConnectionManager::acquire_async`]. Handles come back connected.
///
/// ```no_run
/// use pgkeeper::{ConnectionConfig, ConnectionManager, ConnectionType};
///
/// # fn main() -> pgkeeper::Result<()> {
/// let manager = ConnectionManager::new();
/// let config = ConnectionConfig::new(ConnectionType::Pool)
///     .with_setting("host", "localhost")
///     .with_setting("user", "app");
///
/// let handle = manager.acquire(&config, None)?;
/// if let Some(pool) = handle.as_pool() {
///     pool.transaction(|tx| {
///         tx.execute("INSERT INTO audit (event) VALUES ('boot')")?;
///         Ok(())
///     })?;
/// }
/// manager.clear();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConnectionManager {
    factory: ConnectionFactory,
    cache: ConnectionCache,
    exit_hook_registered: AtomicBool,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Manager over the PostgreSQL driver.
    pub fn new() -> Self {
        Self::with_drivers(Arc::new(PostgresDriver), Arc::new(PostgresDriver))
    }

    pub fn with_drivers(sync: Arc<dyn SyncConnector>, async_: Arc<dyn AsyncConnector>) -> Self {
        Self {
            factory: ConnectionFactory::new(sync, async_),
            cache: ConnectionCache::new(),
            exit_hook_registered: AtomicBool::new(false),
        }
    }

    /// Cache key for `config` acquired as `connection_type` (or its own type).
    pub fn fingerprint(
        config: &ConnectionConfig,
        connection_type: Option<ConnectionType>,
    ) -> Fingerprint {
        Fingerprint::of(config, config.resolve_type(connection_type))
    }

    /// Shared blocking handle for `config`, built and connected on first use.
    pub fn acquire(
        &self,
        config: &ConnectionConfig,
        connection_type: Option<ConnectionType>,
    ) -> Result<Handle> {
        let (fingerprint, ty) = resolve_blocking(config, connection_type)?;
        self.cache
            .get_or_build(&fingerprint, || self.build_blocking(config, ty))
    }

    /// Shared async handle for `config`, built and connected on first use.
    pub async fn acquire_async(
        &self,
        config: &ConnectionConfig,
        connection_type: Option<ConnectionType>,
    ) -> Result<Handle> {
        let (fingerprint, ty) = resolve_async(config, connection_type)?;
        self.cache
            .get_or_build_async(&fingerprint, || self.build_async(config, ty))
            .await
    }

    /// Replace the cached blocking handle with a fresh one, closing the old.
    pub fn force_reload(
        &self,
        config: &ConnectionConfig,
        connection_type: Option<ConnectionType>,
    ) -> Result<Handle> {
        let (fingerprint, ty) = resolve_blocking(config, connection_type)?;
        self.cache
            .force_reload(&fingerprint, || self.build_blocking(config, ty))
    }

    pub async fn force_reload_async(
        &self,
        config: &ConnectionConfig,
        connection_type: Option<ConnectionType>,
    ) -> Result<Handle> {
        let (fingerprint, ty) = resolve_async(config, connection_type)?;
        self.cache
            .force_reload_async(&fingerprint, || self.build_async(config, ty))
            .await
    }

    /// Cached handle, if one is ready. Never builds.
    pub fn get(&self, config: &ConnectionConfig, connection_type: Option<ConnectionType>) -> Option<Handle> {
        self.cache.get(&Self::fingerprint(config, connection_type))
    }

    /// Close every cached handle and empty the cache.
    ///
    /// Blocking: call [`ConnectionManager::clear_async`] from async code.
    pub fn clear(&self) -> TeardownReport {
        self.cache.clear()
    }

    pub async fn clear_async(&self) -> TeardownReport {
        self.cache.clear_async().await
    }

    pub fn info(&self) -> CacheInfo {
        self.cache.info()
    }

    /// Arrange for the cache to be cleared when the returned guard drops.
    ///
    /// Only the first guard per manager is armed; later calls return inert
    /// guards.
    pub fn register_exit_hook(self: &Arc<Self>) -> LifecycleGuard {
        let first = !self.exit_hook_registered.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!("Exit teardown registered");
        }
        LifecycleGuard::new(Arc::clone(self), first)
    }

    fn build_blocking(&self, config: &ConnectionConfig, ty: ConnectionType) -> Result<Handle> {
        let handle = self.factory.build(ty, prepare(config, ty)?);
        if let Err(e) = handle.connect() {
            let _ = handle.close();
            return Err(e);
        }
        Ok(handle)
    }

    async fn build_async(&self, config: &ConnectionConfig, ty: ConnectionType) -> Result<Handle> {
        let handle = self.factory.build(ty, prepare(config, ty)?);
        if let Err(e) = handle.connect_async().await {
            let _ = handle.close_async().await;
            return Err(e);
        }
        Ok(handle)
    }
}

fn resolve_blocking(
    config: &ConnectionConfig,
    connection_type: Option<ConnectionType>,
) -> Result<(Fingerprint, ConnectionType)> {
    let ty = config.resolve_type(connection_type);
    if ty.is_async() {
        return Err(Error::config(format!(
            "'{ty}' connections must be acquired with acquire_async"
        )));
    }
    Ok((Fingerprint::of(config, ty), ty))
}

fn resolve_async(
    config: &ConnectionConfig,
    connection_type: Option<ConnectionType>,
) -> Result<(Fingerprint, ConnectionType)> {
    let ty = config.resolve_type(connection_type);
    if !ty.is_async() {
        return Err(Error::config(format!(
            "'{ty}' connections must be acquired with acquire"
        )));
    }
    Ok((Fingerprint::of(config, ty), ty))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PoolSettings;
    use crate::connection::ConnectionState;
    use crate::testing::MockDriver;

    fn manager(driver: &MockDriver) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::with_drivers(
            Arc::new(driver.clone()),
            Arc::new(driver.clone()),
        ))
    }

    fn config(ty: ConnectionType) -> ConnectionConfig {
        ConnectionConfig::new(ty)
            .with_setting("host", "h")
            .with_setting("user", "u")
            .with_pool_settings(PoolSettings::default().with_size(2, 2))
            .with_async_pool_settings(PoolSettings::default().with_size(2, 2))
    }

    #[test]
    fn test_sequential_acquire_is_identical() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let a = manager.acquire(&cfg, None).unwrap();
        let b = manager.acquire(&cfg, None).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.state(), ConnectionState::Open);
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_types_get_distinct_handles() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let normal = manager.acquire(&cfg, None).unwrap();
        let pool = manager.acquire(&cfg, Some(ConnectionType::Pool)).unwrap();
        assert!(!normal.ptr_eq(&pool));
        assert_eq!(pool.connection_type(), ConnectionType::Pool);

        let info = manager.info();
        assert_eq!(info.size, 2);
        assert_eq!(info.counts_by_type.get(&ConnectionType::Normal), Some(&1));
        assert_eq!(info.counts_by_type.get(&ConnectionType::Pool), Some(&1));
    }

    #[tokio::test]
    async fn test_pool_and_async_pool_on_same_settings() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Pool);

        let blocking = Arc::clone(&manager);
        let blocking_cfg = cfg.clone();
        let (p1, again) = tokio::task::spawn_blocking(move || {
            let p1 = blocking.acquire(&blocking_cfg, Some(ConnectionType::Pool)).unwrap();
            let again = blocking.acquire(&blocking_cfg, Some(ConnectionType::Pool)).unwrap();
            (p1, again)
        })
        .await
        .unwrap();
        assert!(p1.ptr_eq(&again));

        let p2 = manager
            .acquire_async(&cfg, Some(ConnectionType::AsyncPool))
            .await
            .unwrap();
        assert!(!p1.ptr_eq(&p2));
        assert_eq!(p2.connection_type(), ConnectionType::AsyncPool);
    }

    #[test]
    fn test_concurrent_acquire_builds_once() {
        let driver = MockDriver::new();
        driver.set_connect_delay(Duration::from_millis(20));
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let handles: Vec<Handle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..12)
                .map(|_| s.spawn(|| manager.acquire(&cfg, None).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(manager.info().size, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_async_builds_once() {
        let driver = MockDriver::new();
        driver.set_connect_delay(Duration::from_millis(20));
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Async);

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let (manager, cfg) = (Arc::clone(&manager), cfg.clone());
            tasks.push(tokio::spawn(async move {
                manager.acquire_async(&cfg, None).await.unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_scoped_pool_use_restores_available() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let handle = manager.acquire(&config(ConnectionType::Pool), None).unwrap();
        let pool = handle.as_pool().unwrap();

        let before = pool.status().available;
        pool.transaction(|tx| tx.execute("INSERT INTO t VALUES (1)").map(drop))
            .unwrap();
        assert_eq!(pool.status().available, before);

        driver.fail_statement("INSERT INTO t VALUES (2)");
        let err = pool
            .transaction(|tx| tx.execute("INSERT INTO t VALUES (2)").map(drop))
            .unwrap_err();
        assert!(err.is_query());
        assert_eq!(pool.status().available, before);
    }

    #[test]
    fn test_clear_then_acquire_is_new() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let before = manager.acquire(&cfg, None).unwrap();
        let report = manager.clear();
        assert_eq!(report.closed, 1);
        assert_eq!(before.state(), ConnectionState::Closed);

        let after = manager.acquire(&cfg, None).unwrap();
        assert!(!before.ptr_eq(&after));
        assert_eq!(manager.info().size, 1);
    }

    #[test]
    fn test_wrong_flavour_rejected() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let err = manager.acquire(&config(ConnectionType::Async), None).unwrap_err();
        assert!(err.is_config());
        assert_eq!(driver.connect_count(), 0);
        assert_eq!(manager.info().size, 0);
    }

    #[tokio::test]
    async fn test_wrong_flavour_rejected_async() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let err = manager
            .acquire_async(&config(ConnectionType::Normal), None)
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_invalid_pool_range_never_connects() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Pool)
            .with_pool_settings(PoolSettings::default().with_size(4, 1));

        let err = manager.acquire(&cfg, None).unwrap_err();
        assert!(err.is_config());
        assert!(err.is_construction());
        assert_eq!(driver.connect_count(), 0);
        assert!(manager.get(&cfg, None).is_none());
    }

    #[test]
    fn test_connection_failure_reverts_for_retry() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Pool);

        driver.fail_connects(true);
        let err = manager.acquire(&cfg, None).unwrap_err();
        assert!(err.is_connection());
        assert_eq!(manager.info().size, 0);

        driver.fail_connects(false);
        let handle = manager.acquire(&cfg, None).unwrap();
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[test]
    fn test_force_reload() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let old = manager.acquire(&cfg, None).unwrap();
        let new = manager.force_reload(&cfg, None).unwrap();
        assert!(!old.ptr_eq(&new));
        assert_eq!(old.state(), ConnectionState::Closed);
        assert!(manager.acquire(&cfg, None).unwrap().ptr_eq(&new));
    }

    #[tokio::test]
    async fn test_force_reload_async() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::AsyncPool);

        let old = manager.acquire_async(&cfg, None).await.unwrap();
        let new = manager.force_reload_async(&cfg, None).await.unwrap();
        assert!(!old.ptr_eq(&new));
        assert_eq!(old.state(), ConnectionState::Closed);
        assert_eq!(manager.clear_async().await.closed, 1);
    }

    #[test]
    fn test_exit_hook_is_idempotent() {
        let driver = MockDriver::new();
        let manager = manager(&driver);
        let cfg = config(ConnectionType::Normal);

        let guard = manager.register_exit_hook();
        let inert = manager.register_exit_hook();
        assert!(guard.is_armed());
        assert!(!inert.is_armed());

        let handle = manager.acquire(&cfg, None).unwrap();
        drop(inert);
        assert_eq!(handle.state(), ConnectionState::Open);

        drop(guard);
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(manager.info().size, 0);
    }

    #[test]
    fn test_type_override_changes_fingerprint() {
        let cfg = config(ConnectionType::Normal);
        let own = ConnectionManager::fingerprint(&cfg, None);
        let same = ConnectionManager::fingerprint(&cfg, Some(ConnectionType::Normal));
        let pool = ConnectionManager::fingerprint(&cfg, Some(ConnectionType::Pool));
        assert_eq!(own, same);
        assert_ne!(own, pool);
    }
}

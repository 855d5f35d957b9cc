//! Create-once cache of handles keyed by [`Fingerprint`].
//!
//! Every fingerprint maps to a slot that is `Pending` while its one builder
//! runs and `Ready` once the handle is published. Callers that find a
//! pending slot wait on it (condvar for threads, [`Notify`] for tasks) and
//! receive the builder's outcome; they never build a second handle. A failed,
//! panicked or cancelled build removes the slot so the next caller retries.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::ConnectionType;
use crate::connection::Handle;
use crate::error::StateError;
use crate::fingerprint::Fingerprint;
use crate::{Error, Result};

type Outcome = std::result::Result<Handle, Arc<Error>>;

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready(Handle),
    Failed(Arc<Error>),
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
    notify: Notify,
}

impl Slot {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    fn resolve(&self, state: SlotState) {
        *self.state.lock() = state;
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    fn peek(&self) -> Option<Outcome> {
        match &*self.state.lock() {
            SlotState::Pending => None,
            SlotState::Ready(handle) => Some(Ok(handle.clone())),
            SlotState::Failed(e) => Some(Err(Arc::clone(e))),
        }
    }

    fn ready_handle(&self) -> Option<Handle> {
        match &*self.state.lock() {
            SlotState::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Pending)
    }

    fn wait_blocking(&self) -> Outcome {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Pending => self.ready.wait(&mut state),
                SlotState::Ready(handle) => return Ok(handle.clone()),
                SlotState::Failed(e) => return Err(Arc::clone(e)),
            }
        }
    }

    async fn wait(&self) -> Outcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve in between is not lost.
            notified.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            notified.await;
        }
    }
}

enum Claim {
    Hit(Handle),
    Wait(Arc<Slot>),
    Build(Arc<Slot>),
}

enum Reload {
    Wait(Arc<Slot>),
    Build(Arc<Slot>, Option<Handle>),
}

/// Read-only snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    /// Ready handles.
    pub size: usize,
    pub counts_by_type: BTreeMap<ConnectionType, usize>,
}

/// Outcome of a clear. Close failures are collected, never raised.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub closed: usize,
    /// Abbreviated fingerprint and error of every handle that failed to close.
    pub failures: Vec<(String, Error)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, fingerprint: &Fingerprint, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.closed += 1,
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Failed to close cached handle"
                );
                self.failures.push((fingerprint.short(), e));
            }
        }
    }
}

/// Fingerprint to handle registry with per-key create-once construction.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    slots: Mutex<HashMap<Fingerprint, Arc<Slot>>>,
}

/// Publishes failure if the build never reaches `publish` (panic, cancel).
struct BuildGuard<'a> {
    cache: &'a ConnectionCache,
    fingerprint: &'a Fingerprint,
    slot: Arc<Slot>,
    done: bool,
}

impl BuildGuard<'_> {
    fn publish(mut self, outcome: Result<Handle>) -> Result<Handle> {
        self.done = true;
        self.cache.publish(self.fingerprint, &self.slot, outcome)
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(
                fingerprint = %self.fingerprint.short(),
                "Handle construction abandoned"
            );
            let _ = self.cache.publish(
                self.fingerprint,
                &self.slot,
                Err(Error::connection("handle construction was abandoned")),
            );
        }
    }
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, fingerprint: &Fingerprint) -> Claim {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(fingerprint) {
            match &*slot.state.lock() {
                SlotState::Ready(handle) => return Claim::Hit(handle.clone()),
                SlotState::Pending => return Claim::Wait(Arc::clone(slot)),
                SlotState::Failed(_) => {}
            }
        }
        let slot = Slot::pending();
        slots.insert(fingerprint.clone(), Arc::clone(&slot));
        Claim::Build(slot)
    }

    fn begin_reload(&self, fingerprint: &Fingerprint) -> Reload {
        let mut slots = self.slots.lock();
        let existing = slots.get(fingerprint).cloned();
        if let Some(slot) = &existing
            && slot.is_pending()
        {
            return Reload::Wait(Arc::clone(slot));
        }
        let slot = Slot::pending();
        slots.insert(fingerprint.clone(), Arc::clone(&slot));
        Reload::Build(slot, existing.and_then(|s| s.ready_handle()))
    }

    fn publish(&self, fingerprint: &Fingerprint, slot: &Arc<Slot>, outcome: Result<Handle>) -> Result<Handle> {
        let mut slots = self.slots.lock();
        let registered = slots
            .get(fingerprint)
            .is_some_and(|current| Arc::ptr_eq(current, slot));

        match outcome {
            Ok(handle) if registered => {
                slot.resolve(SlotState::Ready(handle.clone()));
                crate::metrics::set_cache_size(ready_count(&slots));
                drop(slots);
                tracing::info!(
                    fingerprint = %fingerprint.short(),
                    connection_type = %fingerprint.connection_type(),
                    instance = handle.id(),
                    "Cached new handle"
                );
                Ok(handle)
            }
            Ok(handle) => {
                drop(slots);
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    "Cache entry removed during construction; closing new handle"
                );
                if let Err(e) = handle.close() {
                    tracing::warn!(error = %e, "Failed to close orphaned handle");
                }
                let error = Arc::new(Error::State(StateError::Closed));
                slot.resolve(SlotState::Failed(Arc::clone(&error)));
                Err(construction_error(fingerprint, error))
            }
            Err(e) => {
                if registered {
                    slots.remove(fingerprint);
                }
                drop(slots);
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Handle construction failed"
                );
                let error = Arc::new(e);
                slot.resolve(SlotState::Failed(Arc::clone(&error)));
                Err(construction_error(fingerprint, error))
            }
        }
    }

    fn hit(fingerprint: &Fingerprint, handle: Handle) -> Handle {
        tracing::debug!(
            cache.result = "hit",
            fingerprint = %fingerprint.short(),
            instance = handle.id(),
        );
        crate::metrics::record_cache_hit(fingerprint.connection_type());
        handle
    }

    fn build_blocking<F>(&self, fingerprint: &Fingerprint, slot: Arc<Slot>, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Result<Handle>,
    {
        let _span = tracing::debug_span!("cache.build", fingerprint = %fingerprint.short()).entered();
        let guard = BuildGuard {
            cache: self,
            fingerprint,
            slot,
            done: false,
        };
        let started = Instant::now();
        let outcome = build();
        crate::metrics::record_construction(
            fingerprint.connection_type(),
            started.elapsed(),
            outcome.is_ok(),
        );
        guard.publish(outcome)
    }

    async fn build_async<F, Fut>(&self, fingerprint: &Fingerprint, slot: Arc<Slot>, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Handle>>,
    {
        let guard = BuildGuard {
            cache: self,
            fingerprint,
            slot,
            done: false,
        };
        let started = Instant::now();
        let span = tracing::debug_span!("cache.build", fingerprint = %fingerprint.short());
        let outcome = build().instrument(span).await;
        crate::metrics::record_construction(
            fingerprint.connection_type(),
            started.elapsed(),
            outcome.is_ok(),
        );
        guard.publish(outcome)
    }

    /// The cached handle for `fingerprint`, building it with `build` on a
    /// miss. Concurrent callers for the same fingerprint share one build.
    pub fn get_or_build<F>(&self, fingerprint: &Fingerprint, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Result<Handle>,
    {
        match self.claim(fingerprint) {
            Claim::Hit(handle) => Ok(Self::hit(fingerprint, handle)),
            Claim::Wait(slot) => slot
                .wait_blocking()
                .map(|handle| Self::hit(fingerprint, handle))
                .map_err(|e| construction_error(fingerprint, e)),
            Claim::Build(slot) => {
                crate::metrics::record_cache_miss(fingerprint.connection_type());
                self.build_blocking(fingerprint, slot, build)
            }
        }
    }

    /// Async counterpart of [`ConnectionCache::get_or_build`]. Dropping the
    /// future while it builds publishes a failure to waiters.
    pub async fn get_or_build_async<F, Fut>(&self, fingerprint: &Fingerprint, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Handle>>,
    {
        match self.claim(fingerprint) {
            Claim::Hit(handle) => Ok(Self::hit(fingerprint, handle)),
            Claim::Wait(slot) => slot
                .wait()
                .await
                .map(|handle| Self::hit(fingerprint, handle))
                .map_err(|e| construction_error(fingerprint, e)),
            Claim::Build(slot) => {
                crate::metrics::record_cache_miss(fingerprint.connection_type());
                self.build_async(fingerprint, slot, build).await
            }
        }
    }

    /// Replace the entry with a freshly built handle, closing the old one.
    /// An in-flight construction for the same key is waited out first.
    pub fn force_reload<F>(&self, fingerprint: &Fingerprint, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Result<Handle>,
    {
        loop {
            match self.begin_reload(fingerprint) {
                Reload::Wait(slot) => {
                    let _ = slot.wait_blocking();
                }
                Reload::Build(slot, old) => {
                    if let Some(old) = old {
                        tracing::info!(
                            fingerprint = %fingerprint.short(),
                            instance = old.id(),
                            "Closing superseded handle"
                        );
                        if let Err(e) = old.close() {
                            tracing::warn!(error = %e, "Failed to close superseded handle");
                        }
                    }
                    return self.build_blocking(fingerprint, slot, build);
                }
            }
        }
    }

    pub async fn force_reload_async<F, Fut>(&self, fingerprint: &Fingerprint, build: F) -> Result<Handle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Handle>>,
    {
        loop {
            match self.begin_reload(fingerprint) {
                Reload::Wait(slot) => {
                    let _ = slot.wait().await;
                }
                Reload::Build(slot, old) => {
                    if let Some(old) = old {
                        tracing::info!(
                            fingerprint = %fingerprint.short(),
                            instance = old.id(),
                            "Closing superseded handle"
                        );
                        if let Err(e) = old.close_async().await {
                            tracing::warn!(error = %e, "Failed to close superseded handle");
                        }
                    }
                    return self.build_async(fingerprint, slot, build).await;
                }
            }
        }
    }

    fn drain(&self) -> Vec<(Fingerprint, Arc<Slot>)> {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        crate::metrics::set_cache_size(0);
        drained
    }

    /// Close every ready handle and empty the cache. Builds still in flight
    /// close their handle when they finish.
    pub fn clear(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (fingerprint, slot) in self.drain() {
            if let Some(handle) = slot.ready_handle() {
                report.record(&fingerprint, handle.close());
            }
        }
        finish_teardown(&report);
        report
    }

    pub async fn clear_async(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (fingerprint, slot) in self.drain() {
            if let Some(handle) = slot.ready_handle() {
                report.record(&fingerprint, handle.close_async().await);
            }
        }
        finish_teardown(&report);
        report
    }

    /// Ready handle for `fingerprint`, without building.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Handle> {
        self.slots.lock().get(fingerprint).and_then(|s| s.ready_handle())
    }

    pub fn info(&self) -> CacheInfo {
        let slots = self.slots.lock();
        let mut info = CacheInfo {
            size: ready_count(&slots),
            ..CacheInfo::default()
        };
        for (fingerprint, slot) in slots.iter() {
            if slot.ready_handle().is_some() {
                *info
                    .counts_by_type
                    .entry(fingerprint.connection_type())
                    .or_default() += 1;
            }
        }
        info
    }
}

/// Published handles only; pending builds are not cache entries yet.
fn ready_count(slots: &HashMap<Fingerprint, Arc<Slot>>) -> usize {
    slots.values().filter(|slot| slot.ready_handle().is_some()).count()
}

fn construction_error(fingerprint: &Fingerprint, source: Arc<Error>) -> Error {
    Error::CacheConstruction {
        fingerprint: fingerprint.short(),
        connection_type: fingerprint.connection_type(),
        source,
    }
}

fn finish_teardown(report: &TeardownReport) {
    crate::metrics::record_teardown(report.closed, report.failures.len());
    tracing::info!(
        closed = report.closed,
        failed = report.failures.len(),
        "Connection cache cleared"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionState;
    use crate::factory::ConnectionFactory;
    use crate::testing::MockDriver;

    fn fingerprint(ty: ConnectionType) -> Fingerprint {
        let config = ConnectionConfig::new(ty).with_setting("host", "localhost");
        Fingerprint::of(&config, ty)
    }

    fn builder(driver: &MockDriver, ty: ConnectionType) -> impl Fn() -> Result<Handle> + Send + Sync + 'static {
        let factory = ConnectionFactory::new(Arc::new(driver.clone()), Arc::new(driver.clone()));
        move || factory.create(&ConnectionConfig::new(ty), ty)
    }

    #[test]
    fn test_hit_returns_same_instance() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Normal);
        let build = builder(&driver, ConnectionType::Normal);

        let first = cache.get_or_build(&fp, &build).unwrap();
        let second = cache.get_or_build(&fp, &build).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(cache.info().size, 1);
    }

    #[test]
    fn test_pending_build_is_not_counted() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let ready = fingerprint(ConnectionType::Normal);
        let pending = fingerprint(ConnectionType::Pool);
        cache
            .get_or_build(&ready, builder(&driver, ConnectionType::Normal))
            .unwrap();
        let build = builder(&driver, ConnectionType::Pool);

        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                cache.get_or_build(&pending, || {
                    std::thread::sleep(Duration::from_millis(100));
                    build()
                })
            });
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(ready_count(&cache.slots.lock()), 1);
            assert_eq!(cache.info().size, 1);
            worker.join().unwrap().unwrap();
        });

        assert_eq!(ready_count(&cache.slots.lock()), 2);
        assert_eq!(cache.info().size, 2);
    }

    #[test]
    fn test_concurrent_threads_build_once() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Normal);
        let build = builder(&driver, ConnectionType::Normal);
        let builds = AtomicUsize::new(0);

        let handles: Vec<Handle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        cache
                            .get_or_build(&fp, || {
                                builds.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(20));
                                build()
                            })
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_build_once() {
        let driver = MockDriver::new();
        let cache = Arc::new(ConnectionCache::new());
        let fp = fingerprint(ConnectionType::AsyncPool);
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let (cache, fp, builds) = (Arc::clone(&cache), fp.clone(), Arc::clone(&builds));
            let build = builder(&driver, ConnectionType::AsyncPool);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build_async(&fp, || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        build()
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
    }

    #[tokio::test]
    async fn test_joined_futures_build_once() {
        let driver = MockDriver::new();
        driver.set_connect_delay(Duration::from_millis(10));
        let factory = ConnectionFactory::new(Arc::new(driver.clone()), Arc::new(driver.clone()));
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Async);
        let config = ConnectionConfig::new(ConnectionType::Async);

        let acquires = (0..8).map(|_| {
            cache.get_or_build_async(&fp, || async {
                let handle = factory.create(&config, ConnectionType::Async)?;
                handle.connect_async().await?;
                Ok(handle)
            })
        });
        let handles: Vec<Handle> = futures::future::try_join_all(acquires).await.unwrap();

        assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_failure_reaches_waiters_and_reverts() {
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Pool);

        let errors: Vec<Error> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        cache
                            .get_or_build(&fp, || {
                                std::thread::sleep(Duration::from_millis(20));
                                Err(Error::connection("password authentication failed"))
                            })
                            .unwrap_err()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for err in &errors {
            assert!(err.is_construction());
            assert!(err.is_connection());
        }
        assert_eq!(cache.info().size, 0);
        assert!(cache.get(&fp).is_none());

        let driver = MockDriver::new();
        let handle = cache
            .get_or_build(&fp, builder(&driver, ConnectionType::Pool))
            .unwrap();
        assert_eq!(handle.connection_type(), ConnectionType::Pool);
    }

    #[test]
    fn test_panicking_build_reverts() {
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Normal);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.get_or_build(&fp, || panic!("builder exploded"))
        }));
        assert!(outcome.is_err());
        assert!(cache.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_build_reverts() {
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Async);

        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_build_async(&fp, || std::future::pending::<Result<Handle>>()),
        )
        .await;
        assert!(outcome.is_err());
        assert!(cache.slots.lock().is_empty());

        let driver = MockDriver::new();
        let build = builder(&driver, ConnectionType::Async);
        let handle = cache.get_or_build_async(&fp, || async { build() }).await.unwrap();
        assert_eq!(handle.connection_type(), ConnectionType::Async);
    }

    #[test]
    fn test_force_reload_replaces_and_closes() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Normal);
        let build = builder(&driver, ConnectionType::Normal);

        let old = cache.get_or_build(&fp, &build).unwrap();
        let new = cache.force_reload(&fp, &build).unwrap();

        assert!(!old.ptr_eq(&new));
        assert_eq!(old.state(), ConnectionState::Closed);
        assert!(cache.get(&fp).unwrap().ptr_eq(&new));
        assert_eq!(cache.info().size, 1);
    }

    #[test]
    fn test_clear_closes_and_empties() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let normal = fingerprint(ConnectionType::Normal);
        let pool = fingerprint(ConnectionType::Pool);

        let a = cache
            .get_or_build(&normal, builder(&driver, ConnectionType::Normal))
            .unwrap();
        cache
            .get_or_build(&pool, builder(&driver, ConnectionType::Pool))
            .unwrap();
        let info = cache.info();
        assert_eq!(info.size, 2);
        assert_eq!(info.counts_by_type[&ConnectionType::Normal], 1);
        assert_eq!(info.counts_by_type[&ConnectionType::Pool], 1);

        let report = cache.clear();
        assert_eq!(report.closed, 2);
        assert!(report.is_clean());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(cache.info(), CacheInfo::default());

        let b = cache
            .get_or_build(&normal, builder(&driver, ConnectionType::Normal))
            .unwrap();
        assert!(!a.ptr_eq(&b));

        // Clearing an empty cache is fine.
        cache.clear();
        assert!(cache.clear().is_clean());
    }

    #[test]
    fn test_clear_during_build_closes_new_handle() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::Normal);
        let build = builder(&driver, ConnectionType::Normal);

        let err = cache
            .get_or_build(&fp, || {
                let handle = build()?;
                cache.clear();
                Ok(handle)
            })
            .unwrap_err();

        assert!(err.is_construction());
        assert!(matches!(err.root_cause(), Error::State(StateError::Closed)));
        assert_eq!(cache.info().size, 0);
    }

    #[tokio::test]
    async fn test_clear_async() {
        let driver = MockDriver::new();
        let cache = ConnectionCache::new();
        let fp = fingerprint(ConnectionType::AsyncPool);
        let build = builder(&driver, ConnectionType::AsyncPool);

        let handle = cache.get_or_build_async(&fp, || async { build() }).await.unwrap();
        let report = cache.clear_async().await;
        assert_eq!(report.closed, 1);
        assert_eq!(handle.state(), ConnectionState::Closed);
    }
}

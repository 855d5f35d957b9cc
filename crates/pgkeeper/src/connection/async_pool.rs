//! Async connection pool using [`deadpool`].
//!
//! Each [`AsyncPoolConnection::transaction`] registers its borrow in a
//! task-local map keyed by pool id, visible only to the future it wraps.
//! Concurrent tasks never see each other's borrows, and scopes over
//! different pools nest freely.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool::managed::{self, Manager, Metrics, Object, RecycleError, RecycleResult};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::{
    ConnectionState, HandleOptions, InstanceId, Lifecycle, PoolOptions, PoolStatus,
    next_instance_id, settle,
};
use crate::config::ConnectionType;
use crate::cursor::{AsyncCursor, AsyncExecute};
use crate::driver::{AsyncConnector, ConnectParams, QueryResult};
use crate::error::StateError;
use crate::session::AsyncSession;
use crate::{Error, Result};

type Pool = managed::Pool<AsyncSessionManager>;
type SharedSession = Arc<Mutex<Option<PooledAsyncSession>>>;
type TaskBorrows = HashMap<InstanceId, SharedSession>;

tokio::task_local! {
    static TASK_BORROWS: TaskBorrows;
}

#[derive(Debug)]
struct AsyncSessionManager {
    connector: Arc<dyn AsyncConnector>,
    params: ConnectParams,
    options: PoolOptions,
}

impl Manager for AsyncSessionManager {
    type Type = AsyncSession;
    type Error = Error;

    async fn create(&self) -> Result<AsyncSession> {
        let client = self.connector.connect(&self.params).await?;
        crate::metrics::record_connection_opened(ConnectionType::AsyncPool);
        Ok(AsyncSession::new(client, false))
    }

    async fn recycle(&self, session: &mut AsyncSession, metrics: &Metrics) -> RecycleResult<Error> {
        if session.is_closed() {
            return Err(RecycleError::Message("connection closed by server".into()));
        }
        if let Some(max) = self.options.max_lifetime
            && metrics.age() > max
        {
            return Err(RecycleError::Message("connection exceeded max_lifetime".into()));
        }
        if let Some(max) = self.options.max_idle
            && metrics.last_used() > max
        {
            return Err(RecycleError::Message("connection exceeded max_idle".into()));
        }

        session.recover().await.map_err(RecycleError::Backend)?;
        if session.in_transaction() {
            session.rollback().await.map_err(RecycleError::Backend)?;
        }
        if self.options.check_on_checkout {
            session.ping().await.map_err(RecycleError::Backend)?;
        }
        Ok(())
    }
}

enum Slot {
    Idle,
    Open(Pool),
    Closed,
}

/// Async pool shared by many tasks.
pub struct AsyncPoolConnection {
    id: InstanceId,
    options: HandleOptions,
    connector: Arc<dyn AsyncConnector>,
    slot: RwLock<Slot>,
    connect_gate: Mutex<()>,
}

impl fmt::Debug for AsyncPoolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("AsyncPoolConnection")
            .field("id", &self.id)
            .field("size", &status.size)
            .field("available", &status.available)
            .field("max_size", &status.max_size)
            .finish_non_exhaustive()
    }
}

impl AsyncPoolConnection {
    pub(crate) fn new(options: HandleOptions, connector: Arc<dyn AsyncConnector>) -> Self {
        Self {
            id: next_instance_id(),
            options,
            connector,
            slot: RwLock::new(Slot::Idle),
            connect_gate: Mutex::new(()),
        }
    }

    async fn build_pool(&self) -> Result<Pool> {
        let opts = &self.options.pool;
        let manager = AsyncSessionManager {
            connector: Arc::clone(&self.connector),
            params: self.options.params.clone(),
            options: opts.clone(),
        };
        let pool = Pool::builder(manager)
            .max_size(opts.max_size as usize)
            .wait_timeout(Some(opts.timeout))
            .create_timeout(Some(opts.timeout))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;

        let mut warm = Vec::with_capacity(opts.min_size as usize);
        for _ in 0..opts.min_size {
            warm.push(pool.get().await?);
        }
        drop(warm);

        tracing::info!(
            pool.id = self.id,
            min_size = opts.min_size,
            max_size = opts.max_size,
            "Async connection pool opened"
        );
        Ok(pool)
    }

    fn open_pool(&self) -> Result<Option<Pool>> {
        match &*self.slot.read() {
            Slot::Open(pool) => Ok(Some(pool.clone())),
            Slot::Idle => Ok(None),
            Slot::Closed => Err(Error::State(StateError::Closed)),
        }
    }

    /// Open the pool and pre-warm `min_size` connections. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.open_pool()?.is_some() {
            return Ok(());
        }
        let pool = self.build_pool().await?;

        let mut slot = self.slot.write();
        if matches!(*slot, Slot::Closed) {
            pool.close();
            return Err(Error::State(StateError::Closed));
        }
        *slot = Slot::Open(pool);
        Ok(())
    }

    /// Close the pool; the handle reopens on next use.
    pub async fn disconnect(&self) {
        let _gate = self.connect_gate.lock().await;
        let mut slot = self.slot.write();
        if let Slot::Open(pool) = &*slot {
            pool.close();
            *slot = Slot::Idle;
            tracing::debug!(pool.id = self.id, "Async connection pool closed");
        }
    }

    pub(crate) fn close_pool(&self) -> Result<()> {
        let mut slot = self.slot.write();
        if let Slot::Open(pool) = &*slot {
            pool.close();
        }
        *slot = Slot::Closed;
        Ok(())
    }

    async fn pool(&self) -> Result<Pool> {
        if let Some(pool) = self.open_pool()? {
            return Ok(pool);
        }
        self.connect().await?;
        self.open_pool()?
            .ok_or(Error::State(StateError::NotConnected))
    }

    /// Borrow a connection until the returned guard drops.
    pub async fn acquire(&self) -> Result<PooledAsyncSession> {
        let pool = self.pool().await?;
        let started = Instant::now();
        let mut obj = pool
            .get()
            .await
            .inspect_err(|_| crate::metrics::record_checkout_error(ConnectionType::AsyncPool))?;
        crate::metrics::record_checkout(ConnectionType::AsyncPool, started.elapsed());
        obj.apply_settings(&self.options.session_settings).await;
        Ok(PooledAsyncSession { obj: Some(obj) })
    }

    /// Borrow a connection for the duration of `body`, committing if it
    /// resolves to `Ok` and rolling back otherwise.
    ///
    /// Inside `body`, this handle's `execute`, `commit`, `rollback` and
    /// `cursor` run on the borrowed connection. If the returned future is
    /// dropped early the connection is rolled back and returned.
    pub async fn transaction<F, T>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let shared: SharedSession = Arc::new(Mutex::new(Some(self.acquire().await?)));
        let mut borrows = TASK_BORROWS.try_with(Clone::clone).unwrap_or_default();
        borrows.insert(self.id, Arc::clone(&shared));

        let result = TASK_BORROWS.scope(borrows, body).await;

        let end = {
            let mut slot = shared.lock().await;
            let end = match slot.as_mut() {
                Some(session) if result.is_ok() => session.commit().await,
                Some(session) => session.rollback().await,
                None => Ok(()),
            };
            // Back to the pool now, whoever else still holds the Arc.
            slot.take();
            end
        };
        settle(result, end)
    }

    fn current_borrow(&self) -> Option<SharedSession> {
        TASK_BORROWS
            .try_with(|borrows| borrows.get(&self.id).cloned())
            .ok()
            .flatten()
    }

    /// Run on this task's borrowed connection.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let shared = self
            .current_borrow()
            .ok_or(Error::State(StateError::NoBorrow))?;
        run_shared(&shared, sql).await
    }

    /// No-op when this task holds no borrow.
    pub async fn commit(&self) -> Result<()> {
        let Some(shared) = self.current_borrow() else {
            return Ok(());
        };
        let mut slot = shared.lock().await;
        match slot.as_mut() {
            Some(session) => session.commit().await,
            None => Ok(()),
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        let Some(shared) = self.current_borrow() else {
            return Ok(());
        };
        let mut slot = shared.lock().await;
        match slot.as_mut() {
            Some(session) => session.rollback().await,
            None => Ok(()),
        }
    }

    pub fn cursor(&self) -> Result<AsyncCursor<'_>> {
        let shared = self
            .current_borrow()
            .ok_or(Error::State(StateError::NoBorrow))?;
        Ok(AsyncCursor::new(SharedExec(shared)))
    }

    pub async fn in_transaction(&self) -> bool {
        match self.current_borrow() {
            Some(shared) => shared
                .lock()
                .await
                .as_ref()
                .is_some_and(PooledAsyncSession::in_transaction),
            None => false,
        }
    }

    pub fn status(&self) -> PoolStatus {
        match &*self.slot.read() {
            Slot::Open(pool) => {
                let status = pool.status();
                PoolStatus {
                    size: status.size,
                    available: status.available,
                    max_size: status.max_size,
                }
            }
            Slot::Idle | Slot::Closed => PoolStatus {
                max_size: self.options.pool.max_size as usize,
                ..PoolStatus::default()
            },
        }
    }

    /// `SELECT 1` on one connection, then hold `min(max, min + 1)` at once.
    pub async fn test_connection(&self) -> Result<()> {
        self.acquire().await?.ping().await?;
        let want = self.options.pool.hold_count();
        let mut held = Vec::with_capacity(want as usize);
        for _ in 0..want {
            held.push(self.acquire().await?);
        }
        tracing::info!(
            pool.id = self.id,
            held = held.len(),
            "Async pool test passed"
        );
        Ok(())
    }
}

impl Lifecycle for AsyncPoolConnection {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::AsyncPool
    }

    fn state(&self) -> ConnectionState {
        match &*self.slot.read() {
            Slot::Idle => ConnectionState::Uninitialized,
            Slot::Closed => ConnectionState::Closed,
            Slot::Open(pool) => {
                let status = pool.status();
                if status.size > status.available {
                    ConnectionState::Borrowed
                } else {
                    ConnectionState::Open
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.close_pool()
    }
}

async fn run_shared(shared: &SharedSession, sql: &str) -> Result<QueryResult> {
    let mut slot = shared.lock().await;
    slot.as_mut()
        .ok_or(Error::State(StateError::ReturnedToPool))?
        .execute(sql)
        .await
}

struct SharedExec(SharedSession);

#[async_trait]
impl AsyncExecute for SharedExec {
    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        run_shared(&self.0, sql).await
    }
}

/// A connection borrowed from an [`AsyncPoolConnection`].
///
/// Dropping it mid-transaction rolls back in the background before the
/// connection is reused.
pub struct PooledAsyncSession {
    obj: Option<Object<AsyncSessionManager>>,
}

impl fmt::Debug for PooledAsyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledAsyncSession")
            .field("session", &self.obj.as_deref())
            .finish()
    }
}

impl PooledAsyncSession {
    fn session(&mut self) -> Result<&mut AsyncSession> {
        self.obj
            .as_deref_mut()
            .ok_or(Error::State(StateError::ReturnedToPool))
    }

    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.session()?.execute(sql).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.session()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.session()?.rollback().await
    }

    pub fn cursor(&mut self) -> AsyncCursor<'_> {
        AsyncCursor::new(self)
    }

    pub fn in_transaction(&self) -> bool {
        self.obj
            .as_deref()
            .is_some_and(|s| s.in_transaction() && !s.is_abandoned())
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.session()?.ping().await
    }
}

#[async_trait]
impl AsyncExecute for PooledAsyncSession {
    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.execute(sql).await
    }
}

impl Drop for PooledAsyncSession {
    fn drop(&mut self) {
        let Some(mut obj) = self.obj.take() else {
            return;
        };
        if !obj.in_transaction() {
            return;
        }
        // Recycle rolls back if the task below never runs.
        obj.abandon();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut obj = obj;
                if let Err(e) = obj.recover().await {
                    tracing::warn!(error = %e, "Rollback before return to pool failed");
                    drop(Object::take(obj));
                }
            });
        }
    }
}

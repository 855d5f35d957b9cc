//! Single async connection.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ConnectionState, HandleOptions, InstanceId, Lifecycle, next_instance_id, settle};
use crate::config::ConnectionType;
use crate::cursor::{AsyncCursor, AsyncExecute};
use crate::driver::{AsyncConnector, QueryResult};
use crate::error::StateError;
use crate::session::AsyncSession;
use crate::{Error, Result};

#[derive(Debug)]
enum Inner {
    Idle,
    Open(AsyncSession),
    Closed,
}

/// One async connection shared by every task holding the handle.
#[derive(Debug)]
pub struct AsyncConnection {
    id: InstanceId,
    options: HandleOptions,
    connector: Arc<dyn AsyncConnector>,
    autocommit: AtomicBool,
    closing: AtomicBool,
    inner: Arc<Mutex<Inner>>,
}

impl AsyncConnection {
    pub(crate) fn new(options: HandleOptions, connector: Arc<dyn AsyncConnector>) -> Self {
        Self {
            id: next_instance_id(),
            options,
            connector,
            autocommit: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            inner: Arc::new(Mutex::new(Inner::Idle)),
        }
    }

    async fn open(&self) -> Result<AsyncSession> {
        let client = self.connector.connect(&self.options.params).await?;
        let mut session = AsyncSession::new(client, self.autocommit.load(Ordering::Acquire));
        session.apply_settings(&self.options.session_settings).await;
        crate::metrics::record_connection_opened(ConnectionType::Async);
        tracing::debug!(connection.id = self.id, "Async connection opened");
        Ok(session)
    }

    async fn session<'a>(&self, inner: &'a mut Inner) -> Result<&'a mut AsyncSession> {
        if self.closing.load(Ordering::Acquire) {
            *inner = Inner::Closed;
        }
        if matches!(inner, Inner::Closed) {
            return Err(Error::State(StateError::Closed));
        }
        let usable = matches!(inner, Inner::Open(s) if !s.is_closed());
        if !usable {
            *inner = Inner::Open(self.open().await?);
        }
        match inner {
            Inner::Open(session) => Ok(session),
            _ => Err(Error::State(StateError::NotConnected)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.session(&mut inner).await.map(|_| ())
    }

    /// Drop the connection; the handle reconnects on next use.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(*inner, Inner::Open(_)) {
            *inner = Inner::Idle;
            tracing::debug!(connection.id = self.id, "Async connection closed");
        }
    }

    /// Terminal close that waits for in-flight work.
    pub(crate) async fn disconnect_final(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        *self.inner.lock().await = Inner::Closed;
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let mut inner = self.inner.lock().await;
        self.session(&mut inner).await?.execute(sql).await
    }

    /// No-op without an open transaction.
    pub async fn commit(&self) -> Result<()> {
        match &mut *self.inner.lock().await {
            Inner::Open(session) => {
                session.recover().await?;
                session.commit().await
            }
            _ => Ok(()),
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        match &mut *self.inner.lock().await {
            Inner::Open(session) => session.rollback().await,
            _ => Ok(()),
        }
    }

    pub fn cursor(&self) -> AsyncCursor<'_> {
        AsyncCursor::new(HandleExec(self))
    }

    /// Run `body` as one transaction, committing if it resolves to `Ok` and
    /// rolling back otherwise.
    ///
    /// `body` issues its statements through this handle. If the returned
    /// future is dropped early the transaction is rolled back before the
    /// connection is used again.
    pub async fn transaction<F, T>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            self.session(&mut inner).await?.begin().await?;
        }
        let mut scope = OpenScope {
            inner: Arc::clone(&self.inner),
            active: true,
        };

        let result = body.await;
        let end = if result.is_ok() {
            self.commit().await
        } else {
            self.rollback().await
        };
        scope.active = false;
        settle(result, end)
    }

    /// Begin a transaction that owns the connection until it is committed,
    /// rolled back, or dropped. Dropping it (including by cancellation)
    /// rolls back.
    pub async fn begin(&self) -> Result<AsyncTransaction> {
        let mut guard = Arc::clone(&self.inner).lock_owned().await;
        self.session(&mut guard).await?.begin().await?;
        Ok(AsyncTransaction {
            guard: Some(guard),
            finished: false,
        })
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    pub async fn set_autocommit(&self, on: bool) -> Result<()> {
        if let Inner::Open(session) = &mut *self.inner.lock().await {
            session.recover().await?;
            session.set_autocommit(on)?;
        }
        self.autocommit.store(on, Ordering::Release);
        Ok(())
    }

    pub async fn in_transaction(&self) -> bool {
        matches!(&*self.inner.lock().await, Inner::Open(s) if s.in_transaction() && !s.is_abandoned())
    }

    /// Round-trip `SELECT 1`.
    pub async fn test_connection(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.session(&mut inner).await?.ping().await?;
        tracing::info!(connection.id = self.id, "Async connection test passed");
        Ok(())
    }
}

impl Lifecycle for AsyncConnection {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Async
    }

    fn state(&self) -> ConnectionState {
        if self.closing.load(Ordering::Acquire) {
            return ConnectionState::Closed;
        }
        match self.inner.try_lock().as_deref() {
            Ok(Inner::Idle) => ConnectionState::Uninitialized,
            Ok(Inner::Closed) => ConnectionState::Closed,
            Ok(Inner::Open(_)) | Err(_) => ConnectionState::Open,
        }
    }

    /// Closes now if idle, otherwise as soon as the current holder lets go.
    fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        match self.inner.try_lock() {
            Ok(mut inner) => *inner = Inner::Closed,
            Err(_) => tracing::debug!(
                connection.id = self.id,
                "Async connection busy; closing after current operation"
            ),
        }
        Ok(())
    }
}

struct HandleExec<'a>(&'a AsyncConnection);

#[async_trait]
impl AsyncExecute for HandleExec<'_> {
    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.0.execute(sql).await
    }
}

/// Flags the transaction of an interrupted [`AsyncConnection::transaction`]
/// for rollback on next use.
struct OpenScope {
    inner: Arc<Mutex<Inner>>,
    active: bool,
}

fn abandon(inner: &mut Inner) {
    if let Inner::Open(session) = inner {
        session.abandon();
    }
}

impl Drop for OpenScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.inner.try_lock() {
            Ok(mut inner) => abandon(&mut inner),
            // The interrupted statement still holds the lock.
            Err(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let inner = Arc::clone(&self.inner);
                    runtime.spawn(async move { abandon(&mut *inner.lock().await) });
                }
            }
        }
    }
}

/// An open transaction holding an [`AsyncConnection`] exclusively.
#[derive(Debug)]
pub struct AsyncTransaction {
    guard: Option<OwnedMutexGuard<Inner>>,
    finished: bool,
}

impl AsyncTransaction {
    fn session(&mut self) -> Result<&mut AsyncSession> {
        match self.guard.as_deref_mut() {
            Some(Inner::Open(session)) => Ok(session),
            _ => Err(Error::State(StateError::NotConnected)),
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.session()?.execute(sql).await
    }

    pub fn cursor(&mut self) -> AsyncCursor<'_> {
        AsyncCursor::new(self)
    }

    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.session()?.commit().await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.session()?.rollback().await
    }
}

#[async_trait]
impl AsyncExecute for AsyncTransaction {
    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.execute(sql).await
    }
}

impl Drop for AsyncTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let Inner::Open(session) = &mut *guard else {
            return;
        };
        // Whoever locks next rolls back if the task below never runs.
        session.abandon();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut guard = guard;
                if let Inner::Open(session) = &mut *guard
                    && let Err(e) = session.recover().await
                {
                    tracing::warn!(error = %e, "Rollback of abandoned transaction failed");
                }
            });
        }
    }
}

//! Single blocking connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ConnectionState, HandleOptions, InstanceId, Lifecycle, next_instance_id, settle};
use crate::config::ConnectionType;
use crate::cursor::{Cursor, Execute};
use crate::driver::{QueryResult, SyncConnector};
use crate::error::StateError;
use crate::session::Session;
use crate::{Error, Result};

/// How long `close` waits for an in-flight operation.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Inner {
    Idle,
    Open(Session),
    Closed,
}

/// One blocking connection shared by every caller of the handle.
///
/// Operations serialize on an internal lock. The connection opens lazily on
/// first use and reopens after [`NormalConnection::disconnect`] or a server
/// side close.
#[derive(Debug)]
pub struct NormalConnection {
    id: InstanceId,
    options: HandleOptions,
    connector: Arc<dyn SyncConnector>,
    autocommit: AtomicBool,
    inner: Mutex<Inner>,
}

impl NormalConnection {
    pub(crate) fn new(options: HandleOptions, connector: Arc<dyn SyncConnector>) -> Self {
        Self {
            id: next_instance_id(),
            options,
            connector,
            autocommit: AtomicBool::new(false),
            inner: Mutex::new(Inner::Idle),
        }
    }

    fn open(&self) -> Result<Session> {
        let client = self.connector.connect(&self.options.params)?;
        let mut session = Session::new(client, self.autocommit.load(Ordering::Acquire));
        session.apply_settings(&self.options.session_settings);
        crate::metrics::record_connection_opened(ConnectionType::Normal);
        tracing::debug!(connection.id = self.id, "Connection opened");
        Ok(session)
    }

    fn session<'a>(&self, inner: &'a mut Inner) -> Result<&'a mut Session> {
        if matches!(inner, Inner::Closed) {
            return Err(Error::State(StateError::Closed));
        }
        let usable = matches!(inner, Inner::Open(s) if !s.is_closed());
        if !usable {
            *inner = Inner::Open(self.open()?);
        }
        match inner {
            Inner::Open(session) => Ok(session),
            _ => Err(Error::State(StateError::NotConnected)),
        }
    }

    pub fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.session(&mut inner).map(|_| ())
    }

    /// Drop the connection; the handle reconnects on next use.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        if matches!(*inner, Inner::Open(_)) {
            *inner = Inner::Idle;
            tracing::debug!(connection.id = self.id, "Connection closed");
        }
    }

    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        let mut inner = self.inner.lock();
        self.session(&mut inner)?.execute(sql)
    }

    /// No-op without an open transaction.
    pub fn commit(&self) -> Result<()> {
        match &mut *self.inner.lock() {
            Inner::Open(session) => session.commit(),
            _ => Ok(()),
        }
    }

    pub fn rollback(&self) -> Result<()> {
        match &mut *self.inner.lock() {
            Inner::Open(session) => session.rollback(),
            _ => Ok(()),
        }
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(HandleExec(self))
    }

    /// Run `f` inside `BEGIN`/`COMMIT`, rolling back if it fails or panics.
    ///
    /// The handle stays locked for the whole scope: use the [`Transaction`],
    /// not the handle, inside `f`.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let mut tx = Transaction::begin(self.session(&mut inner)?)?;
        let body = f(&mut tx);
        let end = if body.is_ok() {
            tx.commit()
        } else {
            tx.rollback()
        };
        settle(body, end)
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    /// Applies to the open connection and to reconnects.
    pub fn set_autocommit(&self, on: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Inner::Open(session) = &mut *inner {
            session.set_autocommit(on)?;
        }
        self.autocommit.store(on, Ordering::Release);
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        matches!(&*self.inner.lock(), Inner::Open(s) if s.in_transaction())
    }

    /// Round-trip `SELECT 1`.
    pub fn test_connection(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.session(&mut inner)?.ping()?;
        tracing::info!(connection.id = self.id, "Connection test passed");
        Ok(())
    }
}

impl Lifecycle for NormalConnection {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Normal
    }

    fn state(&self) -> ConnectionState {
        match self.inner.try_lock().as_deref() {
            Some(Inner::Idle) => ConnectionState::Uninitialized,
            Some(Inner::Closed) => ConnectionState::Closed,
            // Locked means an operation is running on an open connection.
            Some(Inner::Open(_)) | None => ConnectionState::Open,
        }
    }

    fn close(&self) -> Result<()> {
        let mut inner = self
            .inner
            .try_lock_for(CLOSE_WAIT)
            .ok_or_else(|| Error::teardown("connection busy"))?;
        *inner = Inner::Closed;
        Ok(())
    }
}

struct HandleExec<'a>(&'a NormalConnection);

impl Execute for HandleExec<'_> {
    fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.0.execute(sql)
    }
}

/// An open transaction on a blocking session.
///
/// Rolled back on drop unless committed.
#[derive(Debug)]
pub struct Transaction<'a> {
    session: &'a mut Session,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(session: &'a mut Session) -> Result<Self> {
        session.begin()?;
        Ok(Self {
            session,
            finished: false,
        })
    }

    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.session.execute(sql)
    }

    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.finished = true;
        self.session.commit()
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.finished = true;
        self.session.rollback()
    }
}

impl Execute for Transaction<'_> {
    fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.execute(sql)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.session.rollback()
        {
            tracing::warn!(error = %e, "Rollback of unfinished transaction failed");
        }
    }
}

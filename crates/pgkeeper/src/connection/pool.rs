//! Blocking connection pool using [`r2d2`].
//!
//! A borrow taken with [`PoolConnection::transaction`] is recorded for the
//! current thread, so handle-level calls (`execute`, `commit`, `cursor`)
//! inside the scope run on that same connection. Scopes nest; the innermost
//! borrow for a given pool wins.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use r2d2::ManageConnection;

use super::{
    ConnectionState, HandleOptions, InstanceId, Lifecycle, PoolStatus, next_instance_id, settle,
};
use crate::config::ConnectionType;
use crate::cursor::{Cursor, Execute};
use crate::driver::{ConnectParams, QueryResult, SyncConnector};
use crate::error::StateError;
use crate::session::Session;
use crate::{Error, Result};

type SharedSession = Rc<RefCell<Option<PooledSession>>>;

thread_local! {
    static THREAD_BORROWS: RefCell<HashMap<InstanceId, Vec<SharedSession>>> =
        RefCell::new(HashMap::new());
}

#[derive(Debug)]
struct SessionManager {
    connector: Arc<dyn SyncConnector>,
    params: ConnectParams,
}

impl ManageConnection for SessionManager {
    type Connection = Session;
    type Error = Error;

    fn connect(&self) -> Result<Session> {
        let client = self.connector.connect(&self.params)?;
        crate::metrics::record_connection_opened(ConnectionType::Pool);
        Ok(Session::new(client, false))
    }

    fn is_valid(&self, conn: &mut Session) -> Result<()> {
        conn.ping()
    }

    fn has_broken(&self, conn: &mut Session) -> bool {
        conn.is_closed()
    }
}

#[derive(Debug)]
struct TracingErrorHandler;

impl r2d2::HandleError<Error> for TracingErrorHandler {
    fn handle_error(&self, error: Error) {
        tracing::warn!(error = %error, "Pool connection error");
    }
}

enum Slot {
    Idle,
    Open(r2d2::Pool<SessionManager>),
    Closed,
}

/// Blocking pool shared by many threads.
pub struct PoolConnection {
    id: InstanceId,
    options: HandleOptions,
    connector: Arc<dyn SyncConnector>,
    slot: RwLock<Slot>,
}

impl fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("PoolConnection")
            .field("id", &self.id)
            .field("size", &status.size)
            .field("available", &status.available)
            .field("max_size", &status.max_size)
            .finish_non_exhaustive()
    }
}

impl PoolConnection {
    pub(crate) fn new(options: HandleOptions, connector: Arc<dyn SyncConnector>) -> Self {
        Self {
            id: next_instance_id(),
            options,
            connector,
            slot: RwLock::new(Slot::Idle),
        }
    }

    fn build_pool(&self) -> Result<r2d2::Pool<SessionManager>> {
        let manager = SessionManager {
            connector: Arc::clone(&self.connector),
            params: self.options.params.clone(),
        };
        // Surface bad credentials now instead of after `timeout`.
        drop(manager.connect()?);

        let opts = &self.options.pool;
        let pool = r2d2::Pool::builder()
            .max_size(opts.max_size)
            .min_idle(Some(opts.min_size))
            .connection_timeout(opts.timeout)
            .idle_timeout(opts.max_idle)
            .max_lifetime(opts.max_lifetime)
            .test_on_check_out(opts.check_on_checkout)
            .error_handler(Box::new(TracingErrorHandler))
            .build(manager)?;

        tracing::info!(
            pool.id = self.id,
            min_size = opts.min_size,
            max_size = opts.max_size,
            "Connection pool opened"
        );
        Ok(pool)
    }

    /// Open the pool and pre-warm `min_size` connections. Idempotent.
    pub fn connect(&self) -> Result<()> {
        let mut slot = self.slot.write();
        match *slot {
            Slot::Open(_) => Ok(()),
            Slot::Closed => Err(Error::State(StateError::Closed)),
            Slot::Idle => {
                *slot = Slot::Open(self.build_pool()?);
                Ok(())
            }
        }
    }

    /// Drop the pool; borrowed connections close when returned.
    pub fn disconnect(&self) {
        let mut slot = self.slot.write();
        if matches!(*slot, Slot::Open(_)) {
            *slot = Slot::Idle;
            tracing::debug!(pool.id = self.id, "Connection pool closed");
        }
    }

    fn pool(&self) -> Result<r2d2::Pool<SessionManager>> {
        if let Slot::Open(pool) = &*self.slot.read() {
            return Ok(pool.clone());
        }
        self.connect()?;
        match &*self.slot.read() {
            Slot::Open(pool) => Ok(pool.clone()),
            Slot::Closed => Err(Error::State(StateError::Closed)),
            Slot::Idle => Err(Error::State(StateError::NotConnected)),
        }
    }

    /// Borrow a connection until the returned guard drops.
    pub fn acquire(&self) -> Result<PooledSession> {
        let pool = self.pool()?;
        let started = Instant::now();
        let mut conn = pool
            .get()
            .inspect_err(|_| crate::metrics::record_checkout_error(ConnectionType::Pool))?;
        crate::metrics::record_checkout(ConnectionType::Pool, started.elapsed());
        conn.apply_settings(&self.options.session_settings);
        Ok(PooledSession { conn })
    }

    /// Borrow a connection for the duration of `f`, committing if it
    /// returns `Ok` and rolling back otherwise. The connection goes back to
    /// the pool exactly once, even if `f` panics.
    pub fn transaction<T>(&self, f: impl FnOnce(&PoolScope) -> Result<T>) -> Result<T> {
        let scope = PoolScope::enter(self.id, self.acquire()?);
        let body = f(&scope);
        let end = scope.finish(body.is_ok());
        drop(scope);
        settle(body, end)
    }

    fn current_borrow(&self) -> Option<SharedSession> {
        THREAD_BORROWS
            .try_with(|borrows| {
                borrows
                    .borrow()
                    .get(&self.id)
                    .and_then(|stack| stack.last().cloned())
            })
            .ok()
            .flatten()
    }

    /// Run on this thread's borrowed connection.
    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        let shared = self
            .current_borrow()
            .ok_or(Error::State(StateError::NoBorrow))?;
        with_shared(&shared, |s| s.execute(sql))
    }

    /// No-op when this thread holds no borrow.
    pub fn commit(&self) -> Result<()> {
        self.current_borrow()
            .map_or(Ok(()), |shared| with_shared(&shared, PooledSession::commit))
    }

    pub fn rollback(&self) -> Result<()> {
        self.current_borrow()
            .map_or(Ok(()), |shared| with_shared(&shared, PooledSession::rollback))
    }

    pub fn cursor(&self) -> Result<Cursor<'_>> {
        let shared = self
            .current_borrow()
            .ok_or(Error::State(StateError::NoBorrow))?;
        Ok(Cursor::new(SharedExec(shared)))
    }

    pub fn in_transaction(&self) -> bool {
        self.current_borrow().is_some_and(|shared| {
            shared
                .borrow()
                .as_ref()
                .is_some_and(PooledSession::in_transaction)
        })
    }

    pub fn status(&self) -> PoolStatus {
        match &*self.slot.read() {
            Slot::Open(pool) => {
                let state = pool.state();
                PoolStatus {
                    size: state.connections as usize,
                    available: state.idle_connections as usize,
                    max_size: pool.max_size() as usize,
                }
            }
            Slot::Idle | Slot::Closed => PoolStatus {
                max_size: self.options.pool.max_size as usize,
                ..PoolStatus::default()
            },
        }
    }

    /// `SELECT 1` on one connection, then hold `min(max, min + 1)` at once.
    pub fn test_connection(&self) -> Result<()> {
        self.acquire()?.ping()?;
        let want = self.options.pool.hold_count();
        let held = (0..want)
            .map(|_| self.acquire())
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            pool.id = self.id,
            held = held.len(),
            "Pool test passed"
        );
        Ok(())
    }
}

impl Lifecycle for PoolConnection {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Pool
    }

    fn state(&self) -> ConnectionState {
        match &*self.slot.read() {
            Slot::Idle => ConnectionState::Uninitialized,
            Slot::Closed => ConnectionState::Closed,
            Slot::Open(pool) => {
                let state = pool.state();
                if state.connections > state.idle_connections {
                    ConnectionState::Borrowed
                } else {
                    ConnectionState::Open
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        *self.slot.write() = Slot::Closed;
        Ok(())
    }
}

fn with_shared<T>(
    shared: &SharedSession,
    f: impl FnOnce(&mut PooledSession) -> Result<T>,
) -> Result<T> {
    let mut slot = shared.borrow_mut();
    let session = slot
        .as_mut()
        .ok_or(Error::State(StateError::ReturnedToPool))?;
    f(session)
}

struct SharedExec(SharedSession);

impl Execute for SharedExec {
    fn run(&mut self, sql: &str) -> Result<QueryResult> {
        with_shared(&self.0, |s| s.execute(sql))
    }
}

/// A connection borrowed from a [`PoolConnection`].
///
/// Returned to the pool on drop, after rolling back any open transaction.
pub struct PooledSession {
    conn: r2d2::PooledConnection<SessionManager>,
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &*self.conn)
            .finish()
    }
}

impl PooledSession {
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.conn.execute(sql)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.conn.rollback()
    }

    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    pub fn ping(&mut self) -> Result<()> {
        self.conn.ping()
    }
}

impl Execute for PooledSession {
    fn run(&mut self, sql: &str) -> Result<QueryResult> {
        self.execute(sql)
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.conn.in_transaction()
            && let Err(e) = self.conn.rollback()
        {
            tracing::warn!(error = %e, "Rollback before return to pool failed");
        }
    }
}

/// A thread's registered borrow, alive for one [`PoolConnection::transaction`].
pub struct PoolScope {
    pool: InstanceId,
    shared: SharedSession,
}

impl fmt::Debug for PoolScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolScope")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PoolScope {
    fn enter(pool: InstanceId, session: PooledSession) -> Self {
        let shared = Rc::new(RefCell::new(Some(session)));
        THREAD_BORROWS.with(|borrows| {
            borrows
                .borrow_mut()
                .entry(pool)
                .or_default()
                .push(Rc::clone(&shared));
        });
        Self { pool, shared }
    }

    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        with_shared(&self.shared, |s| s.execute(sql))
    }

    pub fn commit(&self) -> Result<()> {
        with_shared(&self.shared, PooledSession::commit)
    }

    pub fn rollback(&self) -> Result<()> {
        with_shared(&self.shared, PooledSession::rollback)
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(SharedExec(Rc::clone(&self.shared)))
    }

    fn finish(&self, commit: bool) -> Result<()> {
        if commit { self.commit() } else { self.rollback() }
    }
}

impl Drop for PoolScope {
    fn drop(&mut self) {
        let _ = THREAD_BORROWS.try_with(|borrows| {
            let mut borrows = borrows.borrow_mut();
            if let Some(stack) = borrows.get_mut(&self.pool) {
                if let Some(pos) = stack.iter().rposition(|s| Rc::ptr_eq(s, &self.shared)) {
                    stack.remove(pos);
                }
                if stack.is_empty() {
                    borrows.remove(&self.pool);
                }
            }
        });
        // Return now, even if a stale cursor still holds the Rc.
        self.shared.borrow_mut().take();
    }
}

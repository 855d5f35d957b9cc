//! Scripted in-memory driver for tests and benchmarks.
//!
//! Records every statement per physical connection and can be told to fail
//! connects or specific statements.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::driver::{
    AsyncClient, AsyncConnector, ConnectParams, QueryResult, Row, SyncClient, SyncConnector,
    VALIDATION_QUERY,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicU64,
    connects: AtomicUsize,
    drops: AtomicUsize,
    fail_connect: AtomicBool,
    server_down: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<String>>,
    log: Mutex<Vec<(u64, String)>>,
    params: Mutex<Vec<ConnectParams>>,
}

/// Driver double implementing both connector traits.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every statement equal to `sql` fail with a query error.
    pub fn fail_statement(&self, sql: &str) {
        self.state.failing.lock().insert(sql.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.failing.lock().clear();
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Mark every connection, open or future, as closed by the server.
    pub fn set_server_down(&self, down: bool) {
        self.state.server_down.store(down, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    /// Physical connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Physical connections dropped so far.
    pub fn drop_count(&self) -> usize {
        self.state.drops.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.connect_count() - self.drop_count()
    }

    /// All statements, in execution order.
    pub fn statements(&self) -> Vec<String> {
        self.state.log.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Statements executed on one physical connection.
    pub fn statements_for(&self, connection: u64) -> Vec<String> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(id, _)| *id == connection)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Id of the connection that ran `sql` most recently.
    pub fn connection_of(&self, sql: &str) -> Option<u64> {
        self.state
            .log
            .lock()
            .iter()
            .rev()
            .find(|(_, s)| s == sql)
            .map(|(id, _)| *id)
    }

    pub fn count_of(&self, sql: &str) -> usize {
        self.state.log.lock().iter().filter(|(_, s)| s == sql).count()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    /// Parameters of every connect attempt.
    pub fn connect_params(&self) -> Vec<ConnectParams> {
        self.state.params.lock().clone()
    }

    fn open(&self, params: &ConnectParams) -> Result<MockClient> {
        self.state.params.lock().push(params.clone());
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("mock: connection refused"));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn delay(&self) -> Option<Duration> {
        *self.state.connect_delay.lock()
    }
}

impl SyncConnector for MockDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SyncClient>> {
        if let Some(delay) = self.delay() {
            std::thread::sleep(delay);
        }
        Ok(Box::new(self.open(params)?))
    }
}

#[async_trait]
impl AsyncConnector for MockDriver {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn AsyncClient>> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        Ok(Box::new(self.open(params)?))
    }
}

#[derive(Debug)]
struct MockClient {
    id: u64,
    state: Arc<MockState>,
}

impl MockClient {
    fn run(&self, sql: &str) -> Result<QueryResult> {
        if self.state.server_down.load(Ordering::SeqCst) {
            return Err(Error::connection("mock: server closed the connection"));
        }
        self.state.log.lock().push((self.id, sql.to_string()));
        if self.state.failing.lock().contains(sql) {
            return Err(Error::query(format!("mock: statement failed: {sql}")));
        }

        if sql == VALIDATION_QUERY {
            return Ok(QueryResult {
                columns: vec!["?column?".into()],
                rows: vec![Row::new(vec![Some("1".into())])],
                rows_affected: 1,
            });
        }
        if sql.starts_with("SELECT ") {
            return Ok(QueryResult {
                columns: vec!["connection_id".into()],
                rows: vec![Row::new(vec![Some(self.id.to_string())])],
                rows_affected: 1,
            });
        }
        Ok(QueryResult::default())
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.state.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl SyncClient for MockClient {
    fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        self.run(sql)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.run(sql).map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.state.server_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncClient for MockClient {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        self.run(sql)
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.run(sql).map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.state.server_down.load(Ordering::SeqCst)
    }
}

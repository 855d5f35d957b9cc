//! Driver seam.
//!
//! Variants only talk to PostgreSQL through these traits. [`PostgresDriver`]
//! is the production implementation; tests use the scripted driver in
//! [`crate::testing`].

mod params;
mod pg;

use std::fmt;

use async_trait::async_trait;
use tokio_postgres::SimpleQueryMessage;

pub use self::params::{ConnectParams, SslMode};
pub use self::pg::PostgresDriver;
use crate::Result;

/// Statement used for health checks and `test_connection`.
pub const VALIDATION_QUERY: &str = "SELECT 1";

/// One result row in text form (simple query protocol).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub const fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Column value; `None` for SQL NULL or an out-of-range index.
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(Option::as_deref)
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub const fn len(&self) -> usize {
        self.values.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    pub(crate) fn from_messages(messages: Vec<SimpleQueryMessage>) -> Self {
        let mut result = Self::default();
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    result.columns = columns.iter().map(|c| c.name().to_string()).collect();
                }
                SimpleQueryMessage::Row(row) => {
                    let values = (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect();
                    result.rows.push(Row::new(values));
                }
                SimpleQueryMessage::CommandComplete(n) => result.rows_affected = n,
                _ => {}
            }
        }
        result
    }
}

/// Blocking connection to the server.
pub trait SyncClient: Send {
    fn simple_query(&mut self, sql: &str) -> Result<QueryResult>;

    fn batch_execute(&mut self, sql: &str) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens blocking connections.
pub trait SyncConnector: Send + Sync + fmt::Debug {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SyncClient>>;
}

/// Async connection to the server.
#[async_trait]
pub trait AsyncClient: Send {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult>;

    async fn batch_execute(&mut self, sql: &str) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens async connections.
#[async_trait]
pub trait AsyncConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn AsyncClient>>;
}

//! DB-API style cursors.
//!
//! A cursor runs statements through whatever it was created from (a handle,
//! a transaction, a borrowed pool connection) and buffers the last result.

use std::fmt;

use async_trait::async_trait;

use crate::Result;
use crate::driver::{QueryResult, Row};

const DEFAULT_ARRAYSIZE: usize = 1;

/// Something that can run one statement.
pub trait Execute {
    fn run(&mut self, sql: &str) -> Result<QueryResult>;
}

impl<T: Execute + ?Sized> Execute for &mut T {
    fn run(&mut self, sql: &str) -> Result<QueryResult> {
        (**self).run(sql)
    }
}

#[async_trait]
pub trait AsyncExecute: Send {
    async fn run(&mut self, sql: &str) -> Result<QueryResult>;
}

#[async_trait]
impl<T: AsyncExecute + ?Sized> AsyncExecute for &mut T {
    async fn run(&mut self, sql: &str) -> Result<QueryResult> {
        (**self).run(sql).await
    }
}

#[derive(Debug, Default)]
struct ResultBuffer {
    result: Option<QueryResult>,
    position: usize,
}

impl ResultBuffer {
    fn load(&mut self, result: QueryResult) {
        self.result = Some(result);
        self.position = 0;
    }

    fn remaining(&self) -> &[Row] {
        match &self.result {
            Some(r) => r.rows.get(self.position..).unwrap_or_default(),
            None => &[],
        }
    }

    fn take(&mut self, n: usize) -> Vec<Row> {
        let rows: Vec<Row> = self.remaining().iter().take(n).cloned().collect();
        self.position += rows.len();
        rows
    }

    fn rowcount(&self) -> Option<u64> {
        self.result.as_ref().map(|r| {
            if r.columns.is_empty() {
                r.rows_affected
            } else {
                r.rows.len() as u64
            }
        })
    }

    fn description(&self) -> &[String] {
        self.result
            .as_ref()
            .map(|r| r.columns.as_slice())
            .unwrap_or_default()
    }
}

/// Blocking cursor.
pub struct Cursor<'a> {
    exec: Box<dyn Execute + 'a>,
    buffer: ResultBuffer,
    /// Default batch size for [`Cursor::fetchmany`].
    pub arraysize: usize,
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("rowcount", &self.rowcount())
            .field("arraysize", &self.arraysize)
            .finish_non_exhaustive()
    }
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(exec: impl Execute + 'a) -> Self {
        Self {
            exec: Box::new(exec),
            buffer: ResultBuffer::default(),
            arraysize: DEFAULT_ARRAYSIZE,
        }
    }

    pub fn execute(&mut self, sql: &str) -> Result<&mut Self> {
        let result = self.exec.run(sql)?;
        self.buffer.load(result);
        Ok(self)
    }

    pub fn fetchone(&mut self) -> Option<Row> {
        self.buffer.take(1).pop()
    }

    /// Up to `size` rows, or `arraysize` rows when `size` is `None`.
    pub fn fetchmany(&mut self, size: Option<usize>) -> Vec<Row> {
        self.buffer.take(size.unwrap_or(self.arraysize))
    }

    pub fn fetchall(&mut self) -> Vec<Row> {
        self.buffer.take(usize::MAX)
    }

    /// Rows returned or affected by the last statement; `None` before any.
    pub fn rowcount(&self) -> Option<u64> {
        self.buffer.rowcount()
    }

    /// Column names of the last result.
    pub fn description(&self) -> &[String] {
        self.buffer.description()
    }
}

/// Async cursor.
pub struct AsyncCursor<'a> {
    exec: Box<dyn AsyncExecute + 'a>,
    buffer: ResultBuffer,
    pub arraysize: usize,
}

impl fmt::Debug for AsyncCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCursor")
            .field("rowcount", &self.rowcount())
            .field("arraysize", &self.arraysize)
            .finish_non_exhaustive()
    }
}

impl<'a> AsyncCursor<'a> {
    pub(crate) fn new(exec: impl AsyncExecute + 'a) -> Self {
        Self {
            exec: Box::new(exec),
            buffer: ResultBuffer::default(),
            arraysize: DEFAULT_ARRAYSIZE,
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<&mut Self> {
        let result = self.exec.run(sql).await?;
        self.buffer.load(result);
        Ok(self)
    }

    pub fn fetchone(&mut self) -> Option<Row> {
        self.buffer.take(1).pop()
    }

    pub fn fetchmany(&mut self, size: Option<usize>) -> Vec<Row> {
        self.buffer.take(size.unwrap_or(self.arraysize))
    }

    pub fn fetchall(&mut self) -> Vec<Row> {
        self.buffer.take(usize::MAX)
    }

    pub fn rowcount(&self) -> Option<u64> {
        self.buffer.rowcount()
    }

    pub fn description(&self) -> &[String] {
        self.buffer.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(Vec<QueryResult>);

    impl Execute for Canned {
        fn run(&mut self, _sql: &str) -> Result<QueryResult> {
            Ok(self.0.remove(0))
        }
    }

    #[async_trait]
    impl AsyncExecute for Canned {
        async fn run(&mut self, _sql: &str) -> Result<QueryResult> {
            Ok(self.0.remove(0))
        }
    }

    fn rows(n: usize) -> QueryResult {
        QueryResult {
            columns: vec!["n".into()],
            rows: (0..n).map(|i| Row::new(vec![Some(i.to_string())])).collect(),
            rows_affected: n as u64,
        }
    }

    #[test]
    fn test_fetch_sequence() {
        let mut cursor = Cursor::new(Canned(vec![rows(5)]));
        assert_eq!(cursor.rowcount(), None);

        cursor.execute("SELECT n FROM t").unwrap();
        assert_eq!(cursor.description(), ["n".to_string()]);
        assert_eq!(cursor.rowcount(), Some(5));
        assert_eq!(cursor.fetchone().unwrap().get(0), Some("0"));
        assert_eq!(cursor.fetchmany(Some(2)).len(), 2);
        cursor.arraysize = 10;
        assert_eq!(cursor.fetchmany(None).len(), 2);
        assert!(cursor.fetchone().is_none());
        assert!(cursor.fetchall().is_empty());
    }

    #[test]
    fn test_rowcount_for_dml() {
        let dml = QueryResult {
            rows_affected: 3,
            ..QueryResult::default()
        };
        let mut cursor = Cursor::new(Canned(vec![dml]));
        cursor.execute("DELETE FROM t").unwrap();
        assert_eq!(cursor.rowcount(), Some(3));
        assert!(cursor.description().is_empty());
    }

    #[test]
    fn test_empty_select_keeps_description() {
        let empty = QueryResult {
            columns: vec!["id".into(), "name".into()],
            ..QueryResult::default()
        };
        let mut cursor = Cursor::new(Canned(vec![empty]));
        cursor.execute("SELECT id, name FROM t WHERE false").unwrap();
        assert_eq!(cursor.description(), ["id".to_string(), "name".to_string()]);
        assert_eq!(cursor.rowcount(), Some(0));
        assert!(cursor.fetchone().is_none());
    }

    #[test]
    fn test_execute_replaces_buffer() {
        let mut cursor = Cursor::new(Canned(vec![rows(3), rows(1)]));
        cursor.execute("a").unwrap();
        cursor.fetchone();
        cursor.execute("b").unwrap();
        assert_eq!(cursor.fetchall().len(), 1);
    }

    #[tokio::test]
    async fn test_async_cursor() {
        let mut cursor = AsyncCursor::new(Canned(vec![rows(2)]));
        cursor.execute("SELECT n FROM t").await.unwrap();
        assert_eq!(cursor.fetchall().len(), 2);
        assert_eq!(cursor.rowcount(), Some(2));
    }
}

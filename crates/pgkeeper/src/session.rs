//! Transaction-tracking wrappers around a driver client.
//!
//! With `autocommit` off (the default) the first statement on an idle
//! session opens a transaction; `commit` and `rollback` close it and are
//! no-ops when nothing is open.

use std::fmt;

use crate::config::Settings;
use crate::driver::{AsyncClient, QueryResult, SyncClient, VALIDATION_QUERY};
use crate::sql::{self, BEGIN, COMMIT, ROLLBACK};
use crate::{Error, Result};

/// Blocking session.
pub struct Session {
    client: Box<dyn SyncClient>,
    autocommit: bool,
    in_transaction: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("autocommit", &self.autocommit)
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(client: Box<dyn SyncClient>, autocommit: bool) -> Self {
        Self {
            client,
            autocommit,
            in_transaction: false,
        }
    }

    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if !self.autocommit {
            self.begin()?;
        }
        self.client.simple_query(sql)
    }

    pub fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.client.batch_execute(BEGIN)?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        // The server ends the block whether COMMIT succeeds or not.
        self.in_transaction = false;
        self.client.batch_execute(COMMIT)
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute(ROLLBACK)
    }

    /// Issue `SET` for every session setting. Failures are logged, not fatal.
    pub fn apply_settings(&mut self, settings: &Settings) -> usize {
        let mut applied = 0;
        for (name, statement) in sql::set_statements(settings) {
            match statement.and_then(|stmt| self.client.batch_execute(&stmt)) {
                Ok(()) => applied += 1,
                Err(e) => log_setting_failure(&name, &e),
            }
        }
        applied
    }

    /// Round-trip `SELECT 1` outside of any transaction bookkeeping.
    pub fn ping(&mut self) -> Result<()> {
        self.client.simple_query(VALIDATION_QUERY).map(|_| ())
    }

    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub const fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Refused while a transaction is open.
    pub fn set_autocommit(&mut self, on: bool) -> Result<()> {
        if self.in_transaction {
            return Err(Error::query("Cannot change autocommit inside a transaction"));
        }
        self.autocommit = on;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

/// Async session. Also remembers whether a borrower walked away mid-transaction.
pub struct AsyncSession {
    client: Box<dyn AsyncClient>,
    autocommit: bool,
    in_transaction: bool,
    abandoned: bool,
}

impl fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSession")
            .field("autocommit", &self.autocommit)
            .field("in_transaction", &self.in_transaction)
            .field("abandoned", &self.abandoned)
            .finish_non_exhaustive()
    }
}

impl AsyncSession {
    pub fn new(client: Box<dyn AsyncClient>, autocommit: bool) -> Self {
        Self {
            client,
            autocommit,
            in_transaction: false,
            abandoned: false,
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.recover().await?;
        if !self.autocommit {
            self.begin().await?;
        }
        self.client.simple_query(sql).await
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.recover().await?;
        if !self.in_transaction {
            self.client.batch_execute(BEGIN).await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute(COMMIT).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.abandoned = false;
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute(ROLLBACK).await
    }

    /// Flag an open transaction for rollback before the next use. Callable
    /// from `Drop`, where awaiting is impossible.
    pub fn abandon(&mut self) {
        if self.in_transaction {
            self.abandoned = true;
        }
    }

    /// Roll back a transaction left behind by a cancelled borrower.
    pub async fn recover(&mut self) -> Result<()> {
        if self.abandoned {
            tracing::debug!("Rolling back abandoned transaction");
            self.rollback().await?;
        }
        Ok(())
    }

    pub async fn apply_settings(&mut self, settings: &Settings) -> usize {
        let mut applied = 0;
        for (name, statement) in sql::set_statements(settings) {
            let outcome = match statement {
                Ok(stmt) => self.client.batch_execute(&stmt).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => applied += 1,
                Err(e) => log_setting_failure(&name, &e),
            }
        }
        applied
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.client.simple_query(VALIDATION_QUERY).await.map(|_| ())
    }

    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub const fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub const fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn set_autocommit(&mut self, on: bool) -> Result<()> {
        if self.in_transaction {
            return Err(Error::query("Cannot change autocommit inside a transaction"));
        }
        self.autocommit = on;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn log_setting_failure(name: &str, error: &Error) {
    tracing::warn!(setting = name, error = %error, "Could not apply session setting");
}

use std::sync::Arc;

use thiserror::Error;

use crate::config::ConnectionType;

/// State reported when an operation cannot run against a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The handle was never connected or has been disconnected.
    NotConnected,
    /// The handle (or its pool) has been closed.
    Closed,
    /// The borrowed connection was already returned to its pool.
    ReturnedToPool,
    /// No connection is borrowed by the current thread or task.
    NoBorrow,
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NotConnected => "no active connection",
            Self::Closed => "connection is closed",
            Self::ReturnedToPool => "connection already returned to pool",
            Self::NoBorrow => "no connection borrowed in the current scope",
        };
        f.write_str(msg)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Invalid connection state: {0}")]
    State(StateError),

    #[error("Failed to construct {connection_type} handle for {fingerprint}: {source}")]
    CacheConstruction {
        fingerprint: String,
        connection_type: ConnectionType,
        #[source]
        source: Arc<Self>,
    },

    #[error("Teardown error: {0}")]
    Teardown(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown(msg.into())
    }

    /// Failure while establishing a connection. Server errors during startup
    /// (authentication, unknown database) keep their SQLSTATE.
    pub fn connect_failed(err: &tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => Self::Connection(format!("{} ({})", db.message(), db.code().code())),
            None => Self::Connection(err.to_string()),
        }
    }

    /// Returns the innermost error, looking through construction wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::CacheConstruction { source, .. } => source.root_cause(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self.root_cause(), Self::Config(_))
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self.root_cause(), Self::Connection(_))
    }

    #[must_use]
    pub fn is_query(&self) -> bool {
        matches!(self.root_cause(), Self::Query(_))
    }

    #[must_use]
    pub const fn is_construction(&self) -> bool {
        matches!(self, Self::CacheConstruction { .. })
    }

    #[must_use]
    pub const fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        // Statement errors carry a SQLSTATE; connect failures go through `connect_failed`.
        if let Some(db) = err.as_db_error() {
            Self::Query(format!("{} ({})", db.message(), db.code().code()))
        } else {
            Self::Connection(err.to_string())
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<deadpool::managed::PoolError<Self>> for Error {
    fn from(err: deadpool::managed::PoolError<Self>) -> Self {
        use deadpool::managed::PoolError;

        match err {
            PoolError::Backend(e) => e,
            PoolError::Closed => Self::State(StateError::Closed),
            PoolError::Timeout(kind) => {
                Self::Pool(format!("timed out waiting for pooled connection ({kind:?})"))
            }
            other => Self::Pool(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

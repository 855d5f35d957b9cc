//! PostgreSQL connectors over `postgres` (blocking) and `tokio-postgres`.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::NoTls;
use tokio_postgres::config::SslMode as PgSslMode;

use super::{
    AsyncClient, AsyncConnector, ConnectParams, QueryResult, SslMode, SyncClient, SyncConnector,
};
use crate::{Error, Result};

const DEFAULT_HOST: &str = "localhost";

/// Production driver backed by the `postgres` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl SyncConnector for PostgresDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SyncClient>> {
        let config = postgres::Config::from(build_config(params));
        let client = match tls::connector(params)? {
            Some(tls) => config.connect(tls),
            None => config.connect(NoTls),
        }
        .map_err(|e| Error::connect_failed(&e))?;
        Ok(Box::new(BlockingClient(client)))
    }
}

#[async_trait]
impl AsyncConnector for PostgresDriver {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn AsyncClient>> {
        let config = build_config(params);
        let client = match tls::connector(params)? {
            Some(tls) => config
                .connect(tls)
                .await
                .map(spawn_connection)
                .map_err(|e| Error::connect_failed(&e))?,
            None => config
                .connect(NoTls)
                .await
                .map(spawn_connection)
                .map_err(|e| Error::connect_failed(&e))?,
        };
        Ok(Box::new(AsyncPgClient(client)))
    }
}

fn build_config(params: &ConnectParams) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config.host(params.host.as_deref().unwrap_or(DEFAULT_HOST));

    if let Some(port) = params.port {
        config.port(port);
    }
    if let Some(user) = &params.user {
        config.user(user);
    }
    if let Some(password) = &params.password {
        config.password(password);
    }
    if let Some(dbname) = &params.dbname {
        config.dbname(dbname);
    }
    if let Some(name) = &params.application_name {
        config.application_name(name);
    }
    if let Some(timeout) = params.connect_timeout {
        config.connect_timeout(timeout);
    }
    if let Some(enabled) = params.keepalives {
        config.keepalives(enabled);
    }
    if let Some(idle) = params.keepalives_idle {
        config.keepalives_idle(idle);
    }
    if let Some(interval) = params.keepalives_interval {
        config.keepalives_interval(interval);
    }
    if let Some(count) = params.keepalives_count {
        config.keepalives_retries(count);
    }

    config.ssl_mode(match params.sslmode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow | SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
    });

    config
}

/// Drive the connection half on the runtime; the client is useless without it.
fn spawn_connection<S, T>(
    (client, connection): (tokio_postgres::Client, tokio_postgres::Connection<S, T>),
) -> tokio_postgres::Client
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "PostgreSQL connection closed with error");
        }
    });
    client
}

struct BlockingClient(postgres::Client);

impl SyncClient for BlockingClient {
    fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        Ok(QueryResult::from_messages(self.0.simple_query(sql)?))
    }

    fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.0.batch_execute(sql).map_err(Error::from)
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

struct AsyncPgClient(tokio_postgres::Client);

#[async_trait]
impl AsyncClient for AsyncPgClient {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        Ok(QueryResult::from_messages(self.0.simple_query(sql).await?))
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.0.batch_execute(sql).await.map_err(Error::from)
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[cfg(feature = "tls")]
mod tls {
    use native_tls::{Certificate, Identity, TlsConnector};
    use postgres_native_tls::MakeTlsConnector;

    use super::{ConnectParams, SslMode};
    use crate::{Error, Result};

    /// TLS connector for the requested sslmode; `None` when TLS is disabled.
    pub(super) fn connector(params: &ConnectParams) -> Result<Option<MakeTlsConnector>> {
        if params.sslmode == SslMode::Disable {
            return Ok(None);
        }

        let mut builder = TlsConnector::builder();
        match params.sslmode {
            SslMode::VerifyFull => {}
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            // libpq only verifies the chain in these modes when a root cert is given.
            _ if params.sslrootcert.is_some() => {
                builder.danger_accept_invalid_hostnames(true);
            }
            _ => {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
        }

        if let Some(root) = &params.sslrootcert {
            let pem = read(root)?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| Error::config(format!("Invalid sslrootcert {}: {e}", root.display())))?;
            builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&params.sslcert, &params.sslkey) {
            let identity = Identity::from_pkcs8(&read(cert)?, &read(key)?)
                .map_err(|e| Error::config(format!("Invalid client certificate/key: {e}")))?;
            builder.identity(identity);
        }

        let connector = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build TLS connector: {e}")))?;
        Ok(Some(MakeTlsConnector::new(connector)))
    }

    fn read(path: &std::path::Path) -> Result<Vec<u8>> {
        std::fs::read(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {e}", path.display())))
    }
}

#[cfg(not(feature = "tls"))]
mod tls {
    use super::ConnectParams;
    use crate::{Error, Result};

    pub(super) fn connector(params: &ConnectParams) -> Result<Option<tokio_postgres::NoTls>> {
        if params.sslmode.requires_tls() {
            return Err(Error::config(
                "sslmode requires TLS but pgkeeper was built without the `tls` feature",
            ));
        }
        Ok(None)
    }
}

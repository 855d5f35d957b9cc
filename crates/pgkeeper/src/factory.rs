//! Turning a [`ConnectionConfig`] into an unconnected [`Handle`].
//!
//! Validation happens here, before any network activity: null settings are
//! dropped, unknown keys are warned about and dropped, connection parameters
//! are parsed and pool ranges are checked.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectionConfig, ConnectionType, PoolSettings, Settings, redact_settings};
use crate::connection::{
    AsyncConnection, AsyncPoolConnection, Handle, HandleOptions, NormalConnection,
    PoolConnection, PoolOptions,
};
use crate::driver::{AsyncConnector, ConnectParams, PostgresDriver, SyncConnector};
use crate::{Error, Result};

/// Connection parameter keys passed to the driver.
pub const CONNECTION_KEYS: &[&str] = &[
    "user",
    "password",
    "host",
    "port",
    "dbname",
    "sslmode",
    "sslcert",
    "sslkey",
    "sslrootcert",
    "connect_timeout",
    "application_name",
    "keepalives",
    "keepalives_idle",
    "keepalives_interval",
    "keepalives_count",
];

/// Builds handles over a pair of connectors. Stateless per call.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    sync: Arc<dyn SyncConnector>,
    async_: Arc<dyn AsyncConnector>,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new(Arc::new(PostgresDriver), Arc::new(PostgresDriver))
    }
}

impl ConnectionFactory {
    pub fn new(sync: Arc<dyn SyncConnector>, async_: Arc<dyn AsyncConnector>) -> Self {
        Self { sync, async_ }
    }

    /// Validate `config` for `connection_type` and build the handle. Nothing
    /// is connected yet.
    pub fn create(&self, config: &ConnectionConfig, connection_type: ConnectionType) -> Result<Handle> {
        let options = prepare(config, connection_type)?;
        Ok(self.build(connection_type, options))
    }

    pub fn build(&self, connection_type: ConnectionType, options: HandleOptions) -> Handle {
        match connection_type {
            ConnectionType::Normal => {
                Handle::Normal(Arc::new(NormalConnection::new(options, Arc::clone(&self.sync))))
            }
            ConnectionType::Pool => {
                Handle::Pool(Arc::new(PoolConnection::new(options, Arc::clone(&self.sync))))
            }
            ConnectionType::Async => {
                Handle::Async(Arc::new(AsyncConnection::new(options, Arc::clone(&self.async_))))
            }
            ConnectionType::AsyncPool => Handle::AsyncPool(Arc::new(AsyncPoolConnection::new(
                options,
                Arc::clone(&self.async_),
            ))),
        }
    }
}

/// Everything [`ConnectionFactory::build`] needs, validated.
pub fn prepare(config: &ConnectionConfig, connection_type: ConnectionType) -> Result<HandleOptions> {
    let settings = filter_settings(&config.connection_settings);
    let params = ConnectParams::from_settings(&settings)?;

    let pool = match config.pool_settings_for(connection_type) {
        Some(group) => pool_options(group)?,
        None => PoolOptions::default(),
    };

    let session_settings = config
        .session_settings
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(HandleOptions {
        params,
        session_settings,
        pool,
    })
}

/// Drop null values and unknown keys. Empty strings, zero and `false` stay.
pub fn filter_settings(settings: &Settings) -> Settings {
    let (known, unknown): (Settings, Settings) = settings
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(key, _)| CONNECTION_KEYS.contains(&key.as_str()));

    if !unknown.is_empty() {
        let keys: Vec<&str> = unknown.keys().map(String::as_str).collect();
        tracing::warn!(
            keys = ?keys,
            settings = ?redact_settings(&unknown),
            "Unknown connection settings ignored"
        );
    }
    known
}

fn pool_options(settings: &PoolSettings) -> Result<PoolOptions> {
    let defaults = PoolOptions::default();
    let min_size = settings.min_size.unwrap_or(defaults.min_size);
    let max_size = settings.max_size.unwrap_or(defaults.max_size);

    if max_size == 0 {
        return Err(Error::config("max_size must be at least 1"));
    }
    if min_size > max_size {
        return Err(Error::config(format!(
            "min_size ({min_size}) cannot exceed max_size ({max_size})"
        )));
    }

    let timeout = match settings.timeout {
        Some(secs) => positive_seconds("timeout", secs)?,
        None => defaults.timeout,
    };
    let max_idle = match settings.max_idle {
        Some(secs) => Some(positive_seconds("max_idle", secs)?),
        None => defaults.max_idle,
    };
    let max_lifetime = match settings.max_lifetime {
        Some(secs) => Some(positive_seconds("max_lifetime", secs)?),
        None => defaults.max_lifetime,
    };

    if !settings.extra.is_empty() {
        let keys: Vec<&str> = settings.extra.keys().map(String::as_str).collect();
        tracing::warn!(keys = ?keys, "Unknown pool settings ignored");
    }

    Ok(PoolOptions {
        min_size,
        max_size,
        timeout,
        max_idle,
        max_lifetime,
        check_on_checkout: settings.check_on_checkout.unwrap_or(defaults.check_on_checkout),
    })
}

fn positive_seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| Error::config(format!("{name} must be a positive number of seconds, got {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingValue;
    use crate::connection::ConnectionState;
    use crate::testing::MockDriver;

    fn factory(driver: &MockDriver) -> ConnectionFactory {
        ConnectionFactory::new(Arc::new(driver.clone()), Arc::new(driver.clone()))
    }

    fn base() -> ConnectionConfig {
        ConnectionConfig::new(ConnectionType::Normal)
            .with_setting("host", "db.internal")
            .with_setting("user", "app")
    }

    #[test]
    fn test_filter_keeps_falsy_values() {
        let mut settings = Settings::new();
        settings.insert("password".into(), "".into());
        settings.insert("port".into(), 0_i64.into());
        settings.insert("keepalives".into(), false.into());
        settings.insert("sslcert".into(), SettingValue::Null);
        settings.insert("fancy_option".into(), "x".into());

        let filtered = filter_settings(&settings);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered["password"], SettingValue::from(""));
        assert_eq!(filtered["port"], SettingValue::Integer(0));
        assert!(!filtered.contains_key("sslcert"));
        assert!(!filtered.contains_key("fancy_option"));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = base().with_pool_settings(PoolSettings::default().with_size(5, 2));
        let err = prepare(&config, ConnectionType::Pool).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("min_size (5) cannot exceed max_size (2)"));

        // The sync group does not constrain async pools.
        assert!(prepare(&config, ConnectionType::AsyncPool).is_ok());
    }

    #[test]
    fn test_zero_max_and_bad_durations_rejected() {
        let zero = base().with_pool_settings(PoolSettings::default().with_size(0, 0));
        assert!(prepare(&zero, ConnectionType::Pool).unwrap_err().is_config());

        let bad_timeout = base().with_pool_settings(PoolSettings::default().with_timeout(-1.0));
        assert!(prepare(&bad_timeout, ConnectionType::Pool).is_err());

        let zero_idle = base().with_pool_settings(PoolSettings::default().with_max_idle(0.0));
        assert!(prepare(&zero_idle, ConnectionType::Pool).is_err());
    }

    #[test]
    fn test_pool_defaults_and_overrides() {
        let config = base().with_async_pool_settings(
            PoolSettings::default()
                .with_size(2, 8)
                .with_timeout(2.5)
                .with_check_on_checkout(true),
        );
        let options = prepare(&config, ConnectionType::AsyncPool).unwrap();
        assert_eq!(options.pool.min_size, 2);
        assert_eq!(options.pool.max_size, 8);
        assert_eq!(options.pool.timeout, Duration::from_millis(2500));
        assert!(options.pool.check_on_checkout);
        assert_eq!(options.pool.max_lifetime, Some(Duration::from_secs(3600)));

        let options = prepare(&config, ConnectionType::Pool).unwrap();
        assert_eq!(options.pool, PoolOptions::default());
    }

    #[test]
    fn test_invalid_connection_value_rejected() {
        let config = base().with_setting("port", "not-a-port");
        assert!(prepare(&config, ConnectionType::Normal).unwrap_err().is_config());
    }

    #[test]
    fn test_session_settings_drop_nulls() {
        let config = base()
            .with_session_setting("work_mem", "64MB")
            .with_session_setting("search_path", SettingValue::Null);
        let options = prepare(&config, ConnectionType::Async).unwrap();
        assert_eq!(options.session_settings.len(), 1);
    }

    #[test]
    fn test_build_is_tagged_and_unconnected() {
        let driver = MockDriver::new();
        let factory = factory(&driver);
        for ty in ConnectionType::ALL {
            let handle = factory.create(&base(), ty).unwrap();
            assert_eq!(handle.connection_type(), ty);
            assert_eq!(handle.state(), ConnectionState::Uninitialized);
        }
        assert_eq!(driver.connect_count(), 0);
    }

    #[test]
    fn test_params_reach_driver() {
        let driver = MockDriver::new();
        let handle = factory(&driver).create(&base(), ConnectionType::Normal).unwrap();
        handle.connect().unwrap();

        let params = driver.connect_params();
        assert_eq!(params[0].host.as_deref(), Some("db.internal"));
        assert_eq!(params[0].user.as_deref(), Some("app"));
    }
}

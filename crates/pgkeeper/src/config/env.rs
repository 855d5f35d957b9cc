//! Environment variable overrides for configuration

use super::{ConnectionConfig, ConnectionType, SettingValue};
use crate::Result;

/// Environment variable names
mod vars {
    pub const PGHOST: &str = "PGHOST";
    pub const PGPORT: &str = "PGPORT";
    pub const PGUSER: &str = "PGUSER";
    pub const PGPASSWORD: &str = "PGPASSWORD";
    pub const PGDATABASE: &str = "PGDATABASE";
    pub const PGSSLMODE: &str = "PGSSLMODE";
    pub const PGAPPNAME: &str = "PGAPPNAME";
    pub const PGCONNECT_TIMEOUT: &str = "PGCONNECT_TIMEOUT";
    pub const PGKEEPER_CONNECTION_TYPE: &str = "PGKEEPER_CONNECTION_TYPE";
}

/// libpq variable -> connection setting key
const SETTING_VARS: &[(&str, &str)] = &[
    (vars::PGHOST, "host"),
    (vars::PGPORT, "port"),
    (vars::PGUSER, "user"),
    (vars::PGPASSWORD, "password"),
    (vars::PGDATABASE, "dbname"),
    (vars::PGSSLMODE, "sslmode"),
    (vars::PGAPPNAME, "application_name"),
    (vars::PGCONNECT_TIMEOUT, "connect_timeout"),
];

/// Apply overrides from the process environment.
pub fn apply_env(config: &mut ConnectionConfig) -> Result<()> {
    apply_env_from(config, |name| std::env::var(name).ok())
}

/// Apply overrides from an arbitrary variable lookup.
pub fn apply_env_from<F>(config: &mut ConnectionConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    for (var, key) in SETTING_VARS {
        if let Some(value) = lookup(var) {
            tracing::debug!(variable = *var, setting = *key, "Applying environment override");
            config
                .connection_settings
                .insert((*key).to_string(), SettingValue::Text(value));
        }
    }

    if let Some(ty) = lookup(vars::PGKEEPER_CONNECTION_TYPE) {
        config.connection_type = ty.parse::<ConnectionType>()?;
    }

    Ok(())
}

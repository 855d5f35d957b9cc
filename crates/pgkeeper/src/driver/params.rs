use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{SettingValue, Settings, redact_settings};
use crate::{Error, Result};

/// libpq SSL negotiation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub const fn requires_tls(self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" | "" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" | "verify_ca" => Ok(Self::VerifyCa),
            "verify-full" | "verify_full" => Ok(Self::VerifyFull),
            other => Err(Error::config(format!("Invalid sslmode: '{other}'"))),
        }
    }
}

/// Typed connection parameters handed to a connector.
#[derive(Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub sslmode: SslMode,
    pub sslcert: Option<PathBuf>,
    pub sslkey: Option<PathBuf>,
    pub sslrootcert: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    pub application_name: Option<String>,
    pub keepalives: Option<bool>,
    pub keepalives_idle: Option<Duration>,
    pub keepalives_interval: Option<Duration>,
    pub keepalives_count: Option<u32>,
    /// The filtered settings these parameters were parsed from.
    pub raw: Settings,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("settings", &redact_settings(&self.raw))
            .finish()
    }
}

impl ConnectParams {
    /// Parse already-filtered connection settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut params = Self {
            raw: settings.clone(),
            ..Self::default()
        };

        for (key, value) in settings {
            match key.as_str() {
                "host" => params.host = text(value),
                "port" => params.port = Some(integer(key, value)?),
                "user" => params.user = text(value),
                "password" => params.password = text(value),
                "dbname" => params.dbname = text(value),
                "sslmode" => {
                    if let Some(mode) = text(value) {
                        params.sslmode = mode.parse()?;
                    }
                }
                // Empty paths mean "unset", matching libpq.
                "sslcert" => params.sslcert = path(value),
                "sslkey" => params.sslkey = path(value),
                "sslrootcert" => params.sslrootcert = path(value),
                "connect_timeout" => params.connect_timeout = Some(seconds(key, value)?),
                "application_name" => params.application_name = text(value),
                "keepalives" => {
                    params.keepalives = Some(value.as_bool().ok_or_else(|| invalid(key, value))?);
                }
                "keepalives_idle" => params.keepalives_idle = Some(seconds(key, value)?),
                "keepalives_interval" => params.keepalives_interval = Some(seconds(key, value)?),
                "keepalives_count" => params.keepalives_count = Some(integer(key, value)?),
                _ => {}
            }
        }

        Ok(params)
    }
}

fn text(value: &SettingValue) -> Option<String> {
    value.to_text()
}

fn path(value: &SettingValue) -> Option<PathBuf> {
    value.to_text().filter(|s| !s.is_empty()).map(PathBuf::from)
}

fn integer<T: TryFrom<i64>>(key: &str, value: &SettingValue) -> Result<T> {
    value
        .as_i64()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| invalid(key, value))
}

fn seconds(key: &str, value: &SettingValue) -> Result<Duration> {
    let secs = value.as_f64().ok_or_else(|| invalid(key, value))?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &SettingValue) -> Error {
    Error::config(format!("Invalid value for connection setting '{key}': {value}"))
}

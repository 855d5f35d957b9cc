//! Connection configuration model.
//!
//! A [`ConnectionConfig`] is the single source every handle is built from. It
//! is hashed as a whole by [`crate::Fingerprint`], so two configs with the same
//! content always map to the same cached handle.

mod dsn;
mod env;
mod file;
mod redact;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use dsn::from_url;
pub use env::{apply_env, apply_env_from};
pub use file::{find_config_file, from_json_str, from_toml_str, load_config, load_from_file};
pub use redact::{REDACTED, is_sensitive_key, redact_config, redact_settings};

use crate::{Error, Result};

/// Settings group: ordered key/value pairs.
pub type Settings = BTreeMap<String, SettingValue>;

/// The four connection variants a handle can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Normal,
    Pool,
    Async,
    AsyncPool,
}

impl ConnectionType {
    pub const ALL: [Self; 4] = [Self::Normal, Self::Pool, Self::Async, Self::AsyncPool];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Pool => "pool",
            Self::Async => "async",
            Self::AsyncPool => "async_pool",
        }
    }

    /// Whether the variant runs on the async runtime.
    pub const fn is_async(self) -> bool {
        matches!(self, Self::Async | Self::AsyncPool)
    }

    pub const fn is_pooled(self) -> bool {
        matches!(self, Self::Pool | Self::AsyncPool)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(Self::Normal),
            "pool" => Ok(Self::Pool),
            "async" => Ok(Self::Async),
            "async_pool" => Ok(Self::AsyncPool),
            other => Err(Error::config(format!(
                "Unsupported connection type: '{other}' (expected normal, pool, async or async_pool)"
            ))),
        }
    }
}

/// A single setting value. `Null` marks an absent setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used for driver parameters and `SET` literals.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(0) => Some(false),
            Self::Integer(1) => Some(true),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Some(true),
                "0" | "false" | "off" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SettingValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Pool sizing and checkout behaviour. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    /// Checkout timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime: Option<f64>,
    /// Run `SELECT 1` before handing out a pooled connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_on_checkout: Option<bool>,
    /// Keys this crate does not understand; kept so they still count toward
    /// the fingerprint, reported as warnings at build time.
    #[serde(flatten)]
    pub extra: Settings,
}

impl PoolSettings {
    #[must_use]
    pub const fn with_size(mut self, min_size: u32, max_size: u32) -> Self {
        self.min_size = Some(min_size);
        self.max_size = Some(max_size);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    #[must_use]
    pub const fn with_check_on_checkout(mut self, enabled: bool) -> Self {
        self.check_on_checkout = Some(enabled);
        self
    }

    #[must_use]
    pub const fn with_max_idle(mut self, secs: f64) -> Self {
        self.max_idle = Some(secs);
        self
    }

    #[must_use]
    pub const fn with_max_lifetime(mut self, secs: f64) -> Self {
        self.max_lifetime = Some(secs);
        self
    }
}

/// Everything needed to build one connection handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_type: ConnectionType,
    pub connection_settings: Settings,
    pub pool_settings: PoolSettings,
    /// GUC parameters issued with `SET` on connect or checkout.
    #[serde(alias = "async_settings")]
    pub session_settings: Settings,
    pub async_pool_settings: PoolSettings,
}

impl ConnectionConfig {
    pub fn new(connection_type: ConnectionType) -> Self {
        Self {
            connection_type,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.connection_settings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_session_setting(
        mut self,
        key: impl Into<String>,
        value: impl Into<SettingValue>,
    ) -> Self {
        self.session_settings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    #[must_use]
    pub fn with_async_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.async_pool_settings = settings;
        self
    }

    /// The explicit override wins over the type named in the config.
    pub fn resolve_type(&self, requested: Option<ConnectionType>) -> ConnectionType {
        requested.unwrap_or(self.connection_type)
    }

    /// Pool settings group used by a pooled variant.
    pub fn pool_settings_for(&self, connection_type: ConnectionType) -> Option<&PoolSettings> {
        match connection_type {
            ConnectionType::Pool => Some(&self.pool_settings),
            ConnectionType::AsyncPool => Some(&self.async_pool_settings),
            ConnectionType::Normal | ConnectionType::Async => None,
        }
    }
}

//! Configuration file loading (TOML, or JSON by extension)

use std::path::{Path, PathBuf};

use super::ConnectionConfig;
use crate::{Error, Result};

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &[
    "./pgkeeper.toml",
    "~/.config/pgkeeper/config.toml",
    "/etc/pgkeeper/config.toml",
];

/// Table name older config files nest everything under.
const LEGACY_ROOT: &str = "postgresql";

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load a config from `path` (or the first default location) and apply
/// libpq-style environment overrides on top.
pub fn load_config(path: Option<&Path>) -> Result<ConnectionConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => find_config_file().ok_or_else(|| {
            Error::config(format!(
                "No configuration file found (looked in {})",
                CONFIG_PATHS.join(", ")
            ))
        })?,
    };

    let mut config = load_from_file(&path)?;
    super::apply_env(&mut config)?;
    Ok(config)
}

/// Load a configuration file without environment overrides.
pub fn load_from_file(path: &Path) -> Result<ConnectionConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let parsed = if is_json {
        from_json_str(&content)
    } else {
        from_toml_str(&content)
    };

    parsed.map_err(|e| {
        Error::config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

pub fn from_toml_str(content: &str) -> Result<ConnectionConfig> {
    let mut table: toml::Table =
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;

    if is_legacy_layout(table.len(), table.contains_key(LEGACY_ROOT))
        && let Some(toml::Value::Table(inner)) = table.remove(LEGACY_ROOT)
    {
        warn_legacy_layout();
        table = inner;
    }

    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| Error::config(e.to_string()))
}

pub fn from_json_str(content: &str) -> Result<ConnectionConfig> {
    let mut value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| Error::config(e.to_string()))?;

    if let Some(map) = value.as_object_mut()
        && is_legacy_layout(map.len(), map.contains_key(LEGACY_ROOT))
        && let Some(inner) = map.remove(LEGACY_ROOT)
    {
        warn_legacy_layout();
        value = inner;
    }

    serde_json::from_value(value).map_err(|e| Error::config(e.to_string()))
}

const fn is_legacy_layout(len: usize, has_root: bool) -> bool {
    len == 1 && has_root
}

fn warn_legacy_layout() {
    tracing::warn!(
        "The top-level '{LEGACY_ROOT}' table is deprecated; move its contents to the document root"
    );
}

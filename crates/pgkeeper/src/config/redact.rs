//! Masking of secret setting values for logs and CLI output

use super::{ConnectionConfig, SettingValue, Settings};

pub const REDACTED: &str = "***REDACTED***";

const SENSITIVE_KEYS: &[&str] = &["password", "sslkey", "sslcert", "sslrootcert"];
const SENSITIVE_SUBSTRINGS: &[&str] = &["token", "secret", "credential"];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
        || SENSITIVE_SUBSTRINGS.iter().any(|sub| lower.contains(sub))
}

/// Copy of `settings` with non-empty secret values masked.
pub fn redact_settings(settings: &Settings) -> Settings {
    settings
        .iter()
        .map(|(key, value)| {
            let masked = match value {
                SettingValue::Null => false,
                SettingValue::Text(s) => !s.is_empty() && is_sensitive_key(key),
                _ => is_sensitive_key(key),
            };
            let value = if masked {
                SettingValue::from(REDACTED)
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

pub fn redact_config(config: &ConnectionConfig) -> ConnectionConfig {
    let mut redacted = config.clone();
    redacted.connection_settings = redact_settings(&config.connection_settings);
    redacted.session_settings = redact_settings(&config.session_settings);
    redacted.pool_settings.extra = redact_settings(&config.pool_settings.extra);
    redacted.async_pool_settings.extra = redact_settings(&config.async_pool_settings.extra);
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("SSLKEY"));
        assert!(is_sensitive_key("api_token"));
        assert!(is_sensitive_key("client_secret_id"));
        assert!(!is_sensitive_key("host"));
        assert!(!is_sensitive_key("sslmode"));
    }

    #[test]
    fn test_redact_config() {
        let config = ConnectionConfig::default()
            .with_setting("user", "app")
            .with_setting("password", "hunter2")
            .with_setting("sslkey", "/etc/ssl/client.key")
            .with_setting("sslcert", "");

        let redacted = redact_config(&config);
        let s = &redacted.connection_settings;

        assert_eq!(s.get("user"), Some(&SettingValue::from("app")));
        assert_eq!(s.get("password"), Some(&SettingValue::from(REDACTED)));
        assert_eq!(s.get("sslkey"), Some(&SettingValue::from(REDACTED)));
        // nothing to leak
        assert_eq!(s.get("sslcert"), Some(&SettingValue::from("")));
        // original untouched
        assert_eq!(
            config.connection_settings.get("password"),
            Some(&SettingValue::from("hunter2"))
        );
    }
}

//! Configuration fingerprints used as cache keys

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{ConnectionConfig, ConnectionType};

/// Identity of a cached handle: SHA-256 of the canonical configuration plus
/// the resolved connection type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    digest: String,
    connection_type: ConnectionType,
}

impl Fingerprint {
    /// Fingerprint a typed configuration.
    #[must_use]
    pub fn of(config: &ConnectionConfig, connection_type: ConnectionType) -> Self {
        // A config of strings, numbers and maps always converts.
        let value = serde_json::to_value(config).unwrap_or(Value::Null);
        Self::of_value(&value, connection_type)
    }

    /// Fingerprint an arbitrary JSON document. Object key order is irrelevant.
    #[must_use]
    pub fn of_value(value: &Value, connection_type: ConnectionType) -> Self {
        let mut canonical = Vec::with_capacity(256);
        write_canonical(value, &mut canonical);

        let digest = Sha256::digest(&canonical);
        Self {
            digest: format!("{digest:x}"),
            connection_type,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub const fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        format!("{}:{}", &self.digest[..12], self.connection_type)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.digest, self.connection_type)
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(val, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Writing into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut *out, value);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn base() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_setting("host", "h")
            .with_setting("user", "u")
            .with_setting("port", 5432_i64)
    }

    #[test]
    fn test_deterministic() {
        let a = Fingerprint::of(&base(), ConnectionType::Pool);
        let b = Fingerprint::of(&base(), ConnectionType::Pool);
        assert_eq!(a, b);
        assert_eq!(a.digest().len(), 64);
        assert!(a.to_string().ends_with(":pool"));
    }

    #[test]
    fn test_key_order_irrelevant() {
        let a: ConnectionConfig = serde_json::from_str(
            r#"{"connection_settings": {"host": "h", "user": "u", "port": 5432},
                "pool_settings": {"max_size": 4, "min_size": 1}}"#,
        )
        .unwrap();
        let b: ConnectionConfig = serde_json::from_str(
            r#"{"pool_settings": {"min_size": 1, "max_size": 4},
                "connection_settings": {"port": 5432, "user": "u", "host": "h"}}"#,
        )
        .unwrap();

        assert_eq!(
            Fingerprint::of(&a, ConnectionType::Pool),
            Fingerprint::of(&b, ConnectionType::Pool)
        );
    }

    #[test]
    fn test_raw_value_key_order_irrelevant() {
        let a = json!({"a": 1, "b": {"x": true, "y": [1, 2]}});
        let b = json!({"b": {"y": [1, 2], "x": true}, "a": 1});
        assert_eq!(
            Fingerprint::of_value(&a, ConnectionType::Normal),
            Fingerprint::of_value(&b, ConnectionType::Normal)
        );

        // array order is content
        let c = json!({"b": {"y": [2, 1], "x": true}, "a": 1});
        assert_ne!(
            Fingerprint::of_value(&a, ConnectionType::Normal),
            Fingerprint::of_value(&c, ConnectionType::Normal)
        );
    }

    #[test]
    fn test_type_discriminates() {
        let config = base();
        let fps: Vec<_> = ConnectionType::ALL
            .iter()
            .map(|ty| Fingerprint::of(&config, *ty))
            .collect();

        for (i, a) in fps.iter().enumerate() {
            for b in &fps[i + 1..] {
                assert_ne!(a, b);
                assert_eq!(a.digest(), b.digest());
            }
        }
    }

    #[test]
    fn test_content_changes_digest() {
        let a = Fingerprint::of(&base(), ConnectionType::Normal);
        let b = Fingerprint::of(&base().with_setting("host", "other"), ConnectionType::Normal);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_short_form() {
        let fp = Fingerprint::of(&base(), ConnectionType::AsyncPool);
        let short = fp.short();
        assert!(short.ends_with(":async_pool"));
        assert_eq!(short.len(), 12 + ":async_pool".len());
    }
}

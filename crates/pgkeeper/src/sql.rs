//! Safe composition of the few statements this crate issues itself

use postgres_protocol::escape::{escape_identifier, escape_literal};

use crate::config::{SettingValue, Settings};
use crate::{Error, Result};

pub const BEGIN: &str = "BEGIN";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

/// Quote an identifier with the protocol's escaping rules.
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::config(format!("Invalid identifier: {name:?}")));
    }
    Ok(escape_identifier(name))
}

/// Quote a string literal. Backslashes switch to the ` E''` form.
pub fn quote_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(Error::config("String literal contains a NUL byte"));
    }
    Ok(escape_literal(value))
}

/// `SET "name" = 'value'`
pub fn set_statement(name: &str, value: &SettingValue) -> Result<String> {
    let text = value
        .to_text()
        .ok_or_else(|| Error::config(format!("Session setting '{name}' has no value")))?;
    Ok(format!(
        "SET {} = {}",
        quote_identifier(name)?,
        quote_literal(&text)?
    ))
}

/// One `SET` per non-null session setting, in key order.
pub fn set_statements(settings: &Settings) -> Vec<(String, Result<String>)> {
    settings
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.clone(), set_statement(name, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("work_mem").unwrap(), "\"work_mem\"");
        assert_eq!(
            quote_identifier("bad\"; DROP TABLE x; --").unwrap(),
            "\"bad\"\"; DROP TABLE x; --\""
        );
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("a\0b").is_err());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("30s").unwrap(), "'30s'");
        assert_eq!(quote_literal("it's").unwrap(), "'it''s'");
        assert_eq!(quote_literal(r"C:\tmp").unwrap(), r" E'C:\\tmp'");
        assert!(quote_literal("a\0b").is_err());
    }

    #[test]
    fn test_set_statement() {
        assert_eq!(
            set_statement("statement_timeout", &"30s".into()).unwrap(),
            "SET \"statement_timeout\" = '30s'"
        );
        assert_eq!(
            set_statement("jit", &SettingValue::Bool(false)).unwrap(),
            "SET \"jit\" = 'false'"
        );
        assert!(set_statement("x", &SettingValue::Null).is_err());
    }

    #[test]
    fn test_set_statements_skip_null() {
        let mut settings = Settings::new();
        settings.insert("work_mem".into(), "64MB".into());
        settings.insert("search_path".into(), SettingValue::Null);

        let stmts = set_statements(&settings);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].0, "work_mem");
    }
}

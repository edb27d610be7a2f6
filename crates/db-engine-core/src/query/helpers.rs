//! Identifier validation and other dialect-invariant builder helpers.
//!
//! Grounded in `ouroboros-postgres::query::helpers::validate_identifier`;
//! the validation rules (NFKC normalisation, length cap, charset, reserved
//! words, system-schema rejection) are backend-invariant, so unlike quoting
//! (which lives on `Dialect`) this stays a single shared routine.

use unicode_normalization::UnicodeNormalization;

use crate::error::{DbError, Result};

const SQL_KEYWORDS: &[&str] = &[
    "select", "insert", "update", "delete", "drop", "create", "alter",
    "truncate", "grant", "revoke", "exec", "execute", "union", "declare",
    "table", "index", "view", "schema", "database", "user", "role",
    "from", "where", "join", "inner", "outer", "left", "right",
    "on", "using", "and", "or", "not", "in", "exists", "between",
    "like", "ilike", "is", "null", "true", "false", "case", "when",
    "then", "else", "end", "as", "order", "by", "group", "having",
    "limit", "offset", "distinct", "all", "any", "some",
];

/// Validates a table/column identifier, allowing one level of
/// schema-qualification (`schema.table`).
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::usage("identifier cannot be empty"));
    }

    if name.contains('.') {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() != 2 {
            return Err(DbError::usage(format!(
                "invalid schema-qualified identifier '{name}': expected 'schema.table'"
            )));
        }
        for part in parts {
            validate_identifier_part(part)?;
        }
        return Ok(());
    }

    validate_identifier_part(name)
}

fn validate_identifier_part(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::usage("identifier part cannot be empty"));
    }

    let normalized = name.nfkc().collect::<String>();

    if normalized.len() > 63 {
        return Err(DbError::usage(format!(
            "identifier '{normalized}' exceeds maximum length of 63"
        )));
    }

    let first_char = normalized.chars().next().expect("checked non-empty above");
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(DbError::usage(format!(
            "identifier '{normalized}' must start with a letter or underscore"
        )));
    }

    for ch in normalized.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return Err(DbError::usage(format!(
                "identifier '{normalized}' contains invalid character '{ch}'"
            )));
        }
    }

    let lower = normalized.to_lowercase();
    if lower.starts_with("pg_") {
        return Err(DbError::usage(format!(
            "access to system catalog '{normalized}' is not allowed"
        )));
    }
    if lower == "information_schema" {
        return Err(DbError::usage("access to information_schema is not allowed"));
    }
    if SQL_KEYWORDS.contains(&lower.as_str()) {
        return Err(DbError::usage(format!(
            "identifier '{normalized}' is a reserved SQL keyword"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("public.users").is_ok());
    }

    #[test]
    fn rejects_reserved_keyword() {
        assert!(validate_identifier("select").is_err());
    }

    #[test]
    fn rejects_system_catalog_prefix() {
        assert!(validate_identifier("pg_stat_activity").is_err());
    }

    #[test]
    fn rejects_too_many_schema_parts() {
        assert!(validate_identifier("a.b.c").is_err());
    }

    #[test]
    fn rejects_oversize_identifier() {
        let long_name = "a".repeat(64);
        assert!(validate_identifier(&long_name).is_err());
    }
}

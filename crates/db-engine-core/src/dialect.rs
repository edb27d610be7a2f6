//! Backend dialect selection and dialect-dependent SQL text rules.

use crate::error::{DbError, Result};

/// The target backend's SQL variant. Determines placeholder syntax,
/// identifier quoting, and feature availability (RETURNING, locking, upsert).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Sqlite,
    MySql,
}

impl Dialect {
    /// Resolves the dialect from a connection URL scheme. Unknown schemes
    /// are a `CONFIG` error per the external interfaces section.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| DbError::config(format!("malformed connection URL: {url}")))?;

        match scheme {
            "postgresql" | "postgres" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(DbError::config(format!("unrecognised connection scheme '{other}'"))),
        }
    }

    /// Whether this dialect supports `RETURNING` on INSERT/UPDATE/DELETE.
    /// SQLite only supports it from 3.35 onward; we assume a recent SQLite
    /// since the engine targets current `sqlx` builds.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    pub fn supports_row_locking(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::MySql)
    }

    /// Quotes an identifier per the dialect's quoting rule. Schema-qualified
    /// names (`schema.table`) are quoted part-by-part.
    pub fn quote_identifier(&self, name: &str) -> String {
        let (open, close) = match self {
            Dialect::Postgres | Dialect::Sqlite => ('"', '"'),
            Dialect::MySql => ('`', '`'),
        };

        if name.contains('.') {
            name.split('.')
                .map(|part| format!("{open}{part}{close}"))
                .collect::<Vec<_>>()
                .join(".")
        } else {
            format!("{open}{name}{close}")
        }
    }

    /// Writes the Nth (1-based) placeholder for this dialect into `out`.
    pub fn write_placeholder(&self, out: &mut String, position: usize) {
        match self {
            Dialect::Postgres => {
                out.push('$');
                out.push_str(&position.to_string());
            }
            Dialect::Sqlite | Dialect::MySql => out.push('?'),
        }
    }

    pub fn explain_prefix(&self, analyze: bool) -> &'static str {
        match (self, analyze) {
            (Dialect::Postgres, true) => "EXPLAIN (ANALYZE) ",
            (Dialect::Postgres, false) => "EXPLAIN ",
            (Dialect::Sqlite, _) => "EXPLAIN QUERY PLAN ",
            (Dialect::MySql, _) => "EXPLAIN ",
        }
    }

    pub fn concat_sql(&self, args: &[String]) -> String {
        match self {
            Dialect::Sqlite => args.join(" || "),
            Dialect::Postgres | Dialect::MySql => format!("CONCAT({})", args.join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_schemes() {
        assert_eq!(Dialect::from_url("postgresql://localhost/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgres://localhost/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://localhost/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_url("sqlite:///:memory:").unwrap(), Dialect::Sqlite);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = Dialect::from_url("oracle://localhost/db").unwrap_err();
        assert_eq!(err.kind(), "CONFIG");
    }

    #[test]
    fn rejects_malformed_url() {
        let err = Dialect::from_url("not-a-url").unwrap_err();
        assert_eq!(err.kind(), "CONFIG");
    }

    #[test]
    fn quoting_differs_by_dialect() {
        assert_eq!(Dialect::Postgres.quote_identifier("users"), "\"users\"");
        assert_eq!(Dialect::MySql.quote_identifier("users"), "`users`");
        assert_eq!(Dialect::Postgres.quote_identifier("public.users"), "\"public\".\"users\"");
    }

    #[test]
    fn placeholders_differ_by_dialect() {
        let mut s = String::new();
        Dialect::Postgres.write_placeholder(&mut s, 3);
        assert_eq!(s, "$3");

        let mut s = String::new();
        Dialect::Sqlite.write_placeholder(&mut s, 3);
        assert_eq!(s, "?");
    }
}

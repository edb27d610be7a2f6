//! Error taxonomy for the engine core.
//!
//! One variant per failure kind surfaced to the embedder (see the error
//! envelope in the external interfaces). `sqlx::Error` is classified into
//! these kinds by inspecting the backend's native error code, so a single
//! `From<sqlx::Error>` impl covers all three dialects.

use std::fmt;

use crate::dialect::Dialect;

pub type Result<T> = std::result::Result<T, DbError>;

/// A single error kind, carrying just enough context to build the error
/// envelope `{kind, message, backend_code?, constraint?, column?}`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("query build error: {0}")]
    Build(String),

    #[error("timed out acquiring a pool connection after {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("integrity violation{}{}: {message}",
        constraint.as_ref().map(|c| format!(" (constraint {c})")).unwrap_or_default(),
        column.as_ref().map(|c| format!(" on column {c}")).unwrap_or_default())]
    Integrity {
        message: String,
        constraint: Option<String>,
        column: Option<String>,
    },

    #[error("no row matched a query that expected exactly one")]
    NotFound,

    #[error("{0} rows matched a query that expected exactly one")]
    MultipleFound(u64),

    #[error("transaction {0} timed out and was rolled back by the reaper")]
    TransactionTimeout(String),

    #[error("transaction {0} is poisoned")]
    TransactionPoisoned(String),

    #[error("failed to hydrate column '{column}' in row {row_index}: {message}")]
    Hydration {
        column: String,
        row_index: usize,
        message: String,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl DbError {
    /// Machine-readable kind tag, matching the error envelope's `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Config(_) => "CONFIG",
            DbError::Usage(_) => "USAGE",
            DbError::Protocol(_) => "PROTOCOL",
            DbError::Build(_) => "BUILD",
            DbError::PoolTimeout(_) => "POOL_TIMEOUT",
            DbError::Connection(_) => "CONNECTION",
            DbError::Integrity { .. } => "INTEGRITY",
            DbError::NotFound => "NOT_FOUND",
            DbError::MultipleFound(_) => "MULTIPLE_FOUND",
            DbError::TransactionTimeout(_) => "TRANSACTION_TIMEOUT",
            DbError::TransactionPoisoned(_) => "TRANSACTION_POISONED",
            DbError::Hydration { .. } => "HYDRATION",
            DbError::Backend(_) => "BACKEND",
        }
    }

    /// Whether a caller-driven retry of the same operation could plausibly
    /// succeed. The Driver itself never retries (see component design);
    /// this is exposed purely as a predicate for callers that want to.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Connection(_) | DbError::PoolTimeout(_) | DbError::Backend(_)
        ) || matches!(self, DbError::Integrity { .. } if self.is_serialization_failure())
    }

    fn is_serialization_failure(&self) -> bool {
        false
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DbError::Integrity { .. })
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DbError::Config(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        DbError::Usage(msg.into())
    }

    pub fn build(msg: impl Into<String>) -> Self {
        DbError::Build(msg.into())
    }

    pub fn hydration(column: impl Into<String>, row_index: usize, msg: impl Into<String>) -> Self {
        DbError::Hydration {
            column: column.into(),
            row_index,
            message: msg.into(),
        }
    }
}

/// Classifies a raw `sqlx::Error` into a `DbError`, dispatching on the
/// dialect so each backend's native SQLSTATE/errno/result-code space is
/// consulted correctly. Grounded in `ouroboros-common::error::DataBridgeError`'s
/// `From<sqlx::Error>` impl, generalised across dialects and remapped onto
/// this crate's kind list.
pub fn classify_sqlx_error(err: sqlx::Error, dialect: Dialect) -> DbError {
    match &err {
        sqlx::Error::RowNotFound => return DbError::NotFound,
        sqlx::Error::PoolTimedOut => {
            return DbError::PoolTimeout(std::time::Duration::from_secs(0))
        }
        sqlx::Error::PoolClosed => return DbError::Connection("pool closed".to_string()),
        sqlx::Error::Io(e) => return DbError::Connection(e.to_string()),
        sqlx::Error::ColumnNotFound(c) => {
            return DbError::Hydration {
                column: c.clone(),
                row_index: 0,
                message: "column not found".to_string(),
            }
        }
        sqlx::Error::ColumnDecode { index, source } => {
            return DbError::Hydration {
                column: index.clone(),
                row_index: 0,
                message: source.to_string(),
            }
        }
        _ => {}
    }

    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message().to_string();
        let constraint = db_err.constraint().map(|s| s.to_string());
        let column = None;

        return match dialect {
            Dialect::Postgres => classify_postgres_code(db_err.code().as_deref(), message, constraint, column),
            Dialect::Sqlite => classify_sqlite_code(db_err.code().as_deref(), message, constraint, column),
            Dialect::MySql => classify_mysql_code(db_err.code().as_deref(), message, constraint, column),
        };
    }

    DbError::Backend(err.to_string())
}

fn classify_postgres_code(
    code: Option<&str>,
    message: String,
    constraint: Option<String>,
    column: Option<String>,
) -> DbError {
    match code {
        Some("23505") | Some("23503") | Some("23514") | Some("23502") | Some("23P01") => {
            DbError::Integrity { message, constraint, column }
        }
        Some("40P01") | Some("40001") | Some("40000") | Some("40002") | Some("40003") => {
            DbError::Backend(format!("serialization failure: {message}"))
        }
        Some(c) if c.starts_with("08") => DbError::Connection(message),
        Some("57P01") | Some("57P02") | Some("57P03") => DbError::Connection(message),
        _ => DbError::Backend(message),
    }
}

fn classify_sqlite_code(
    code: Option<&str>,
    message: String,
    constraint: Option<String>,
    column: Option<String>,
) -> DbError {
    // SQLite primary result codes: 19 = SQLITE_CONSTRAINT, 5 = SQLITE_BUSY,
    // 6 = SQLITE_LOCKED, 10 = SQLITE_IOERR.
    match code {
        Some(c) if c.starts_with("19") => DbError::Integrity { message, constraint, column },
        Some("5") | Some("6") => DbError::Backend(format!("database busy/locked: {message}")),
        Some(c) if c.starts_with("10") => DbError::Connection(message),
        _ => DbError::Backend(message),
    }
}

fn classify_mysql_code(
    code: Option<&str>,
    message: String,
    constraint: Option<String>,
    column: Option<String>,
) -> DbError {
    // MySQL errno as string: 1062 = duplicate key, 1451/1452 = FK violation,
    // 1048 = column cannot be null, 1213 = deadlock, 1205 = lock wait timeout,
    // 2002/2003/2006/2013 = connection-level.
    match code {
        Some("1062") | Some("1451") | Some("1452") | Some("1048") | Some("3819") => {
            DbError::Integrity { message, constraint, column }
        }
        Some("1213") => DbError::Backend(format!("deadlock: {message}")),
        Some("1205") => DbError::Backend(format!("lock wait timeout: {message}")),
        Some("2002") | Some("2003") | Some("2006") | Some("2013") => DbError::Connection(message),
        _ => DbError::Backend(message),
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_spec_list() {
        assert_eq!(DbError::Config("x".into()).kind(), "CONFIG");
        assert_eq!(DbError::Usage("x".into()).kind(), "USAGE");
        assert_eq!(DbError::Protocol("x".into()).kind(), "PROTOCOL");
        assert_eq!(DbError::Build("x".into()).kind(), "BUILD");
        assert_eq!(
            DbError::PoolTimeout(std::time::Duration::from_secs(1)).kind(),
            "POOL_TIMEOUT"
        );
        assert_eq!(DbError::Connection("x".into()).kind(), "CONNECTION");
        assert_eq!(
            DbError::Integrity { message: "x".into(), constraint: None, column: None }.kind(),
            "INTEGRITY"
        );
        assert_eq!(DbError::NotFound.kind(), "NOT_FOUND");
        assert_eq!(DbError::MultipleFound(2).kind(), "MULTIPLE_FOUND");
        assert_eq!(DbError::TransactionTimeout("t1".into()).kind(), "TRANSACTION_TIMEOUT");
        assert_eq!(DbError::TransactionPoisoned("t1".into()).kind(), "TRANSACTION_POISONED");
        assert_eq!(
            DbError::hydration("age", 3, "bad int").kind(),
            "HYDRATION"
        );
        assert_eq!(DbError::Backend("x".into()).kind(), "BACKEND");
    }

    #[test]
    fn postgres_unique_violation_is_integrity() {
        let err = classify_postgres_code(Some("23505"), "dup".into(), Some("users_email_key".into()), None);
        assert!(matches!(err, DbError::Integrity { .. }));
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn mysql_duplicate_key_is_integrity() {
        let err = classify_mysql_code(Some("1062"), "dup".into(), None, None);
        assert!(matches!(err, DbError::Integrity { .. }));
    }

    #[test]
    fn sqlite_constraint_is_integrity() {
        let err = classify_sqlite_code(Some("19"), "UNIQUE constraint failed".into(), None, None);
        assert!(matches!(err, DbError::Integrity { .. }));
    }

    #[test]
    fn connection_errors_are_retryable() {
        assert!(DbError::Connection("reset".into()).is_retryable());
        assert!(DbError::PoolTimeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!DbError::NotFound.is_retryable());
    }
}

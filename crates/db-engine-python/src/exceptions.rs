//! Python exception hierarchy and the `DbError` → `PyErr` conversion.
//!
//! Grounded in `data-bridge/src/postgres.rs`'s `map_err(|e| PyRuntimeError::new_err(...))`
//! pattern, but widened since the error envelope (`{kind, message,
//! backend_code?, constraint?, column?}`) is richer than a bare runtime-error
//! string, so each `DbError` kind gets its own Python exception subclass
//! instead of collapsing into one generic `PyRuntimeError`.

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;

use db_engine_core::DbError;

create_exception!(db_engine, DbEngineError, PyException);
create_exception!(db_engine, ConfigError, DbEngineError);
create_exception!(db_engine, UsageError, DbEngineError);
create_exception!(db_engine, ProtocolError, DbEngineError);
create_exception!(db_engine, BuildError, DbEngineError);
create_exception!(db_engine, PoolTimeoutError, DbEngineError);
create_exception!(db_engine, ConnectionError, DbEngineError);
create_exception!(db_engine, IntegrityError, DbEngineError);
create_exception!(db_engine, NotFoundError, DbEngineError);
create_exception!(db_engine, MultipleFoundError, DbEngineError);
create_exception!(db_engine, TransactionTimeoutError, DbEngineError);
create_exception!(db_engine, TransactionPoisonedError, DbEngineError);
create_exception!(db_engine, HydrationError, DbEngineError);
create_exception!(db_engine, BackendError, DbEngineError);

/// Wraps a `DbError` so `From<DbWrapped> for PyErr` can pattern-match on
/// the kind without fighting the orphan rule on `DbError` itself.
pub struct DbWrapped(pub DbError);

impl From<DbError> for DbWrapped {
    fn from(e: DbError) -> Self {
        DbWrapped(e)
    }
}

impl From<DbWrapped> for PyErr {
    fn from(wrapped: DbWrapped) -> Self {
        let err = wrapped.0;
        let message = err.to_string();
        match &err {
            DbError::Config(_) => ConfigError::new_err(message),
            DbError::Usage(_) => UsageError::new_err(message),
            DbError::Protocol(_) => ProtocolError::new_err(message),
            DbError::Build(_) => BuildError::new_err(message),
            DbError::PoolTimeout(_) => PoolTimeoutError::new_err(message),
            DbError::Connection(_) => ConnectionError::new_err(message),
            DbError::Integrity { constraint, column, .. } => {
                Python::with_gil(|py| {
                    let exc = IntegrityError::new_err(message);
                    let value = exc.value(py);
                    if let Some(c) = constraint {
                        let _ = value.setattr("constraint", c.clone());
                    }
                    if let Some(c) = column {
                        let _ = value.setattr("column", c.clone());
                    }
                    exc
                })
            }
            DbError::NotFound => NotFoundError::new_err(message),
            DbError::MultipleFound(_) => MultipleFoundError::new_err(message),
            DbError::TransactionTimeout(_) => TransactionTimeoutError::new_err(message),
            DbError::TransactionPoisoned(_) => TransactionPoisonedError::new_err(message),
            DbError::Hydration { .. } => HydrationError::new_err(message),
            DbError::Backend(_) => BackendError::new_err(message),
        }
    }
}

/// Registers the exception hierarchy on the extension module so
/// `db_engine.IntegrityError` etc. are importable from Python.
pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("DbEngineError", m.py().get_type::<DbEngineError>())?;
    m.add("ConfigError", m.py().get_type::<ConfigError>())?;
    m.add("UsageError", m.py().get_type::<UsageError>())?;
    m.add("ProtocolError", m.py().get_type::<ProtocolError>())?;
    m.add("BuildError", m.py().get_type::<BuildError>())?;
    m.add("PoolTimeoutError", m.py().get_type::<PoolTimeoutError>())?;
    m.add("ConnectionError", m.py().get_type::<ConnectionError>())?;
    m.add("IntegrityError", m.py().get_type::<IntegrityError>())?;
    m.add("NotFoundError", m.py().get_type::<NotFoundError>())?;
    m.add("MultipleFoundError", m.py().get_type::<MultipleFoundError>())?;
    m.add("TransactionTimeoutError", m.py().get_type::<TransactionTimeoutError>())?;
    m.add("TransactionPoisonedError", m.py().get_type::<TransactionPoisonedError>())?;
    m.add("HydrationError", m.py().get_type::<HydrationError>())?;
    m.add("BackendError", m.py().get_type::<BackendError>())?;
    Ok(())
}

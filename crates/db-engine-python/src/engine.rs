//! The Bridge entry points: `init_pool`, `close_pool`, `close_all`,
//! `begin_transaction`, `commit_transaction`, `rollback_transaction`,
//! `execute`, `explain`, `raw_execute`.
//!
//! Every entry point follows `data-bridge/src/postgres.rs`'s three-phase
//! pattern: extract Python values while holding the GIL, run the awaited
//! I/O inside `future_into_py` (GIL released), and convert the result back
//! to Python only once the future resumes. Python byte buffers handed in
//! (`ir_bytes`) are copied to an owned `Vec<u8>` during the extract phase
//! so nothing borrowed from the GIL crosses the await point.

use std::time::Duration;

use pyo3::prelude::*;
use pyo3::types::PyBytes;
use pyo3_async_runtimes::tokio::future_into_py;

use db_engine_core::codec;
use db_engine_core::driver;
use db_engine_core::ir::Ir;
use db_engine_core::pool::{self, PoolConfig};
use db_engine_core::transaction::{self, IsolationLevel};

use crate::exceptions::DbWrapped;

fn duration_secs_f64(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

/// Builds a `PoolConfig` from the recognised pool setting keyword
/// arguments. `sqlite_journal_mode`/`sqlite_synchronous`/
/// `sqlite_cache_size`/`sqlite_busy_timeout` fold into `sqlite_pragmas`,
/// overriding the matching entries in `PoolConfig::default()`.
#[allow(clippy::too_many_arguments)]
fn build_pool_config(
    min_connections: u32,
    max_connections: u32,
    acquire_timeout: f64,
    idle_timeout: Option<f64>,
    max_lifetime: Option<f64>,
    test_before_acquire: bool,
    transaction_timeout: f64,
    transaction_cleanup_interval: f64,
    sqlite_journal_mode: Option<String>,
    sqlite_synchronous: Option<String>,
    sqlite_cache_size: Option<String>,
    sqlite_busy_timeout: Option<String>,
) -> PoolConfig {
    let mut config = PoolConfig {
        min_connections,
        max_connections,
        acquire_timeout: duration_secs_f64(acquire_timeout),
        idle_timeout: idle_timeout.map(duration_secs_f64),
        max_lifetime: max_lifetime.map(duration_secs_f64),
        test_before_acquire,
        transaction_timeout: duration_secs_f64(transaction_timeout),
        transaction_cleanup_interval: duration_secs_f64(transaction_cleanup_interval),
        ..PoolConfig::default()
    };

    for (pragma, value) in [
        ("journal_mode", sqlite_journal_mode),
        ("synchronous", sqlite_synchronous),
        ("cache_size", sqlite_cache_size),
        ("busy_timeout", sqlite_busy_timeout),
    ] {
        if let Some(value) = value {
            if let Some(entry) = config.sqlite_pragmas.iter_mut().find(|(p, _)| p == pragma) {
                entry.1 = value;
            } else {
                config.sqlite_pragmas.push((pragma.to_string(), value));
            }
        }
    }

    config
}

/// Opens a pool against `url` and registers it under `name`. The pool
/// settings default to `PoolConfig::default()`'s values so a caller that
/// only cares about the URL can omit every keyword.
#[pyfunction]
#[pyo3(signature = (
    name, url, *,
    min_connections=1, max_connections=10, acquire_timeout=30.0,
    idle_timeout=600.0, max_lifetime=1800.0, test_before_acquire=true,
    transaction_timeout=60.0, transaction_cleanup_interval=30.0,
    sqlite_journal_mode=None, sqlite_synchronous=None,
    sqlite_cache_size=None, sqlite_busy_timeout=None,
))]
#[allow(clippy::too_many_arguments)]
pub fn init_pool<'py>(
    py: Python<'py>,
    name: String,
    url: String,
    min_connections: u32,
    max_connections: u32,
    acquire_timeout: f64,
    idle_timeout: Option<f64>,
    max_lifetime: Option<f64>,
    test_before_acquire: bool,
    transaction_timeout: f64,
    transaction_cleanup_interval: f64,
    sqlite_journal_mode: Option<String>,
    sqlite_synchronous: Option<String>,
    sqlite_cache_size: Option<String>,
    sqlite_busy_timeout: Option<String>,
) -> PyResult<Bound<'py, PyAny>> {
    let config = build_pool_config(
        min_connections,
        max_connections,
        acquire_timeout,
        idle_timeout,
        max_lifetime,
        test_before_acquire,
        transaction_timeout,
        transaction_cleanup_interval,
        sqlite_journal_mode,
        sqlite_synchronous,
        sqlite_cache_size,
        sqlite_busy_timeout,
    );

    future_into_py(py, async move {
        pool::register(&name, &url, config).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

/// Closes and deregisters a single pool. Idempotent: closing an unknown or
/// already-closed name is a no-op, per `pool::close`'s documented contract.
#[pyfunction]
pub fn close_pool(py: Python<'_>, name: String) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        pool::close(&name).await;
        Ok(())
    })
}

/// Closes every registered pool, for process shutdown.
#[pyfunction]
pub fn close_all(py: Python<'_>) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        pool::close_all().await;
        Ok(())
    })
}

fn isolation_level_from_str(level: Option<&str>) -> PyResult<IsolationLevel> {
    match level {
        None | Some("read_committed") => Ok(IsolationLevel::ReadCommitted),
        Some("read_uncommitted") => Ok(IsolationLevel::ReadUncommitted),
        Some("repeatable_read") => Ok(IsolationLevel::RepeatableRead),
        Some("serializable") => Ok(IsolationLevel::Serializable),
        Some(other) => Err(pyo3::exceptions::PyValueError::new_err(format!(
            "invalid isolation level '{other}'"
        ))),
    }
}

/// Begins a transaction against `pool_name`, pinning a connection for its
/// lifetime. Returns the opaque handle id a caller threads through
/// `execute`'s `transaction_id` and into `commit_transaction`/
/// `rollback_transaction`.
#[pyfunction]
#[pyo3(signature = (pool_name, isolation_level=None))]
pub fn begin_transaction<'py>(
    py: Python<'py>,
    pool_name: String,
    isolation_level: Option<&str>,
) -> PyResult<Bound<'py, PyAny>> {
    let level = isolation_level_from_str(isolation_level)?;
    future_into_py(py, async move {
        let id = transaction::begin(&pool_name, level).await.map_err(DbWrapped::from)?;
        Ok(id)
    })
}

/// Commits the innermost open scope of `transaction_id`. Returns `True` if
/// the outermost scope actually issued `COMMIT`, `False` if a prior
/// `mark_rollback_only` forced a `ROLLBACK` instead.
#[pyfunction]
pub fn commit_transaction(py: Python<'_>, transaction_id: String) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        let committed = transaction::commit(&transaction_id).await.map_err(DbWrapped::from)?;
        Ok(committed)
    })
}

/// Rolls back the innermost open scope of `transaction_id`. Heals a
/// poisoned handle, unlike `commit_transaction`.
#[pyfunction]
pub fn rollback_transaction(py: Python<'_>, transaction_id: String) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        transaction::rollback(&transaction_id).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

/// Opens a nested savepoint scope on an already-begun handle (depth += 1).
/// This is how an embedder-side nested `atomic()`/`transaction()` context
/// manager reaches the Transaction Manager's savepoint stack — the handle
/// id stays the same; only its depth changes.
#[pyfunction]
pub fn begin_nested_transaction(py: Python<'_>, transaction_id: String) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        transaction::begin_nested(&transaction_id).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

/// Marks `transaction_id` so its outermost `commit_transaction` call issues
/// `ROLLBACK` instead, irrespective of how the embedder's scope otherwise
/// exits. Nested scopes below the outermost still release their own
/// savepoints normally.
#[pyfunction]
pub fn mark_transaction_rollback_only(py: Python<'_>, transaction_id: String) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        transaction::mark_rollback_only(&transaction_id).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

/// Acquires a Postgres/MySQL advisory lock keyed by `key` on `transaction_id`'s
/// pinned connection, for the embedder's migration runner to serialise
/// schema mutation across processes. A no-op on SQLite (see
/// `transaction::acquire_advisory_lock`).
#[pyfunction]
pub fn acquire_advisory_lock(py: Python<'_>, transaction_id: String, key: i64) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        transaction::acquire_advisory_lock(&transaction_id, key).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

#[pyfunction]
pub fn release_advisory_lock(py: Python<'_>, transaction_id: String, key: i64) -> PyResult<Bound<'_, PyAny>> {
    future_into_py(py, async move {
        transaction::release_advisory_lock(&transaction_id, key).await.map_err(DbWrapped::from)?;
        Ok(())
    })
}

fn decode_ir_owned(ir_bytes: &Bound<'_, PyBytes>) -> PyResult<Ir> {
    let bytes: Vec<u8> = ir_bytes.as_bytes().to_vec();
    codec::decode_ir(&bytes, codec::DEFAULT_MAX_PAYLOAD_BYTES).map_err(|e| DbWrapped::from(e).into())
}

fn encode_outcome(outcome: &driver::ExecOutcome) -> PyResult<Vec<u8>> {
    let envelope = codec::ResultEnvelope {
        columns: outcome.columns.clone(),
        rows: outcome.rows.clone(),
        rows_affected: outcome.rows_affected,
        last_insert_id: outcome.last_insert_id.clone(),
    };
    codec::encode_result(&envelope).map_err(|e| DbWrapped::from(e).into())
}

/// Runs `ir_bytes` (a Codec-encoded `Ir`) against `pool_name`, or against
/// `transaction_id`'s pinned connection when given. Returns a Codec-encoded
/// `ResultEnvelope`. Reverse-relation prefetches named in the `Ir` run as
/// additional `IN`-list queries on the same connection, in order, after the
/// primary statement.
#[pyfunction]
#[pyo3(signature = (pool_name, ir_bytes, transaction_id=None))]
pub fn execute<'py>(
    py: Python<'py>,
    pool_name: String,
    ir_bytes: &Bound<'py, PyBytes>,
    transaction_id: Option<String>,
) -> PyResult<Bound<'py, PyAny>> {
    let ir = decode_ir_owned(ir_bytes)?;

    future_into_py(py, async move {
        let (primary, prefetched) = if let Some(id) = transaction_id {
            transaction::execute_with_prefetch(&id, &ir).await.map_err(DbWrapped::from)?
        } else {
            driver::execute_with_prefetch(&pool_name, &ir).await.map_err(DbWrapped::from)?
        };

        let primary_bytes = Python::with_gil(|py| -> PyResult<Py<PyBytes>> {
            let bytes = encode_outcome(&primary)?;
            Ok(PyBytes::new(py, &bytes).into())
        })?;

        Python::with_gil(|py| -> PyResult<PyObject> {
            let primary_obj = primary_bytes.into_bound(py);
            if prefetched.is_empty() {
                return Ok(primary_obj.into_any().unbind());
            }

            let dict = pyo3::types::PyDict::new(py);
            dict.set_item("primary", primary_obj)?;
            let prefetch_dict = pyo3::types::PyDict::new(py);
            for item in &prefetched {
                let bytes = encode_outcome(&item.outcome)?;
                prefetch_dict.set_item(&item.name, PyBytes::new(py, &bytes))?;
            }
            dict.set_item("prefetched", prefetch_dict)?;
            Ok(dict.into_any().unbind())
        })
    })
}

/// Runs `ir_bytes` with its operation forced to `EXPLAIN`, returning the
/// backend's plan encoded the same way as a `SELECT` result (one column per
/// plan field, one row per plan line) since neither dialect returns a
/// structured plan tree through `sqlx`. `analyze=True` requests
/// `EXPLAIN (ANALYZE)` on Postgres (the statement actually runs); ignored on
/// SQLite/MySQL, which have no analyze-mode distinct from their plan-only
/// form.
#[pyfunction]
#[pyo3(signature = (pool_name, ir_bytes, transaction_id=None, analyze=false))]
pub fn explain<'py>(
    py: Python<'py>,
    pool_name: String,
    ir_bytes: &Bound<'py, PyBytes>,
    transaction_id: Option<String>,
    analyze: bool,
) -> PyResult<Bound<'py, PyAny>> {
    let mut ir = decode_ir_owned(ir_bytes)?;
    ir.operation = db_engine_core::ir::Operation::Explain;
    ir.explain_analyze = analyze;

    future_into_py(py, async move {
        let outcome = if let Some(id) = transaction_id {
            transaction::execute(&id, &ir).await.map_err(DbWrapped::from)?
        } else {
            driver::execute(&pool_name, &ir).await.map_err(DbWrapped::from)?
        };

        let bytes = encode_outcome(&outcome)?;
        Python::with_gil(|py| Ok(PyBytes::new(py, &bytes).unbind()))
    })
}

/// Runs a trusted, pre-built SQL string with positional parameters, for the
/// embedder's own migrations/DDL that the IR has no vocabulary for. `sql`
/// MUST NOT be built by concatenating caller input; parameters carry the
/// only untrusted data, bound the same way a compiled `Ir` would be.
#[pyfunction]
#[pyo3(signature = (pool_name, sql, params, transaction_id=None))]
pub fn raw_execute<'py>(
    py: Python<'py>,
    pool_name: String,
    sql: String,
    params: &Bound<'py, PyBytes>,
    transaction_id: Option<String>,
) -> PyResult<Bound<'py, PyAny>> {
    let params: Vec<db_engine_core::Value> =
        serde_json::from_slice(params.as_bytes()).map_err(|e| {
            pyo3::exceptions::PyValueError::new_err(format!("malformed params payload: {e}"))
        })?;
    let ir = Ir::raw(sql, params);

    future_into_py(py, async move {
        let outcome = if let Some(id) = transaction_id {
            transaction::execute(&id, &ir).await.map_err(DbWrapped::from)?
        } else {
            driver::execute(&pool_name, &ir).await.map_err(DbWrapped::from)?
        };

        let bytes = encode_outcome(&outcome)?;
        Python::with_gil(|py| Ok(PyBytes::new(py, &bytes).unbind()))
    })
}

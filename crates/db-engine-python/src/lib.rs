//! `db_engine`: the Bridge — a `cdylib` PyO3 extension wrapping
//! `db-engine-core` for an async Python embedder.
//!
//! Grounded in `data-bridge/src/postgres.rs` and `data-bridge/src/lib.rs`'s
//! `#[pymodule]` registration shape; generalised from a single always-on
//! Postgres pool to the multi-dialect, multi-pool registry `db-engine-core`
//! already owns.

use pyo3::prelude::*;

mod engine;
mod exceptions;

#[pymodule]
fn db_engine(_py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    exceptions::register(m)?;

    m.add_function(wrap_pyfunction!(engine::init_pool, m)?)?;
    m.add_function(wrap_pyfunction!(engine::close_pool, m)?)?;
    m.add_function(wrap_pyfunction!(engine::close_all, m)?)?;
    m.add_function(wrap_pyfunction!(engine::begin_transaction, m)?)?;
    m.add_function(wrap_pyfunction!(engine::commit_transaction, m)?)?;
    m.add_function(wrap_pyfunction!(engine::rollback_transaction, m)?)?;
    m.add_function(wrap_pyfunction!(engine::begin_nested_transaction, m)?)?;
    m.add_function(wrap_pyfunction!(engine::mark_transaction_rollback_only, m)?)?;
    m.add_function(wrap_pyfunction!(engine::acquire_advisory_lock, m)?)?;
    m.add_function(wrap_pyfunction!(engine::release_advisory_lock, m)?)?;
    m.add_function(wrap_pyfunction!(engine::execute, m)?)?;
    m.add_function(wrap_pyfunction!(engine::explain, m)?)?;
    m.add_function(wrap_pyfunction!(engine::raw_execute, m)?)?;

    Ok(())
}

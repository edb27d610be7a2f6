//! The Transaction Manager: depth-tracked, poisonable transaction handles
//! pinned to a single connection, with a background reaper for expired
//! handles.
//!
//! This layer has no direct counterpart in the grounding repo.
//! `data-bridge-postgres::transaction` supplies only the isolation-level
//! vocabulary (`IsolationLevel::to_sql`) and a `todo!()`-stubbed RAII
//! wrapper with no depth tracking, savepoint naming, handle table, or
//! reaper; those are new here, built in the same idiom: a
//! `tokio::sync::RwLock`-guarded handle table, `#[instrument]`ed
//! operations, and `thiserror` variants per failure mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::dialect::Dialect;
use crate::driver::{self, ExecOutcome};
use crate::error::{DbError, Result};
use crate::ir::Ir;
use crate::pool::{self, Pool};

/// Transaction isolation levels. Grounded in
/// `data-bridge-postgres::transaction::IsolationLevel`; SQLite accepts no
/// isolation level on `BEGIN` and MySQL sets it with a separate statement
/// issued immediately before `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A connection pinned for the lifetime of a transaction handle.
pub(crate) enum PinnedConnection {
    Postgres(sqlx::pool::PoolConnection<sqlx::Postgres>),
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
    MySql(sqlx::pool::PoolConnection<sqlx::MySql>),
}

struct TxState {
    pool_name: String,
    dialect: Dialect,
    depth: u32,
    poisoned: bool,
    /// Set by [`mark_rollback_only`]; forces the outermost `commit()` to
    /// issue `ROLLBACK` instead, irrespective of how the scope otherwise
    /// exits.
    rollback_flag: bool,
    conn: PinnedConnection,
    deadline: Instant,
}

static TABLE: Lazy<RwLock<HashMap<String, Arc<Mutex<TxState>>>>> = Lazy::new(|| RwLock::new(HashMap::new()));
static REAPERS_STARTED: Lazy<std::sync::Mutex<std::collections::HashSet<String>>> =
    Lazy::new(|| std::sync::Mutex::new(std::collections::HashSet::new()));

/// Armed-by-default cancellation-safety guard: poisons the handle on drop
/// unless `disarm()` was called first. Covers both an ordinary statement
/// error (the caller never calls `disarm`) and a cancelled in-flight
/// `execute` (the future is dropped mid-`.await`, so the code that would
/// have called `disarm` never runs either) with a single code path.
struct PoisonGuard<'a> {
    state: &'a mut TxState,
    armed: bool,
}

impl<'a> PoisonGuard<'a> {
    fn new(state: &'a mut TxState) -> Self {
        PoisonGuard { state, armed: true }
    }

    fn conn_mut(&mut self) -> &mut PinnedConnection {
        &mut self.state.conn
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.poisoned = true;
        }
    }
}

async fn run_raw(conn: &mut PinnedConnection, sql: &str) -> Result<()> {
    match conn {
        PinnedConnection::Postgres(c) => driver::run_raw_on_postgres(c, sql).await,
        PinnedConnection::Sqlite(c) => driver::run_raw_on_sqlite(c, sql).await,
        PinnedConnection::MySql(c) => driver::run_raw_on_mysql(c, sql).await,
    }
}

async fn acquire_pinned(pool: &Pool) -> Result<PinnedConnection> {
    match pool {
        Pool::Postgres(p) => {
            let conn = p.acquire().await.map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(PinnedConnection::Postgres(conn))
        }
        Pool::Sqlite(p) => {
            let conn = p.acquire().await.map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(PinnedConnection::Sqlite(conn))
        }
        Pool::MySql(p) => {
            let conn = p.acquire().await.map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(PinnedConnection::MySql(conn))
        }
    }
}

fn begin_sql(dialect: Dialect, isolation: IsolationLevel) -> Vec<String> {
    match dialect {
        Dialect::Postgres => vec![format!("BEGIN ISOLATION LEVEL {}", isolation.to_sql())],
        Dialect::Sqlite => vec!["BEGIN".to_string()],
        Dialect::MySql => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.to_sql()),
            "START TRANSACTION".to_string(),
        ],
    }
}

async fn lookup(id: &str) -> Result<Arc<Mutex<TxState>>> {
    TABLE
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| DbError::usage(format!("no transaction handle '{id}'")))
}

fn ensure_reaper_started(pool_name: &str) {
    let mut started = REAPERS_STARTED.lock().unwrap();
    if started.contains(pool_name) {
        return;
    }
    started.insert(pool_name.to_string());
    let pool_name = pool_name.to_string();
    tokio::spawn(reaper_loop(pool_name));
}

async fn reaper_loop(pool_name: String) {
    loop {
        let interval = match pool::get_config(&pool_name).await {
            Ok(config) => config.transaction_cleanup_interval,
            Err(_) => {
                debug!(pool_name = %pool_name, "reaper stopping, pool no longer registered");
                return;
            }
        };
        tokio::time::sleep(interval).await;
        sweep_expired(&pool_name).await;
    }
}

/// Forcibly finalises every handle belonging to `pool_name` whose deadline
/// has passed. Tolerant of concurrent owner-driven finalisation: a handle
/// already locked by its owner is skipped this sweep and picked up next
/// time, rather than blocked on.
#[instrument]
async fn sweep_expired(pool_name: &str) {
    let candidates: Vec<(String, Arc<Mutex<TxState>>)> = {
        let table = TABLE.read().await;
        table
            .iter()
            .filter(|(_, state)| {
                state
                    .try_lock()
                    .map(|s| s.pool_name == pool_name)
                    .unwrap_or(false)
            })
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    };

    for (id, state) in candidates {
        let mut guard = match state.try_lock() {
            Ok(g) => g,
            Err(_) => continue,
        };
        if Instant::now() <= guard.deadline {
            continue;
        }
        warn!(transaction_id = %id, "reaper finalising expired transaction");
        let _ = run_raw(&mut guard.conn, "ROLLBACK").await;
        drop(guard);
        TABLE.write().await.remove(&id);
    }
}

/// Begins a new transaction against `pool_name`, pinning a fresh connection
/// for its lifetime. Returns the opaque handle id.
#[instrument(skip(isolation))]
pub async fn begin(pool_name: &str, isolation: IsolationLevel) -> Result<String> {
    let pool = pool::get(pool_name).await?;
    let config = pool::get_config(pool_name).await?;
    let dialect = pool.dialect();
    let mut conn = acquire_pinned(&pool).await?;

    for stmt in begin_sql(dialect, isolation) {
        run_raw(&mut conn, &stmt).await?;
    }

    let id = Uuid::new_v4().to_string();
    let state = TxState {
        pool_name: pool_name.to_string(),
        dialect,
        depth: 1,
        poisoned: false,
        rollback_flag: false,
        conn,
        deadline: Instant::now() + config.transaction_timeout,
    };

    TABLE.write().await.insert(id.clone(), Arc::new(Mutex::new(state)));
    ensure_reaper_started(pool_name);
    debug!(transaction_id = %id, pool_name, "transaction begun");
    Ok(id)
}

/// Opens a nested savepoint scope on an existing handle. Rejected outright
/// on a poisoned handle: there is no statement that can usefully run until
/// the poison is cleared by a `rollback()`.
#[instrument]
pub async fn begin_nested(id: &str) -> Result<()> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    if guard.poisoned {
        return Err(DbError::TransactionPoisoned(id.to_string()));
    }

    let savepoint = format!("sp{}", guard.depth);
    let dialect = guard.dialect;
    let sql = format!("SAVEPOINT {}", quote_savepoint(dialect, &savepoint));
    run_raw(&mut guard.conn, &sql).await?;
    guard.depth += 1;
    debug!(transaction_id = %id, depth = guard.depth, "savepoint opened");
    Ok(())
}

fn quote_savepoint(_dialect: Dialect, name: &str) -> String {
    // Savepoint names are generated internally (`sp<depth>`), never from
    // caller input, so no identifier validation is needed here.
    name.to_string()
}

/// Marks the handle so its outermost `commit()` executes `ROLLBACK` instead,
/// irrespective of exception state at scope exit. Nested scopes below the
/// outermost still release their own savepoints normally when `commit()` is
/// called on them; only the outermost exit honours the flag.
#[instrument]
pub async fn mark_rollback_only(id: &str) -> Result<()> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;
    guard.rollback_flag = true;
    debug!(transaction_id = %id, "transaction marked rollback-only");
    Ok(())
}

/// Commits the innermost open scope. On a poisoned handle this still tears
/// the whole transaction down via `ROLLBACK` (there is nothing valid left
/// to commit) but reports `TRANSACTION_POISONED` to the caller — any
/// subsequent commit call on a poisoned handle reports that kind.
///
/// Returns `true` if the outermost scope actually issued `COMMIT`, `false`
/// if it issued `ROLLBACK` because [`mark_rollback_only`] had been called.
/// A nested `commit()` (savepoint release) always returns `true` — the
/// rollback flag only governs the outermost exit.
#[instrument]
pub async fn commit(id: &str) -> Result<bool> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    if guard.poisoned {
        let _ = run_raw(&mut guard.conn, "ROLLBACK").await;
        drop(guard);
        TABLE.write().await.remove(id);
        return Err(DbError::TransactionPoisoned(id.to_string()));
    }

    if guard.depth > 1 {
        let savepoint = format!("sp{}", guard.depth - 1);
        let dialect = guard.dialect;
        let sql = format!("RELEASE SAVEPOINT {}", quote_savepoint(dialect, &savepoint));
        run_raw(&mut guard.conn, &sql).await?;
        guard.depth -= 1;
        debug!(transaction_id = %id, depth = guard.depth, "savepoint released");
        return Ok(true);
    }

    if guard.rollback_flag {
        run_raw(&mut guard.conn, "ROLLBACK").await?;
        drop(guard);
        TABLE.write().await.remove(id);
        debug!(transaction_id = %id, "outermost commit honoured rollback_flag, issued ROLLBACK");
        return Ok(false);
    }

    run_raw(&mut guard.conn, "COMMIT").await?;
    drop(guard);
    TABLE.write().await.remove(id);
    debug!(transaction_id = %id, "transaction committed");
    Ok(true)
}

/// Rolls back the innermost open scope. Unlike `commit`, this is the
/// healing operation on a poisoned handle: a nested scope heals via
/// `ROLLBACK TO SAVEPOINT`, and the outermost scope heals by fully rolling
/// back and removing the handle — in both cases `rollback` itself succeeds.
#[instrument]
pub async fn rollback(id: &str) -> Result<()> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    if guard.depth > 1 {
        let savepoint = format!("sp{}", guard.depth - 1);
        let dialect = guard.dialect;
        let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_savepoint(dialect, &savepoint));
        run_raw(&mut guard.conn, &sql).await?;
        guard.depth -= 1;
        guard.poisoned = false;
        debug!(transaction_id = %id, depth = guard.depth, "rolled back to savepoint");
        return Ok(());
    }

    run_raw(&mut guard.conn, "ROLLBACK").await?;
    drop(guard);
    TABLE.write().await.remove(id);
    debug!(transaction_id = %id, "transaction rolled back");
    Ok(())
}

/// Runs a compiled statement on the handle's pinned connection. Poisons the
/// handle if the statement errors, or if this future is cancelled before
/// the statement completes (see `PoisonGuard`).
#[instrument(skip(ir), fields(table = %ir.table))]
pub async fn execute(id: &str, ir: &Ir) -> Result<ExecOutcome> {
    let state = lookup(id).await?;
    let mut tx_guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    if tx_guard.poisoned {
        return Err(DbError::TransactionPoisoned(id.to_string()));
    }

    let dialect = tx_guard.dialect;
    let mut poison_guard = PoisonGuard::new(&mut tx_guard);
    let result = driver::run_ir_on_pinned(poison_guard.conn_mut(), ir, dialect).await;
    match &result {
        Ok(_) => poison_guard.disarm(),
        Err(e) => warn!(transaction_id = %id, kind = e.kind(), "statement poisoned the transaction"),
    }
    drop(poison_guard);
    result
}

/// Runs `ir` and then its `prefetches`, in order, all on the handle's
/// pinned connection — so a prefetch issued inside a transaction sees that
/// transaction's own uncommitted writes, since both statements run on the
/// same pinned connection in strict order.
pub async fn execute_with_prefetch(id: &str, ir: &Ir) -> Result<(ExecOutcome, Vec<driver::PrefetchOutcome>)> {
    let primary = execute(id, ir).await?;
    if ir.prefetches.is_empty() {
        return Ok((primary, Vec::new()));
    }

    let prefetched = driver::run_prefetches(ir, &primary, |child_ir| async move {
        execute(id, &child_ir).await
    })
    .await?;
    Ok((primary, prefetched))
}

/// Acquires a Postgres/MySQL advisory lock on the handle's pinned
/// connection, guaranteeing `lock` and `unlock` run on the same session.
/// SQLite has no advisory-lock primitive and is a no-op here; callers
/// relying on cross-process schema coordination on SQLite must use a
/// different mechanism (e.g. a sentinel row and `BEGIN IMMEDIATE`).
#[instrument]
pub async fn acquire_advisory_lock(id: &str, key: i64) -> Result<()> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    if guard.poisoned {
        return Err(DbError::TransactionPoisoned(id.to_string()));
    }

    let sql = match guard.dialect {
        Dialect::Postgres => format!("SELECT pg_advisory_lock({key})"),
        Dialect::MySql => format!("SELECT GET_LOCK('{key}', -1)"),
        Dialect::Sqlite => return Ok(()),
    };
    run_raw(&mut guard.conn, &sql).await
}

#[instrument]
pub async fn release_advisory_lock(id: &str, key: i64) -> Result<()> {
    let state = lookup(id).await?;
    let mut guard = state
        .try_lock()
        .map_err(|_| DbError::usage(format!("transaction '{id}' is in concurrent use")))?;

    let sql = match guard.dialect {
        Dialect::Postgres => format!("SELECT pg_advisory_unlock({key})"),
        Dialect::MySql => format!("SELECT RELEASE_LOCK('{key}')"),
        Dialect::Sqlite => return Ok(()),
    };
    run_raw(&mut guard.conn, &sql).await
}

/// Rolls back and removes every handle belonging to `pool_name`. Called
/// before `pool::close` so a pool is never closed out from under a live
/// transaction's pinned connection.
#[instrument]
pub async fn rollback_all_for_pool(pool_name: &str) {
    let ids: Vec<String> = {
        let table = TABLE.read().await;
        table
            .iter()
            .filter(|(_, state)| {
                state.try_lock().map(|s| s.pool_name == pool_name).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    };

    for id in ids {
        if let Some(state) = TABLE.write().await.remove(&id) {
            if let Ok(mut guard) = state.try_lock() {
                let _ = run_raw(&mut guard.conn, "ROLLBACK").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_levels_render_standard_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
    }

    #[test]
    fn postgres_begin_carries_isolation_level() {
        let stmts = begin_sql(Dialect::Postgres, IsolationLevel::RepeatableRead);
        assert_eq!(stmts, vec!["BEGIN ISOLATION LEVEL REPEATABLE READ".to_string()]);
    }

    #[test]
    fn sqlite_begin_ignores_isolation_level() {
        let stmts = begin_sql(Dialect::Sqlite, IsolationLevel::Serializable);
        assert_eq!(stmts, vec!["BEGIN".to_string()]);
    }

    #[test]
    fn mysql_begin_sets_isolation_separately() {
        let stmts = begin_sql(Dialect::MySql, IsolationLevel::ReadCommitted);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("SET TRANSACTION ISOLATION LEVEL"));
        assert_eq!(stmts[1], "START TRANSACTION");
    }

    #[tokio::test]
    async fn lookup_of_unknown_handle_is_usage_error() {
        let err = lookup("never-begun").await.unwrap_err();
        assert_eq!(err.kind(), "USAGE");
    }
}

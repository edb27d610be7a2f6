//! The Driver: executes a compiled statement against either a standalone
//! pool connection or a transaction's pinned connection, and hydrates the
//! resulting rows.
//!
//! Grounded in `ouroboros-postgres::executor::QueryExecutor`'s tracing-span
//! and slow-query-logging shape, with the retry loop deliberately dropped
//! Retry is deliberately left to the caller, not the Driver.
//! Parameter binding follows `data-bridge/src/postgres.rs`'s
//! `ExtractedValue::bind_to_arguments` pattern, generalised to all three
//! `sqlx::Arguments` implementations the engine targets.

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Arguments as _, Row as _};
use tracing::{debug, instrument, warn};

use crate::dialect::Dialect;
use crate::error::{classify_sqlx_error, DbError, Result};
use crate::hydrate;
use crate::ir::{FilterNode, FilterOp, Ir, Operand, Operation};
use crate::pool::{self, Pool};
use crate::query;
use crate::query::modify::DEFAULT_INSERT_BATCH_SIZE;
use crate::value::Value;

/// Queries at or above this duration are logged at `warn` instead of `debug`,
/// mirroring `ouroboros`'s `ExecutorConfig::slow_query_threshold_ms` default.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1000);

/// What a single compiled statement produced, before the Bridge encodes it
/// into the external result envelope.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    /// Populated for INSERT on dialects without `RETURNING` (SQLite < 3.35,
    /// MySQL). For a multi-row MySQL insert this is the first allocated id
    /// in the batch; the exact range for the remaining rows is inherently
    /// approximate under concurrent writers.
    pub last_insert_id: Option<Value>,
}

impl ExecOutcome {
    fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let rows_affected = rows.len() as u64;
        ExecOutcome { columns, rows, rows_affected, last_insert_id: None }
    }

    fn merge(&mut self, other: ExecOutcome) {
        if self.columns.is_empty() {
            self.columns = other.columns;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        if other.last_insert_id.is_some() {
            self.last_insert_id = other.last_insert_id;
        }
    }
}

/// Executes `ir` against the named pool, acquiring and releasing a
/// connection for the duration of the single statement (or, for a batched
/// bulk insert, the run of statements). Guaranteed release on both the
/// success and failure paths is `sqlx`'s own pool-handle drop semantics —
/// no manual acquire/release bookkeeping is needed here.
#[instrument(skip(ir), fields(pool_name = pool_name, operation = ?ir.operation, table = %ir.table))]
pub async fn execute(pool_name: &str, ir: &Ir) -> Result<ExecOutcome> {
    let pool = pool::get(pool_name).await?;
    let dialect = pool.dialect();

    if is_batchable_insert(ir) {
        return execute_batched_insert_on_pool(&pool, ir, dialect).await;
    }

    let (sql, params) = query::compile(ir, dialect)?;
    run_on_pool(&pool, &sql, &params, ir).await
}

/// The result of one reverse-relation prefetch, run as a second query after
/// the parent's.
#[derive(Debug, Clone)]
pub struct PrefetchOutcome {
    pub name: String,
    pub outcome: ExecOutcome,
}

/// Runs `ir`'s `prefetches` against `primary` (the already-executed parent
/// result), invoking `run` once per prefetch spec with a SELECT IR whose
/// filter is `foreign_key IN (parent reference_column values)`. `run` is
/// supplied by the caller so the same fan-out logic serves both a
/// stand-alone pool execution and a transaction's pinned connection,
/// keeping the two awaits on the same connection "in strict order" as the
/// design note requires.
///
/// Requires `primary.columns` to include each prefetch's `reference_column`
/// — the caller's IR projection must name it explicitly (or omit `columns`
/// entirely to get `*`), since the fan-out has no way to recover a key
/// column that was never selected.
pub async fn run_prefetches<F, Fut>(ir: &Ir, primary: &ExecOutcome, mut run: F) -> Result<Vec<PrefetchOutcome>>
where
    F: FnMut(Ir) -> Fut,
    Fut: Future<Output = Result<ExecOutcome>>,
{
    if ir.prefetches.is_empty() {
        return Ok(Vec::new());
    }

    let mut results = Vec::with_capacity(ir.prefetches.len());
    for prefetch in &ir.prefetches {
        let col_idx = primary
            .columns
            .iter()
            .position(|c| c == &prefetch.reference_column)
            .ok_or_else(|| {
                DbError::usage(format!(
                    "prefetch '{}' requires column '{}' in the parent projection",
                    prefetch.name, prefetch.reference_column
                ))
            })?;

        let mut seen = HashSet::new();
        let keys: Vec<Value> = primary
            .rows
            .iter()
            .map(|row| row[col_idx].clone())
            .filter(|v| !v.is_null())
            .filter(|v| seen.insert(v.naive_render()))
            .collect();

        let mut child = Ir::select(prefetch.table.clone());
        child.filter = Some(FilterNode::Condition {
            field: prefetch.foreign_key.clone(),
            op: FilterOp::In,
            operand: Operand::Values(keys),
        });

        let outcome = run(child).await?;
        results.push(PrefetchOutcome { name: prefetch.name.clone(), outcome });
    }

    Ok(results)
}

/// Executes `ir` on `pool_name` and then its `prefetches`, in order, on the
/// same pool. The entry point the Bridge calls for a standalone (non-
/// transactional) query carrying reverse-relation prefetches.
pub async fn execute_with_prefetch(pool_name: &str, ir: &Ir) -> Result<(ExecOutcome, Vec<PrefetchOutcome>)> {
    let primary = execute(pool_name, ir).await?;
    if ir.prefetches.is_empty() {
        return Ok((primary, Vec::new()));
    }

    let pool = pool::get(pool_name).await?;
    let dialect = pool.dialect();
    let prefetched = run_prefetches(ir, &primary, |child_ir| {
        let pool = pool.clone();
        async move {
            let (sql, params) = query::compile(&child_ir, dialect)?;
            run_on_pool(&pool, &sql, &params, &child_ir).await
        }
    })
    .await?;
    Ok((primary, prefetched))
}

/// Executes a pre-compiled statement directly on a pinned connection,
/// bypassing the SQL Builder. Used by the Transaction Manager for the
/// control statements (`BEGIN`, `SAVEPOINT`, ...) it issues itself.
pub(crate) async fn run_raw_on_postgres(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
    sql: &str,
) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut **conn)
        .await
        .map_err(|e| classify_sqlx_error(e, Dialect::Postgres))?;
    Ok(())
}

pub(crate) async fn run_raw_on_sqlite(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
    sql: &str,
) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut **conn)
        .await
        .map_err(|e| classify_sqlx_error(e, Dialect::Sqlite))?;
    Ok(())
}

pub(crate) async fn run_raw_on_mysql(
    conn: &mut sqlx::pool::PoolConnection<sqlx::MySql>,
    sql: &str,
) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut **conn)
        .await
        .map_err(|e| classify_sqlx_error(e, Dialect::MySql))?;
    Ok(())
}

/// Compiles and runs `ir` on a transaction's pinned connection. Called only
/// by the Transaction Manager, which owns the connection's mutual exclusion.
pub(crate) async fn run_ir_on_pinned(
    conn: &mut crate::transaction::PinnedConnection,
    ir: &Ir,
    dialect: Dialect,
) -> Result<ExecOutcome> {
    if is_batchable_insert(ir) {
        let mut total = ExecOutcome::default();
        for chunk in ir.insert_values.chunks(DEFAULT_INSERT_BATCH_SIZE) {
            let mut chunk_ir = ir.clone();
            chunk_ir.insert_values = chunk.to_vec();
            let (sql, params) = query::compile(&chunk_ir, dialect)?;
            let outcome = run_on_pinned_once(conn, &sql, &params, &chunk_ir).await?;
            total.merge(outcome);
        }
        return Ok(total);
    }

    let (sql, params) = query::compile(ir, dialect)?;
    run_on_pinned_once(conn, &sql, &params, ir).await
}

async fn run_on_pinned_once(
    conn: &mut crate::transaction::PinnedConnection,
    sql: &str,
    params: &[Value],
    ir: &Ir,
) -> Result<ExecOutcome> {
    use crate::transaction::PinnedConnection;
    match conn {
        PinnedConnection::Postgres(c) => run_postgres(&mut **c, sql, params, ir).await,
        PinnedConnection::Sqlite(c) => run_sqlite(&mut **c, sql, params, ir).await,
        PinnedConnection::MySql(c) => run_mysql(&mut **c, sql, params, ir).await,
    }
}

fn is_batchable_insert(ir: &Ir) -> bool {
    ir.operation == Operation::Insert && ir.insert_values.len() > DEFAULT_INSERT_BATCH_SIZE
}

async fn execute_batched_insert_on_pool(pool: &Pool, ir: &Ir, dialect: Dialect) -> Result<ExecOutcome> {
    let mut total = ExecOutcome::default();
    for chunk in ir.insert_values.chunks(DEFAULT_INSERT_BATCH_SIZE) {
        let mut chunk_ir = ir.clone();
        chunk_ir.insert_values = chunk.to_vec();
        let (sql, params) = query::compile(&chunk_ir, dialect)?;
        let outcome = run_on_pool(pool, &sql, &params, &chunk_ir).await?;
        total.merge(outcome);
    }
    Ok(total)
}

async fn run_on_pool(pool: &Pool, sql: &str, params: &[Value], ir: &Ir) -> Result<ExecOutcome> {
    match pool {
        Pool::Postgres(p) => run_postgres(p, sql, params, ir).await,
        Pool::Sqlite(p) => run_sqlite(p, sql, params, ir).await,
        Pool::MySql(p) => run_mysql(p, sql, params, ir).await,
    }
}

/// Whether a statement's result set should be fetched as rows rather than
/// treated as a rowcount. SELECT/EXPLAIN always fetch; INSERT/UPDATE/DELETE
/// fetch only when `RETURNING` was requested; RAW is sniffed from its SQL
/// text since the caller may pass either a query or a command through it.
fn expects_rows(ir: &Ir) -> bool {
    match ir.operation {
        Operation::Select | Operation::Explain => true,
        Operation::Insert | Operation::Update | Operation::Delete => !ir.returning.is_empty(),
        Operation::Raw => {
            let sql = ir.raw.as_ref().map(|r| r.sql.as_str()).unwrap_or("");
            let head: String = sql.trim_start().chars().take(12).collect::<String>().to_ascii_uppercase();
            head.starts_with("SELECT")
                || head.starts_with("WITH")
                || head.starts_with("EXPLAIN")
                || head.starts_with("PRAGMA")
                || head.starts_with("SHOW")
        }
    }
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

fn log_completion(sql: &str, elapsed: Duration) {
    let elapsed_ms = elapsed.as_millis() as u64;
    if elapsed >= SLOW_QUERY_THRESHOLD {
        warn!(sql = %preview(sql), elapsed_ms, "slow query detected");
    } else {
        debug!(sql = %preview(sql), elapsed_ms, "query completed");
    }
}

fn log_failure(err: sqlx::Error, dialect: Dialect, sql: &str, start: Instant) -> DbError {
    let classified = classify_sqlx_error(err, dialect);
    warn!(
        sql = %preview(sql),
        elapsed_ms = start.elapsed().as_millis() as u64,
        kind = classified.kind(),
        "query failed"
    );
    classified
}

fn bind_postgres(params: &[Value]) -> Result<PgArguments> {
    let mut args = PgArguments::default();
    for value in params {
        let outcome = match value {
            Value::Null => args.add(Option::<i32>::None),
            Value::Bool(b) => args.add(*b),
            Value::I64(i) => args.add(*i),
            Value::F64(f) => args.add(*f),
            Value::Decimal(d) => args.add(parse_decimal(d)?),
            Value::Text(s) => args.add(s.clone()),
            Value::Bytes(b) => args.add(b.clone()),
            Value::Timestamp(t) => args.add(*t),
            Value::Date(d) => args.add(*d),
            Value::Uuid(u) => args.add(*u),
            Value::Json(j) => args.add(j.clone()),
        };
        outcome.map_err(|e| DbError::build(format!("failed to bind parameter: {e}")))?;
    }
    Ok(args)
}

fn bind_sqlite(params: &[Value]) -> Result<SqliteArguments<'static>> {
    let mut args = SqliteArguments::default();
    for value in params {
        let outcome = match value {
            Value::Null => args.add(Option::<i64>::None),
            Value::Bool(b) => args.add(*b),
            Value::I64(i) => args.add(*i),
            Value::F64(f) => args.add(*f),
            // SQLite has no native decimal affinity; carried as TEXT so the
            // round trip through Hydrator preserves exact precision.
            Value::Decimal(d) => args.add(d.clone()),
            Value::Text(s) => args.add(s.clone()),
            Value::Bytes(b) => args.add(b.clone()),
            Value::Timestamp(t) => args.add(*t),
            Value::Date(d) => args.add(*d),
            Value::Uuid(u) => args.add(u.to_string()),
            Value::Json(j) => args.add(j.to_string()),
        };
        outcome.map_err(|e| DbError::build(format!("failed to bind parameter: {e}")))?;
    }
    Ok(args)
}

fn bind_mysql(params: &[Value]) -> Result<MySqlArguments> {
    let mut args = MySqlArguments::default();
    for value in params {
        let outcome = match value {
            Value::Null => args.add(Option::<i64>::None),
            Value::Bool(b) => args.add(*b),
            Value::I64(i) => args.add(*i),
            Value::F64(f) => args.add(*f),
            Value::Decimal(d) => args.add(parse_decimal(d)?),
            Value::Text(s) => args.add(s.clone()),
            Value::Bytes(b) => args.add(b.clone()),
            Value::Timestamp(t) => args.add(*t),
            Value::Date(d) => args.add(*d),
            Value::Uuid(u) => args.add(u.to_string()),
            Value::Json(j) => args.add(j.clone()),
        };
        outcome.map_err(|e| DbError::build(format!("failed to bind parameter: {e}")))?;
    }
    Ok(args)
}

fn parse_decimal(text: &str) -> Result<Decimal> {
    text.parse::<Decimal>()
        .map_err(|e| DbError::build(format!("invalid decimal literal '{text}': {e}")))
}

async fn run_postgres<'e, E>(executor: E, sql: &str, params: &[Value], ir: &Ir) -> Result<ExecOutcome>
where
    E: sqlx::PgExecutor<'e>,
{
    let args = bind_postgres(params)?;
    let start = Instant::now();

    if expects_rows(ir) {
        let rows = sqlx::query_with(sql, args)
            .fetch_all(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::Postgres, sql, start))?;
        log_completion(sql, start.elapsed());
        let (columns, values) = hydrate::hydrate_postgres_rows(&rows)?;
        Ok(ExecOutcome::from_rows(columns, values))
    } else {
        let result = sqlx::query_with(sql, args)
            .execute(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::Postgres, sql, start))?;
        log_completion(sql, start.elapsed());
        Ok(ExecOutcome { columns: vec![], rows: vec![], rows_affected: result.rows_affected(), last_insert_id: None })
    }
}

async fn run_sqlite<'e, E>(executor: E, sql: &str, params: &[Value], ir: &Ir) -> Result<ExecOutcome>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let args = bind_sqlite(params)?;
    let start = Instant::now();

    if expects_rows(ir) {
        let rows = sqlx::query_with(sql, args)
            .fetch_all(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::Sqlite, sql, start))?;
        log_completion(sql, start.elapsed());
        let (columns, values) = hydrate::hydrate_sqlite_rows(&rows)?;
        Ok(ExecOutcome::from_rows(columns, values))
    } else {
        let result = sqlx::query_with(sql, args)
            .execute(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::Sqlite, sql, start))?;
        log_completion(sql, start.elapsed());
        let last_insert_id = matches!(ir.operation, Operation::Insert)
            .then(|| Value::I64(result.last_insert_rowid()));
        Ok(ExecOutcome { columns: vec![], rows: vec![], rows_affected: result.rows_affected(), last_insert_id })
    }
}

async fn run_mysql<'e, E>(executor: E, sql: &str, params: &[Value], ir: &Ir) -> Result<ExecOutcome>
where
    E: sqlx::MySqlExecutor<'e>,
{
    let args = bind_mysql(params)?;
    let start = Instant::now();

    if expects_rows(ir) {
        let rows = sqlx::query_with(sql, args)
            .fetch_all(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::MySql, sql, start))?;
        log_completion(sql, start.elapsed());
        let (columns, values) = hydrate::hydrate_mysql_rows(&rows)?;
        Ok(ExecOutcome::from_rows(columns, values))
    } else {
        let result = sqlx::query_with(sql, args)
            .execute(executor)
            .await
            .map_err(|e| log_failure(e, Dialect::MySql, sql, start))?;
        log_completion(sql, start.elapsed());
        // Multi-row inserts: MySQL's LAST_INSERT_ID() reflects the first row
        // of the batch; the remaining rows are contiguous only in the
        // absence of concurrent writers.
        let last_insert_id = matches!(ir.operation, Operation::Insert)
            .then(|| Value::I64(result.last_insert_id() as i64));
        Ok(ExecOutcome { columns: vec![], rows: vec![], rows_affected: result.rows_affected(), last_insert_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Ir;

    #[test]
    fn select_always_expects_rows() {
        assert!(expects_rows(&Ir::select("users")));
    }

    #[test]
    fn insert_without_returning_expects_rowcount() {
        let ir = Ir::insert("users", vec![vec![("name".into(), Value::Text("a".into()))]]);
        assert!(!expects_rows(&ir));
    }

    #[test]
    fn insert_with_returning_expects_rows() {
        let mut ir = Ir::insert("users", vec![vec![("name".into(), Value::Text("a".into()))]]);
        ir.returning = vec!["id".into()];
        assert!(expects_rows(&ir));
    }

    #[test]
    fn raw_select_is_sniffed_as_rows() {
        let ir = Ir::raw("  select 1", vec![]);
        assert!(expects_rows(&ir));
    }

    #[test]
    fn raw_ddl_is_sniffed_as_rowcount() {
        let ir = Ir::raw("CREATE TABLE t (id int)", vec![]);
        assert!(!expects_rows(&ir));
    }

    #[test]
    fn batchable_insert_splits_over_the_default_batch_size() {
        let rows: Vec<Vec<(String, Value)>> =
            (0..(DEFAULT_INSERT_BATCH_SIZE + 1)).map(|i| vec![("n".into(), Value::I64(i as i64))]).collect();
        let ir = Ir::insert("t", rows);
        assert!(is_batchable_insert(&ir));
    }

    #[test]
    fn small_insert_is_not_batched() {
        let ir = Ir::insert("t", vec![vec![("n".into(), Value::I64(1))]]);
        assert!(!is_batchable_insert(&ir));
    }
}

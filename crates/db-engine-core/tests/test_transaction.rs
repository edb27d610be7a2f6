//! Integration tests for the Transaction Manager against a real (in-memory)
//! SQLite backend. Postgres/MySQL variants of the same scenarios need a live
//! server and are intentionally left to a manual/CI fixture gated on
//! `DATABASE_URL`.

use std::sync::atomic::{AtomicU64, Ordering};

use db_engine_core::driver;
use db_engine_core::ir::{FilterNode, Ir, UpdateValue};
use db_engine_core::pool::{self, PoolConfig};
use db_engine_core::transaction::{self, IsolationLevel};
use db_engine_core::value::Value;

static COUNTER: AtomicU64 = AtomicU64::new(0);

async fn fresh_pool() -> String {
    let name = format!("tx_test_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    pool::register(&name, "sqlite::memory:", PoolConfig::default()).await.unwrap();

    let ir = Ir::raw(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        vec![],
    );
    driver::execute(&name, &ir).await.unwrap();
    let ir = Ir::raw(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER)",
        vec![],
    );
    driver::execute(&name, &ir).await.unwrap();

    name
}

fn insert_user(name: &str) -> Ir {
    Ir::insert("users", vec![vec![("name".to_string(), Value::Text(name.to_string()))]])
}

fn insert_post(author_id: i64) -> Ir {
    Ir::insert("posts", vec![vec![("author_id".to_string(), Value::I64(author_id))]])
}

#[tokio::test]
async fn nested_savepoint_rollback_then_outer_commit() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();
    transaction::execute(&id, &insert_user("A")).await.unwrap();

    transaction::begin_nested(&id).await.unwrap();
    transaction::execute(&id, &insert_post(1)).await.unwrap();
    transaction::rollback(&id).await.unwrap();

    let committed = transaction::commit(&id).await.unwrap();
    assert!(committed);

    let users = driver::execute(&pool_name, &Ir::select("users")).await.unwrap();
    assert_eq!(users.rows.len(), 1);

    let posts = driver::execute(&pool_name, &Ir::select("posts")).await.unwrap();
    assert!(posts.rows.is_empty());

    pool::close(&pool_name).await;
}

#[tokio::test]
async fn rollback_flag_forces_rollback_at_outermost_commit() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();
    transaction::execute(&id, &insert_user("B")).await.unwrap();
    transaction::mark_rollback_only(&id).await.unwrap();

    let committed = transaction::commit(&id).await.unwrap();
    assert!(!committed);

    let users = driver::execute(&pool_name, &Ir::select("users")).await.unwrap();
    assert!(users.rows.is_empty());

    pool::close(&pool_name).await;
}

#[tokio::test]
async fn nested_commit_ignores_outer_rollback_flag_until_outermost_exit() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();
    transaction::begin_nested(&id).await.unwrap();
    transaction::mark_rollback_only(&id).await.unwrap();

    // The nested scope's own commit still releases its savepoint normally;
    // only the *outermost* exit honours the flag.
    let inner_committed = transaction::commit(&id).await.unwrap();
    assert!(inner_committed);

    let outer_committed = transaction::commit(&id).await.unwrap();
    assert!(!outer_committed);

    pool::close(&pool_name).await;
}

#[tokio::test]
async fn statement_failure_poisons_the_handle() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();

    let mut bad_insert = insert_user("dup");
    bad_insert.table = "no_such_table".to_string();
    let err = transaction::execute(&id, &bad_insert).await.unwrap_err();
    assert_eq!(err.kind(), "BACKEND");

    let err = transaction::execute(&id, &insert_user("C")).await.unwrap_err();
    assert_eq!(err.kind(), "TRANSACTION_POISONED");

    // rollback() is the healing operation even on a poisoned handle.
    transaction::rollback(&id).await.unwrap();

    pool::close(&pool_name).await;
}

#[tokio::test]
async fn prefetch_runs_on_the_same_pinned_connection_inside_a_transaction() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();
    transaction::execute(&id, &insert_user("A")).await.unwrap();
    transaction::execute(&id, &insert_post(1)).await.unwrap();
    transaction::execute(&id, &insert_post(1)).await.unwrap();

    let mut parent = Ir::select("users");
    parent.columns = Some(vec!["id".to_string(), "name".to_string()]);
    parent.prefetches.push(db_engine_core::ir::Prefetch {
        name: "posts".to_string(),
        table: "posts".to_string(),
        foreign_key: "author_id".to_string(),
        reference_column: "id".to_string(),
    });

    // A prefetch issued inside the transaction must see this transaction's
    // own uncommitted inserts above, not just what is already committed.
    let (primary, prefetched) = transaction::execute_with_prefetch(&id, &parent).await.unwrap();
    assert_eq!(primary.rows.len(), 1);
    assert_eq!(prefetched.len(), 1);
    assert_eq!(prefetched[0].name, "posts");
    assert_eq!(prefetched[0].outcome.rows.len(), 2);

    transaction::commit(&id).await.unwrap();
    pool::close(&pool_name).await;
}

#[tokio::test]
async fn reaper_finalises_a_transaction_past_its_deadline() {
    let name = format!("tx_test_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    let config = PoolConfig {
        transaction_timeout: std::time::Duration::from_millis(100),
        transaction_cleanup_interval: std::time::Duration::from_millis(50),
        ..PoolConfig::default()
    };
    pool::register(&name, "sqlite::memory:", config).await.unwrap();
    driver::execute(&name, &Ir::raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", vec![]))
        .await
        .unwrap();

    let id = transaction::begin(&name, IsolationLevel::ReadCommitted).await.unwrap();
    transaction::execute(&id, &insert_user("A")).await.unwrap();

    // No work for longer than transaction_timeout + 2*cleanup_interval: the
    // reaper must have finalised the handle by forcibly rolling it back.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    let err = transaction::commit(&id).await.unwrap_err();
    assert_eq!(err.kind(), "USAGE");

    let users = driver::execute(&name, &Ir::select("users")).await.unwrap();
    assert!(users.rows.is_empty());

    pool::close(&name).await;
}

#[tokio::test]
async fn atomic_increment_inside_a_transaction() {
    let pool_name = fresh_pool().await;

    let id = transaction::begin(&pool_name, IsolationLevel::ReadCommitted).await.unwrap();
    let outcome = transaction::execute(&id, &insert_post(1)).await.unwrap();
    assert_eq!(outcome.rows_affected, 1);

    let mut update = Ir::update(
        "posts",
        vec![(
            "author_id".to_string(),
            UpdateValue::Expr(db_engine_core::ir::Expression::BinOp(
                db_engine_core::ir::ArithOp::Add,
                Box::new(db_engine_core::ir::Expression::Column("author_id".to_string())),
                Box::new(db_engine_core::ir::Expression::Literal(Value::I64(1))),
            )),
        )],
    );
    update.filter = Some(FilterNode::eq("id", 1i64));
    transaction::execute(&id, &update).await.unwrap();
    transaction::commit(&id).await.unwrap();

    let rows = driver::execute(&pool_name, &Ir::select("posts")).await.unwrap();
    assert_eq!(rows.rows.len(), 1);

    pool::close(&pool_name).await;
}

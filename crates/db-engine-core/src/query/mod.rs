//! The SQL Builder: compiles an `Ir` into dialect-correct SQL text plus an
//! ordered parameter vector.
//!
//! Grounded in `ouroboros-postgres::query::mod`'s module layout (types,
//! helpers, builder, select, modify kept as separate files), with its
//! fluent `QueryBuilder` state machine replaced by pure functions over the
//! declarative `Ir` record.

pub mod expr;
pub mod filter;
pub mod helpers;
pub mod modify;
pub mod select;
pub mod writer;

use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use crate::ir::{Ir, Operation};
use crate::value::Value;

/// Compiles any `Ir` into dialect-correct SQL, dispatching on its operation.
///
/// This is the SQL Builder's single public entry point; callers never
/// invoke `select`/`modify` directly.
pub fn compile(ir: &Ir, dialect: Dialect) -> Result<(String, Vec<Value>)> {
    match ir.operation {
        Operation::Select => select::build_select(ir, dialect),
        Operation::Insert => modify::build_insert(ir, dialect),
        Operation::Update => modify::build_update(ir, dialect),
        Operation::Delete => modify::build_delete(ir, dialect),
        Operation::Explain => {
            let (inner_sql, params) = select::build_select(ir, dialect)?;
            Ok((format!("{}{inner_sql}", dialect.explain_prefix(ir.explain_analyze)), params))
        }
        Operation::Raw => {
            let raw = ir
                .raw
                .as_ref()
                .ok_or_else(|| DbError::build("raw operation requires a raw query payload"))?;
            reject_mixed_placeholders(&raw.sql)?;
            Ok((raw.sql.clone(), raw.params.clone()))
        }
    }
}

/// Rejects a raw SQL string that mixes Postgres-style `$n` placeholders
/// with SQLite/MySQL-style `?` placeholders; a caller's raw SQL is meant
/// for exactly one dialect's placeholder convention, and a mix is almost
/// always a copy-paste mistake rather than an intentional query.
fn reject_mixed_placeholders(sql: &str) -> Result<()> {
    let mut chars = sql.chars().peekable();
    let mut has_numbered = false;
    let mut has_positional = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            '?' if !in_single_quote && !in_double_quote => has_positional = true,
            '$' if !in_single_quote && !in_double_quote => {
                if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    has_numbered = true;
                }
            }
            _ => {}
        }
    }

    if has_numbered && has_positional {
        return Err(DbError::build(
            "raw SQL mixes '$n' and '?' placeholders from different dialects",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FilterNode, UpdateValue};

    #[test]
    fn dispatches_select() {
        let ir = Ir::select("users");
        let (sql, _) = compile(&ir, Dialect::Postgres).unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\"");
    }

    #[test]
    fn dispatches_explain_with_dialect_prefix() {
        let ir = Ir { operation: Operation::Explain, ..Ir::select("users") };
        let (sql, _) = compile(&ir, Dialect::Postgres).unwrap();
        assert!(sql.starts_with("EXPLAIN"));
        assert!(sql.contains("SELECT * FROM \"users\""));
    }

    #[test]
    fn dispatches_explain_analyze_on_postgres() {
        let ir = Ir { operation: Operation::Explain, explain_analyze: true, ..Ir::select("users") };
        let (sql, _) = compile(&ir, Dialect::Postgres).unwrap();
        assert!(sql.starts_with("EXPLAIN (ANALYZE)"));
    }

    #[test]
    fn explain_analyze_ignored_on_sqlite() {
        let ir = Ir { operation: Operation::Explain, explain_analyze: true, ..Ir::select("users") };
        let (sql, _) = compile(&ir, Dialect::Sqlite).unwrap();
        assert!(sql.starts_with("EXPLAIN QUERY PLAN"));
    }

    #[test]
    fn dispatches_raw() {
        let ir = Ir::raw("SELECT 1", vec![]);
        let (sql, params) = compile(&ir, Dialect::Sqlite).unwrap();
        assert_eq!(sql, "SELECT 1");
        assert!(params.is_empty());
    }

    #[test]
    fn raw_rejects_mixed_placeholder_styles() {
        let ir = Ir::raw("SELECT * FROM users WHERE id = $1 AND name = ?", vec![]);
        let err = compile(&ir, Dialect::Postgres).unwrap_err();
        assert_eq!(err.kind(), "BUILD");
    }

    #[test]
    fn raw_allows_question_mark_inside_string_literal_alongside_numbered_placeholder() {
        let ir = Ir::raw("SELECT * FROM users WHERE name = 'what?' AND id = $1", vec![]);
        assert!(compile(&ir, Dialect::Postgres).is_ok());
    }

    #[test]
    fn dispatches_update() {
        let mut ir = Ir::update("users", vec![("name".into(), UpdateValue::Value(Value::Text("x".into())))]);
        ir.filter = Some(FilterNode::eq("id", 1i64));
        let (sql, _) = compile(&ir, Dialect::MySql).unwrap();
        assert_eq!(sql, "UPDATE `users` SET `name` = ? WHERE `id` = ?");
    }
}

//! Compiles INSERT/UPDATE/DELETE-shaped `Ir` to SQL.
//!
//! Grounded in `ouroboros-postgres::query::modify::{build_insert, build_update,
//! build_delete}`, generalised over dialect for RETURNING availability and
//! placeholder convention.

use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use crate::ir::{Ir, UpdateValue};
use crate::query::expr::compile_expression;
use crate::query::filter::compile_filter;
use crate::query::helpers::validate_identifier;
use crate::query::writer::SqlWriter;
use crate::value::Value;

/// Default cap on rows per multi-row INSERT statement, matching the
/// "configurable batch size" named in the component design.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1000;

pub fn build_insert(ir: &Ir, dialect: Dialect) -> Result<(String, Vec<Value>)> {
    validate_identifier(&ir.table)?;
    if ir.insert_values.is_empty() {
        return Err(DbError::usage("bulk insert requires at least one row"));
    }

    let column_names: Vec<String> = ir.insert_values[0].iter().map(|(c, _)| c.clone()).collect();
    for col in &column_names {
        validate_identifier(col)?;
    }
    for row in &ir.insert_values {
        let row_cols: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        if row_cols != column_names.iter().map(|s| s.as_str()).collect::<Vec<_>>() {
            return Err(DbError::build("all rows in a bulk insert must share the same column set and order"));
        }
    }

    let mut w = SqlWriter::new(dialect);
    w.push_str("INSERT INTO ");
    w.push_identifier(&ir.table);
    w.push_str(" (");
    for (i, col) in column_names.iter().enumerate() {
        if i > 0 {
            w.push_str(", ");
        }
        w.push_identifier(col);
    }
    w.push_str(") VALUES ");

    for (row_idx, row) in ir.insert_values.iter().enumerate() {
        if row_idx > 0 {
            w.push_str(", ");
        }
        w.push_str("(");
        for (col_idx, (_, value)) in row.iter().enumerate() {
            if col_idx > 0 {
                w.push_str(", ");
            }
            w.push_param(value.clone());
        }
        w.push_str(")");
    }

    if !ir.returning.is_empty() {
        if dialect.supports_returning() {
            w.push_str(" RETURNING ");
            for (i, col) in ir.returning.iter().enumerate() {
                if i > 0 {
                    w.push_str(", ");
                }
                w.push_identifier(col);
            }
        }
        // MySQL: no RETURNING support. The Driver reads LAST_INSERT_ID in
        // the same round-trip instead.
    }

    Ok(w.finish())
}

pub fn build_update(ir: &Ir, dialect: Dialect) -> Result<(String, Vec<Value>)> {
    validate_identifier(&ir.table)?;
    if ir.update_values.is_empty() {
        return Err(DbError::usage("update requires at least one column"));
    }

    let mut w = SqlWriter::new(dialect);
    w.push_str("UPDATE ");
    w.push_identifier(&ir.table);
    w.push_str(" SET ");

    for (i, (col, value)) in ir.update_values.iter().enumerate() {
        validate_identifier(col)?;
        if i > 0 {
            w.push_str(", ");
        }
        w.push_identifier(col);
        w.push_str(" = ");
        match value {
            UpdateValue::Value(v) => {
                w.push_param(v.clone());
            }
            UpdateValue::Expr(expr) => {
                compile_expression(&mut w, expr)?;
            }
        }
    }

    if let Some(filter) = &ir.filter {
        w.push_str(" WHERE ");
        compile_filter(&mut w, filter)?;
    }

    if !ir.returning.is_empty() && dialect.supports_returning() {
        w.push_str(" RETURNING ");
        for (i, col) in ir.returning.iter().enumerate() {
            if i > 0 {
                w.push_str(", ");
            }
            w.push_identifier(col);
        }
    }

    Ok(w.finish())
}

pub fn build_delete(ir: &Ir, dialect: Dialect) -> Result<(String, Vec<Value>)> {
    validate_identifier(&ir.table)?;

    let mut w = SqlWriter::new(dialect);
    w.push_str("DELETE FROM ");
    w.push_identifier(&ir.table);

    if let Some(filter) = &ir.filter {
        w.push_str(" WHERE ");
        compile_filter(&mut w, filter)?;
    }

    if !ir.returning.is_empty() && dialect.supports_returning() {
        w.push_str(" RETURNING ");
        for (i, col) in ir.returning.iter().enumerate() {
            if i > 0 {
                w.push_str(", ");
            }
            w.push_identifier(col);
        }
    }

    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expression, FilterNode, ArithOp};

    #[test]
    fn s2_atomic_increment_sqlite() {
        let mut ir = Ir::update("posts", vec![(
            "views".into(),
            UpdateValue::Expr(Expression::BinOp(
                ArithOp::Add,
                Box::new(Expression::Column("views".into())),
                Box::new(Expression::Literal(Value::I64(1))),
            )),
        )]);
        ir.filter = Some(FilterNode::eq("id", 42i64));

        let (sql, params) = build_update(&ir, Dialect::Sqlite).unwrap();
        assert_eq!(sql, "UPDATE \"posts\" SET \"views\" = \"views\" + ? WHERE \"id\" = ?");
        assert_eq!(params, vec![Value::I64(1), Value::I64(42)]);
    }

    #[test]
    fn s3_bulk_insert_with_returning_postgres() {
        let ir = Ir::insert("users", vec![
            vec![("name".into(), Value::Text("A".into())), ("age".into(), Value::I64(1))],
            vec![("name".into(), Value::Text("B".into())), ("age".into(), Value::I64(2))],
        ]);
        let mut ir = ir;
        ir.returning = vec!["id".into()];

        let (sql, params) = build_insert(&ir, Dialect::Postgres).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES ($1, $2), ($3, $4) RETURNING \"id\""
        );
        assert_eq!(params, vec![Value::Text("A".into()), Value::I64(1), Value::Text("B".into()), Value::I64(2)]);
    }

    #[test]
    fn empty_bulk_insert_is_usage_error() {
        let ir = Ir::insert("users", vec![]);
        let err = build_insert(&ir, Dialect::Postgres).unwrap_err();
        assert_eq!(err.kind(), "USAGE");
    }

    #[test]
    fn mysql_insert_has_no_returning_clause() {
        let mut ir = Ir::insert("users", vec![vec![("name".into(), Value::Text("A".into()))]]);
        ir.returning = vec!["id".into()];
        let (sql, _) = build_insert(&ir, Dialect::MySql).unwrap();
        assert!(!sql.contains("RETURNING"));
    }
}

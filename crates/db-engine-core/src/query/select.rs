//! Compiles a SELECT-shaped `Ir` to SQL.
//!
//! Grounded in `ouroboros-postgres::query::select::build_select`, restated
//! against the `Ir` record instead of a `QueryBuilder` fluent state, and
//! extended with dialect-dependent `UNION`/locking emission.

use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use crate::ir::{Ir, JoinType, Locking, OrderDirection};
use crate::query::expr::compile_expression;
use crate::query::filter::compile_filter;
use crate::query::helpers::validate_identifier;
use crate::query::writer::SqlWriter;
use crate::value::Value;

pub fn build_select(ir: &Ir, dialect: Dialect) -> Result<(String, Vec<Value>)> {
    validate_identifier(&ir.table)?;
    if let Some(limit) = ir.limit {
        if limit < 0 {
            return Err(DbError::usage("limit must not be negative"));
        }
    }
    if let Some(offset) = ir.offset {
        if offset < 0 {
            return Err(DbError::usage("offset must not be negative"));
        }
    }

    let mut w = SqlWriter::new(dialect);
    w.push_str("SELECT ");
    if ir.distinct {
        w.push_str("DISTINCT ");
    }

    write_projection(&mut w, ir)?;

    w.push_str(" FROM ");
    w.push_identifier(&ir.table);

    for join in &ir.joins {
        validate_identifier(&join.table)?;
        w.push_str(match join.join_type {
            JoinType::Inner => " INNER JOIN ",
            JoinType::Left => " LEFT JOIN ",
            JoinType::Right => " RIGHT JOIN ",
            JoinType::Full => " FULL JOIN ",
        });
        w.push_identifier(&join.table);
        if let Some(alias) = &join.alias {
            w.push_str(" AS ");
            w.push_identifier(alias);
        }
        w.push_str(" ON ");
        compile_filter(&mut w, &join.on)?;
    }

    if let Some(filter) = &ir.filter {
        w.push_str(" WHERE ");
        compile_filter(&mut w, filter)?;
    }

    if !ir.group_by.is_empty() {
        w.push_str(" GROUP BY ");
        for (i, col) in ir.group_by.iter().enumerate() {
            if i > 0 {
                w.push_str(", ");
            }
            w.push_identifier(col);
        }
    }

    if let Some(having) = &ir.having {
        w.push_str(" HAVING ");
        compile_filter(&mut w, having)?;
    }

    if !ir.order_by.is_empty() {
        w.push_str(" ORDER BY ");
        for (i, term) in ir.order_by.iter().enumerate() {
            if i > 0 {
                w.push_str(", ");
            }
            w.push_identifier(&term.column);
            w.push_str(match term.direction {
                OrderDirection::Asc => " ASC",
                OrderDirection::Desc => " DESC",
            });
            if let Some(nulls) = term.nulls {
                w.push_str(match nulls {
                    crate::ir::NullsOrder::First => " NULLS FIRST",
                    crate::ir::NullsOrder::Last => " NULLS LAST",
                });
            }
        }
    }

    if let Some(limit) = ir.limit {
        w.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = ir.offset {
        w.push_str(&format!(" OFFSET {offset}"));
    }

    match ir.locking {
        Locking::None => {}
        Locking::ForUpdate => {
            if dialect.supports_row_locking() {
                w.push_str(" FOR UPDATE");
            }
        }
        Locking::ForShare => {
            if dialect.supports_row_locking() {
                w.push_str(match dialect {
                    Dialect::MySql => " LOCK IN SHARE MODE",
                    _ => " FOR SHARE",
                });
            }
        }
    }

    for (other, distinct) in &ir.unions {
        w.push_str(if *distinct { " UNION " } else { " UNION ALL " });
        let (sub_sql, sub_params) = build_select(other, dialect)?;
        let offset = w.params.len();
        w.push_str(&rebase_placeholders(&sub_sql, dialect, offset));
        w.params.extend(sub_params);
    }

    Ok(w.finish())
}

fn write_projection(w: &mut SqlWriter, ir: &Ir) -> Result<()> {
    let mut wrote_any = false;

    match &ir.columns {
        None if ir.annotations.is_empty() => {
            w.push_str("*");
            return Ok(());
        }
        None => {}
        Some(cols) => {
            for col in cols {
                if wrote_any {
                    w.push_str(", ");
                }
                w.push_identifier(col);
                wrote_any = true;
            }
        }
    }

    for (name, expr) in &ir.annotations {
        if wrote_any {
            w.push_str(", ");
        }
        compile_expression(w, expr)?;
        w.push_str(" AS ");
        w.push_identifier(name);
        wrote_any = true;
    }

    if !wrote_any {
        w.push_str("*");
    }
    Ok(())
}

/// Renumbers `$N` placeholders in a Postgres subquery fragment by `offset`
/// so they merge correctly into the enclosing query's parameter vector.
/// SQLite/MySQL use positional `?` and need no renumbering.
///
/// Grounded in `ouroboros-postgres::query::helpers::adjust_param_indices`.
pub fn rebase_placeholders(sql: &str, dialect: Dialect, offset: usize) -> String {
    if offset == 0 || !matches!(dialect, Dialect::Postgres) {
        return sql.to_string();
    }

    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            let mut digits = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() {
                    digits.push(chars.next().unwrap());
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                result.push('$');
            } else {
                let n: usize = digits.parse().unwrap_or(0);
                result.push('$');
                result.push_str(&(n + offset).to_string());
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FilterNode, FilterOp, Operand, OrderByTerm};
    use crate::value::Value;

    #[test]
    fn s1_filter_compilation_postgres() {
        let mut ir = Ir::select("users");
        ir.columns = Some(vec!["id".into(), "name".into()]);
        ir.filter = Some(FilterNode::and(vec![
            FilterNode::Condition { field: "age".into(), op: FilterOp::Gte, operand: Operand::Value(Value::I64(18)) },
            FilterNode::or(vec![
                FilterNode::eq("status", "active"),
                FilterNode::eq("role", "admin"),
            ]),
        ]));
        ir.order_by = vec![OrderByTerm { column: "created_at".into(), direction: OrderDirection::Desc, nulls: None }];
        ir.limit = Some(10);

        let (sql, params) = build_select(&ir, Dialect::Postgres).unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE \"age\" >= $1 AND (\"status\" = $2 OR \"role\" = $3) ORDER BY \"created_at\" DESC LIMIT 10"
        );
        assert_eq!(params, vec![Value::I64(18), Value::Text("active".into()), Value::Text("admin".into())]);
    }

    #[test]
    fn s6_empty_in_returns_constant_false() {
        let mut ir = Ir::select("accounts");
        ir.filter = Some(FilterNode::Condition {
            field: "status".into(),
            op: FilterOp::In,
            operand: Operand::Values(vec![]),
        });
        let (sql, _) = build_select(&ir, Dialect::Postgres).unwrap();
        assert!(sql.contains("WHERE 1 = 0"));
    }

    #[test]
    fn rejects_negative_limit() {
        let mut ir = Ir::select("users");
        ir.limit = Some(-1);
        assert!(build_select(&ir, Dialect::Postgres).is_err());
    }

    #[test]
    fn default_projection_is_star() {
        let ir = Ir::select("users");
        let (sql, _) = build_select(&ir, Dialect::Postgres).unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\"");
    }
}

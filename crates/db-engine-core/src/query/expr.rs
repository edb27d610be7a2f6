//! Lowers an `Expression` to SQL text against a `SqlWriter`.
//!
//! Grounded in `ouroboros-postgres::query::helpers::build_aggregate_sql`
//! and the CTE/subquery param-merging logic in the same module, adapted to
//! this crate's `Expression` sum type (`Column`, `Literal`, `BinOp`,
//! `Aggregate`, `ScalarFn`, `RawFragment`) instead of a fluent-builder
//! aggregate helper.

use crate::error::{DbError, Result};
use crate::ir::{AggregateKind, ArithOp, Expression, ScalarFn};
use crate::query::writer::SqlWriter;

pub fn compile_expression(w: &mut SqlWriter, expr: &Expression) -> Result<()> {
    match expr {
        Expression::Column(name) => {
            w.push_identifier(name);
            Ok(())
        }
        Expression::Literal(value) => {
            w.push_param(value.clone());
            Ok(())
        }
        Expression::BinOp(op, lhs, rhs) => {
            compile_binop_operand(w, lhs)?;
            w.push_str(arith_op_sql(*op));
            compile_binop_operand(w, rhs)?;
            Ok(())
        }
        Expression::Aggregate { kind, column, distinct } => {
            let func = aggregate_func_name(*kind);
            w.push_str(func);
            w.push_str("(");
            if *distinct {
                w.push_str("DISTINCT ");
            }
            if *kind == AggregateKind::Count && column == "*" {
                w.push_str("*");
            } else {
                w.push_identifier(column);
            }
            w.push_str(")");
            Ok(())
        }
        Expression::ScalarFnCall(func, args) => {
            if args.is_empty() {
                return Err(DbError::build(format!("{func:?} requires at least one argument")));
            }
            match func {
                ScalarFn::Concat => {
                    let dialect = w.dialect;
                    let mut rendered = Vec::with_capacity(args.len());
                    for arg in args {
                        let mut sub = SqlWriter::new(dialect);
                        sub.params = std::mem::take(&mut w.params);
                        compile_expression(&mut sub, arg)?;
                        w.params = sub.params;
                        rendered.push(sub.sql);
                    }
                    w.push_str(&dialect.concat_sql(&rendered));
                }
                ScalarFn::Coalesce => {
                    w.push_str("COALESCE(");
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            w.push_str(", ");
                        }
                        compile_expression(w, arg)?;
                    }
                    w.push_str(")");
                }
            }
            Ok(())
        }
        Expression::RawFragment(text) => {
            w.push_str(text);
            Ok(())
        }
    }
}

/// Wraps a `BinOp` operand in parens only when it is itself a `BinOp`, so a
/// lone arithmetic expression (the atomic-increment pattern) renders
/// without redundant parens while nested trees keep their shape.
fn compile_binop_operand(w: &mut SqlWriter, expr: &Expression) -> Result<()> {
    if matches!(expr, Expression::BinOp(..)) {
        w.push_str("(");
        compile_expression(w, expr)?;
        w.push_str(")");
        Ok(())
    } else {
        compile_expression(w, expr)
    }
}

fn arith_op_sql(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => " + ",
        ArithOp::Sub => " - ",
        ArithOp::Mul => " * ",
        ArithOp::Div => " / ",
    }
}

fn aggregate_func_name(kind: AggregateKind) -> &'static str {
    match kind {
        AggregateKind::Count => "COUNT",
        AggregateKind::Sum => "SUM",
        AggregateKind::Avg => "AVG",
        AggregateKind::Max => "MAX",
        AggregateKind::Min => "MIN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::value::Value;

    #[test]
    fn binop_preserves_tree_shape_with_parens() {
        let expr = Expression::BinOp(
            ArithOp::Add,
            Box::new(Expression::Column("views".into())),
            Box::new(Expression::Literal(Value::I64(1))),
        );
        let mut w = SqlWriter::new(Dialect::Postgres);
        compile_expression(&mut w, &expr).unwrap();
        let (sql, params) = w.finish();
        assert_eq!(sql, "\"views\" + $1");
        assert_eq!(params, vec![Value::I64(1)]);
    }

    #[test]
    fn nested_binop_keeps_parens_for_precedence() {
        let expr = Expression::BinOp(
            ArithOp::Mul,
            Box::new(Expression::BinOp(
                ArithOp::Add,
                Box::new(Expression::Column("a".into())),
                Box::new(Expression::Column("b".into())),
            )),
            Box::new(Expression::Column("c".into())),
        );
        let mut w = SqlWriter::new(Dialect::Postgres);
        compile_expression(&mut w, &expr).unwrap();
        assert_eq!(w.sql, "(\"a\" + \"b\") * \"c\"");
    }

    #[test]
    fn count_star_is_special_cased() {
        let expr = Expression::Aggregate { kind: AggregateKind::Count, column: "*".into(), distinct: false };
        let mut w = SqlWriter::new(Dialect::Postgres);
        compile_expression(&mut w, &expr).unwrap();
        assert_eq!(w.sql, "COUNT(*)");
    }

    #[test]
    fn concat_differs_by_dialect() {
        let expr = Expression::ScalarFnCall(
            ScalarFn::Concat,
            vec![Expression::Column("first".into()), Expression::Column("last".into())],
        );

        let mut pg = SqlWriter::new(Dialect::Postgres);
        compile_expression(&mut pg, &expr).unwrap();
        assert_eq!(pg.sql, "CONCAT(\"first\", \"last\")");

        let mut sqlite = SqlWriter::new(Dialect::Sqlite);
        compile_expression(&mut sqlite, &expr).unwrap();
        assert_eq!(sqlite.sql, "\"first\" || \"last\"");
    }
}

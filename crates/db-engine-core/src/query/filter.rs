//! Lowers a `FilterNode` tree to SQL text against a `SqlWriter`.
//!
//! Grounded in `ouroboros-postgres::query::select::build_where_condition`,
//! generalised over dialect and extended with operators its `Operator` enum
//! did not have: `between`, `contains`, `icontains`, `startswith`,
//! `istartswith`, `endswith`, `iendswith`, `iexact`, `year`, `month`, `day`.

use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use crate::ir::{FilterNode, FilterOp, Operand};
use crate::query::expr::compile_expression;
use crate::query::writer::SqlWriter;
use crate::value::Value;

pub fn compile_filter(w: &mut SqlWriter, node: &FilterNode) -> Result<()> {
    match node {
        FilterNode::Condition { field, op, operand } => compile_condition(w, field, *op, operand),
        FilterNode::And(children) => compile_conjunction(w, children, "AND"),
        FilterNode::Or(children) => compile_conjunction(w, children, "OR"),
        FilterNode::Not(child) => {
            w.push_str("NOT (");
            compile_filter(w, child)?;
            w.push_str(")");
            Ok(())
        }
    }
}

fn compile_conjunction(w: &mut SqlWriter, children: &[FilterNode], joiner: &str) -> Result<()> {
    if children.is_empty() {
        return Err(DbError::build(format!("{joiner} requires at least one child filter")));
    }
    if children.len() == 1 {
        return compile_filter(w, &children[0]);
    }

    w.push_str("(");
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            w.push_str(&format!(" {joiner} "));
        }
        compile_filter(w, child)?;
    }
    w.push_str(")");
    Ok(())
}

fn single_value(operand: &Operand, op: FilterOp) -> Result<Value> {
    match operand {
        Operand::Value(v) => Ok(v.clone()),
        Operand::Values(_) => Err(DbError::build(format!("{op:?} does not accept a value list"))),
        Operand::Expr(_) => Err(DbError::build(format!("{op:?} does not accept an expression operand here"))),
    }
}

fn value_list(operand: &Operand, op: FilterOp) -> Result<Vec<Value>> {
    match operand {
        Operand::Values(vs) => Ok(vs.clone()),
        Operand::Value(v) => Ok(vec![v.clone()]),
        Operand::Expr(_) => Err(DbError::build(format!("{op:?} does not accept an expression operand"))),
    }
}

fn compile_condition(w: &mut SqlWriter, field: &str, op: FilterOp, operand: &Operand) -> Result<()> {
    match op {
        FilterOp::Eq => compile_binary(w, field, "=", operand, op),
        FilterOp::Ne => compile_binary(w, field, "<>", operand, op),
        FilterOp::Gt => compile_binary(w, field, ">", operand, op),
        FilterOp::Gte => compile_binary(w, field, ">=", operand, op),
        FilterOp::Lt => compile_binary(w, field, "<", operand, op),
        FilterOp::Lte => compile_binary(w, field, "<=", operand, op),

        FilterOp::In => {
            let values = value_list(operand, op)?;
            if values.is_empty() {
                // Empty IN compiles to a constant-false predicate
                // rather than invalid SQL, so the surrounding query still
                // returns the empty set safely.
                w.push_str("1 = 0");
                return Ok(());
            }
            w.push_identifier(field);
            w.push_str(" IN (");
            for (i, v) in values.into_iter().enumerate() {
                if i > 0 {
                    w.push_str(", ");
                }
                w.push_param(v);
            }
            w.push_str(")");
            Ok(())
        }

        FilterOp::Between => {
            let values = value_list(operand, op)?;
            if values.len() != 2 {
                return Err(DbError::build("between requires exactly two values"));
            }
            let mut it = values.into_iter();
            let lo = it.next().unwrap();
            let hi = it.next().unwrap();
            w.push_identifier(field);
            w.push_str(" BETWEEN ");
            w.push_param(lo);
            w.push_str(" AND ");
            w.push_param(hi);
            Ok(())
        }

        FilterOp::IsNull => {
            let v = single_value(operand, op)?;
            let negate = matches!(v, Value::Bool(false));
            w.push_identifier(field);
            w.push_str(if negate { " IS NOT NULL" } else { " IS NULL" });
            Ok(())
        }

        FilterOp::Contains => compile_like(w, field, operand, op, LikePattern::Contains, false),
        FilterOp::IContains => compile_like(w, field, operand, op, LikePattern::Contains, true),
        FilterOp::StartsWith => compile_like(w, field, operand, op, LikePattern::Prefix, false),
        FilterOp::IStartsWith => compile_like(w, field, operand, op, LikePattern::Prefix, true),
        FilterOp::EndsWith => compile_like(w, field, operand, op, LikePattern::Suffix, false),
        FilterOp::IEndsWith => compile_like(w, field, operand, op, LikePattern::Suffix, true),
        FilterOp::IExact => compile_iexact(w, field, operand, op),

        FilterOp::Year => compile_date_part(w, field, operand, op, DatePart::Year),
        FilterOp::Month => compile_date_part(w, field, operand, op, DatePart::Month),
        FilterOp::Day => compile_date_part(w, field, operand, op, DatePart::Day),
    }
}

fn compile_binary(w: &mut SqlWriter, field: &str, sql_op: &str, operand: &Operand, op: FilterOp) -> Result<()> {
    w.push_identifier(field);
    w.push_str(&format!(" {sql_op} "));
    match operand {
        Operand::Value(v) => {
            w.push_param(v.clone());
        }
        Operand::Expr(expr) => {
            compile_expression(w, expr)?;
        }
        Operand::Values(_) => return Err(DbError::build(format!("{op:?} does not accept a value list"))),
    }
    Ok(())
}

enum LikePattern {
    Contains,
    Prefix,
    Suffix,
}

fn like_pattern(kind: &LikePattern, text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    match kind {
        LikePattern::Contains => format!("%{escaped}%"),
        LikePattern::Prefix => format!("{escaped}%"),
        LikePattern::Suffix => format!("%{escaped}"),
    }
}

fn compile_like(
    w: &mut SqlWriter,
    field: &str,
    operand: &Operand,
    op: FilterOp,
    kind: LikePattern,
    case_insensitive: bool,
) -> Result<()> {
    let v = single_value(operand, op)?;
    let text = match &v {
        Value::Text(s) => s.clone(),
        other => return Err(DbError::build(format!("{op:?} requires a text value, got {other:?}"))),
    };
    let pattern = like_pattern(&kind, &text);

    if case_insensitive {
        match w.dialect {
            Dialect::Postgres => {
                w.push_identifier(field);
                w.push_str(" ILIKE ");
                w.push_param(Value::Text(pattern));
            }
            Dialect::Sqlite | Dialect::MySql => {
                w.push_str("LOWER(");
                w.push_identifier(field);
                w.push_str(") LIKE LOWER(");
                w.push_param(Value::Text(pattern));
                w.push_str(")");
            }
        }
    } else {
        w.push_identifier(field);
        w.push_str(" LIKE ");
        w.push_param(Value::Text(pattern));
    }
    Ok(())
}

fn compile_iexact(w: &mut SqlWriter, field: &str, operand: &Operand, op: FilterOp) -> Result<()> {
    let v = single_value(operand, op)?;
    let text = match &v {
        Value::Text(s) => s.clone(),
        other => return Err(DbError::build(format!("iexact requires a text value, got {other:?}"))),
    };

    match w.dialect {
        Dialect::Postgres => {
            w.push_identifier(field);
            w.push_str(" ILIKE ");
            w.push_param(Value::Text(text));
        }
        Dialect::Sqlite | Dialect::MySql => {
            w.push_str("LOWER(");
            w.push_identifier(field);
            w.push_str(") = LOWER(");
            w.push_param(Value::Text(text));
            w.push_str(")");
        }
    }
    Ok(())
}

enum DatePart {
    Year,
    Month,
    Day,
}

fn compile_date_part(w: &mut SqlWriter, field: &str, operand: &Operand, op: FilterOp, part: DatePart) -> Result<()> {
    // A tuple of values for month/day means "equal on all given parts",
    // evaluated as the conjunction of per-part equalities; a single value
    // is the common case of a single equality.
    let values = value_list(operand, op)?;
    if values.is_empty() {
        return Err(DbError::build(format!("{op:?} requires at least one value")));
    }

    let multi = values.len() > 1;
    if multi {
        w.push_str("(");
    }
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            w.push_str(" AND ");
        }
        compile_single_date_part(w, field, &part, v)?;
    }
    if multi {
        w.push_str(")");
    }
    Ok(())
}

fn compile_single_date_part(w: &mut SqlWriter, field: &str, part: &DatePart, value: Value) -> Result<()> {
    match w.dialect {
        Dialect::Postgres => {
            let field_name = match part {
                DatePart::Year => "YEAR",
                DatePart::Month => "MONTH",
                DatePart::Day => "DAY",
            };
            w.push_str("EXTRACT(");
            w.push_str(field_name);
            w.push_str(" FROM ");
            w.push_identifier(field);
            w.push_str(") = ");
            w.push_param(value);
        }
        Dialect::Sqlite => {
            let fmt = match part {
                DatePart::Year => "%Y",
                DatePart::Month => "%m",
                DatePart::Day => "%d",
            };
            w.push_str(&format!("CAST(STRFTIME('{fmt}', "));
            w.push_identifier(field);
            w.push_str(") AS INTEGER) = ");
            w.push_param(value);
        }
        Dialect::MySql => {
            let func = match part {
                DatePart::Year => "YEAR",
                DatePart::Month => "MONTH",
                DatePart::Day => "DAY",
            };
            w.push_str(func);
            w.push_str("(");
            w.push_identifier(field);
            w.push_str(") = ");
            w.push_param(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FilterNode;

    fn filter_sql(dialect: Dialect, node: &FilterNode) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new(dialect);
        compile_filter(&mut w, node).unwrap();
        w.finish()
    }

    #[test]
    fn empty_in_is_constant_false() {
        let node = FilterNode::Condition {
            field: "status".into(),
            op: FilterOp::In,
            operand: Operand::Values(vec![]),
        };
        let (sql, params) = filter_sql(Dialect::Postgres, &node);
        assert_eq!(sql, "1 = 0");
        assert!(params.is_empty());
    }

    #[test]
    fn icontains_on_mysql_lowercases_both_sides() {
        let node = FilterNode::Condition {
            field: "name".into(),
            op: FilterOp::IContains,
            operand: Operand::Value(Value::Text("oH".into())),
        };
        let (sql, params) = filter_sql(Dialect::MySql, &node);
        assert_eq!(sql, "LOWER(`name`) LIKE LOWER(?)");
        assert_eq!(params, vec![Value::Text("%oH%".into())]);
    }

    #[test]
    fn icontains_on_postgres_uses_ilike() {
        let node = FilterNode::Condition {
            field: "name".into(),
            op: FilterOp::IContains,
            operand: Operand::Value(Value::Text("oh".into())),
        };
        let (sql, _) = filter_sql(Dialect::Postgres, &node);
        assert_eq!(sql, "\"name\" ILIKE $1");
    }

    #[test]
    fn between_requires_exactly_two_values() {
        let node = FilterNode::Condition {
            field: "age".into(),
            op: FilterOp::Between,
            operand: Operand::Values(vec![Value::I64(1)]),
        };
        let mut w = SqlWriter::new(Dialect::Postgres);
        assert!(compile_filter(&mut w, &node).is_err());
    }

    #[test]
    fn isnull_false_negates() {
        let node = FilterNode::Condition {
            field: "deleted_at".into(),
            op: FilterOp::IsNull,
            operand: Operand::Value(Value::Bool(false)),
        };
        let (sql, _) = filter_sql(Dialect::Postgres, &node);
        assert_eq!(sql, "\"deleted_at\" IS NOT NULL");
    }

    #[test]
    fn multi_part_month_filter_is_balanced() {
        let node = FilterNode::Condition {
            field: "x".into(),
            op: FilterOp::Month,
            operand: Operand::Values(vec![Value::I64(1), Value::I64(6)]),
        };
        let (sql, params) = filter_sql(Dialect::MySql, &node);
        assert_eq!(sql, "(MONTH(`x`) = ? AND MONTH(`x`) = ?)");
        assert_eq!(params, vec![Value::I64(1), Value::I64(6)]);
    }
}

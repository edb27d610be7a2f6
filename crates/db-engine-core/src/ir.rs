//! The Intermediate Representation: a tagged, dialect-neutral query
//! description consumed by the SQL Builder.
//!
//! Grounded in `ouroboros-postgres::query::builder::QueryBuilder` and
//! `ouroboros-postgres::query::types`, reshaped from a mutable fluent
//! builder into a single declarative record matching the data model in
//! the data model. The fluent builder style is kept one layer down,
//! as the internal compilation engine (see `query::select`/`query::modify`).

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Raw,
    Explain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderByTerm {
    pub column: String,
    pub direction: OrderDirection,
    pub nulls: Option<NullsOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: Option<String>,
    pub on: FilterNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefetch {
    pub name: String,
    pub table: String,
    pub foreign_key: String,
    pub reference_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locking {
    None,
    ForUpdate,
    ForShare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// The FilterNode operator vocabulary, exactly the set named by the
/// specification's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Between,
    IsNull,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IExact,
    Year,
    Month,
    Day,
}

/// A value or Expression operand for a `Condition`. Most operators take a
/// scalar or a small list of scalars (`in`, `between`); an operand may also
/// be an Expression to support column-to-column comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operand {
    Value(Value),
    Values(Vec<Value>),
    Expr(Box<Expression>),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

/// Recursive boolean filter tree used for both `WHERE` and `HAVING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterNode {
    Condition {
        field: String,
        op: FilterOp,
        operand: Operand,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

impl FilterNode {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterNode::Condition {
            field: field.into(),
            op: FilterOp::Eq,
            operand: Operand::Value(value.into()),
        }
    }

    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::And(children)
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Or(children)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarFn {
    Concat,
    Coalesce,
}

/// Recursive sum type for projected/computed values, per the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expression {
    Column(String),
    Literal(Value),
    BinOp(ArithOp, Box<Expression>, Box<Expression>),
    Aggregate {
        kind: AggregateKind,
        column: String,
        distinct: bool,
    },
    ScalarFnCall(ScalarFn, Vec<Expression>),
    /// Trusted SQL text, inlined verbatim. MUST NOT contain user input.
    RawFragment(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateValue {
    Value(Value),
    Expr(Expression),
}

/// The full query description: a tagged record compiled by the SQL Builder
/// into dialect-correct SQL text and an ordered parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ir {
    pub operation: Operation,
    pub table: String,
    /// `None` means project `*`.
    pub columns: Option<Vec<String>>,
    pub filter: Option<FilterNode>,
    pub order_by: Vec<OrderByTerm>,
    pub group_by: Vec<String>,
    pub having: Option<FilterNode>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub joins: Vec<Join>,
    pub prefetches: Vec<Prefetch>,
    pub annotations: Vec<(String, Expression)>,
    /// INSERT: ordered rows of (column, value). UPDATE: column -> Expression.
    pub insert_values: Vec<Vec<(String, Value)>>,
    pub update_values: Vec<(String, UpdateValue)>,
    pub unions: Vec<(Box<Ir>, bool)>,
    pub locking: Locking,
    pub distinct: bool,
    pub returning: Vec<String>,
    pub raw: Option<RawQuery>,
    /// Only consulted when `operation == Explain`. Requests `EXPLAIN ANALYZE`
    /// (Postgres) instead of a plan-only `EXPLAIN`; ignored on SQLite/MySQL,
    /// which have no analyze-mode distinct from their plan-only form.
    #[serde(default)]
    pub explain_analyze: bool,
}

impl Ir {
    /// A bare SELECT * FROM `table` with no filter, ordering, or limit.
    pub fn select(table: impl Into<String>) -> Self {
        Ir {
            operation: Operation::Select,
            table: table.into(),
            columns: None,
            filter: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            having: None,
            limit: None,
            offset: None,
            joins: Vec::new(),
            prefetches: Vec::new(),
            annotations: Vec::new(),
            insert_values: Vec::new(),
            update_values: Vec::new(),
            unions: Vec::new(),
            locking: Locking::None,
            distinct: false,
            returning: Vec::new(),
            raw: None,
            explain_analyze: false,
        }
    }

    pub fn insert(table: impl Into<String>, rows: Vec<Vec<(String, Value)>>) -> Self {
        Ir {
            operation: Operation::Insert,
            insert_values: rows,
            ..Ir::select(table)
        }
    }

    pub fn update(table: impl Into<String>, values: Vec<(String, UpdateValue)>) -> Self {
        Ir {
            operation: Operation::Update,
            update_values: values,
            ..Ir::select(table)
        }
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Ir {
            operation: Operation::Delete,
            ..Ir::select(table)
        }
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Ir {
            operation: Operation::Raw,
            raw: Some(RawQuery { sql: sql.into(), params }),
            ..Ir::select(String::new())
        }
    }
}

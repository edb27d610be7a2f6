//! The tagged scalar `Value` domain shared by the IR, the Hydrator, and the Codec.
//!
//! Grounded in `ouroboros-postgres::types::ExtractedValue`, narrowed to the
//! domain actually named by the data model: the grounding repo's separate
//! `SmallInt`/`Int`/`BigInt`/`Float`/`Double` variants collapse to `I64`/`F64`,
//! and `Decimal` carries its string form rather than `rust_decimal::Decimal`
//! so a round trip through the wire codec never loses precision.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v")]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    /// String-encoded decimal, e.g. `"12.50"`. Never parsed to a float
    /// internally — the engine treats it as an opaque numeric string and
    /// leaves precision-sensitive arithmetic to the backend.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value the way it would appear if naively interpolated
    /// into SQL text. Used only by the value-injection-safety tests
    /// to assert this never actually happens in generated SQL.
    pub fn naive_render(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I64(i) => i.to_string(),
            Value::F64(f) => f.to_string(),
            Value::Decimal(d) => d.clone(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("{b:?}"),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Date(d) => d.to_string(),
            Value::Uuid(u) => u.to_string(),
            Value::Json(j) => j.to_string(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_distinguishable() {
        assert!(Value::Null.is_null());
        assert!(!Value::I64(0).is_null());
    }

    #[test]
    fn decimal_round_trips_as_string_not_float() {
        let v = Value::Decimal("19.995".to_string());
        match v {
            Value::Decimal(s) => assert_eq!(s, "19.995"),
            _ => panic!("expected Decimal"),
        }
    }
}

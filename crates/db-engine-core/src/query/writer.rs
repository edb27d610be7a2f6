//! Accumulates SQL text and an ordered parameter vector while compiling.
//!
//! Placeholders are written in the dialect's own convention as soon as a
//! parameter is pushed, so the resulting text and parameter vector are
//! always in lock-step.

use crate::dialect::Dialect;
use crate::value::Value;

pub struct SqlWriter {
    pub dialect: Dialect,
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlWriter {
    pub fn new(dialect: Dialect) -> Self {
        SqlWriter { dialect, sql: String::new(), params: Vec::new() }
    }

    pub fn push_str(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    pub fn push_identifier(&mut self, name: &str) {
        self.sql.push_str(&self.dialect.quote_identifier(name));
    }

    /// Appends a parameter and writes its placeholder at the current
    /// position. Returns the 1-based placeholder position.
    pub fn push_param(&mut self, value: Value) -> usize {
        self.params.push(value);
        let position = self.params.len();
        self.dialect.write_placeholder(&mut self.sql, position);
        position
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_placeholders_track_param_count() {
        let mut w = SqlWriter::new(Dialect::Postgres);
        w.push_str("a = ");
        w.push_param(Value::I64(1));
        w.push_str(" AND b = ");
        w.push_param(Value::I64(2));
        let (sql, params) = w.finish();
        assert_eq!(sql, "a = $1 AND b = $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn sqlite_placeholders_are_positional_marks() {
        let mut w = SqlWriter::new(Dialect::Sqlite);
        w.push_param(Value::I64(1));
        w.push_param(Value::I64(2));
        let (sql, _) = w.finish();
        assert_eq!(sql, "??");
    }
}

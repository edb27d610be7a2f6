//! The Hydrator: turns raw `sqlx` rows into rows of named `Value`s, with
//! dialect-specific type-name matching.
//!
//! Grounded in `ouroboros-postgres::types::row_to_extracted`, generalised
//! to SQLite and MySQL row types and narrowed onto this crate's `Value`
//! domain. Unlike the grounding repo, a failure here carries both the
//! column name *and* the row's position in the result set, since a batch
//! hydration failure needs to say which row broke.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::value::Value;

macro_rules! extract {
    ($row:expr, $idx:expr, $name:expr, $row_index:expr, $ty:ty) => {
        match $row.try_get::<Option<$ty>, _>($idx) {
            Ok(opt) => opt,
            Err(e) => {
                return Err(DbError::hydration($name, $row_index, e.to_string()));
            }
        }
    };
}

/// Hydrates a full Postgres result set into `(column names, rows of Value)`.
pub fn hydrate_postgres_rows(rows: &[sqlx::postgres::PgRow]) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let columns = column_names(rows.first());
    let mut out = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        out.push(hydrate_postgres_row(row, row_index)?);
    }
    Ok((columns, out))
}

pub fn hydrate_sqlite_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let columns = column_names(rows.first());
    let mut out = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        out.push(hydrate_sqlite_row(row, row_index)?);
    }
    Ok((columns, out))
}

pub fn hydrate_mysql_rows(rows: &[sqlx::mysql::MySqlRow]) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let columns = column_names(rows.first());
    let mut out = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        out.push(hydrate_mysql_row(row, row_index)?);
    }
    Ok((columns, out))
}

fn column_names<R: SqlxRow>(row: Option<&R>) -> Vec<String> {
    row.map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default()
}

fn hydrate_postgres_row(row: &sqlx::postgres::PgRow, row_index: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();
        let value: Option<Value> = match type_name {
            "BOOL" => extract!(row, idx, name, row_index, bool).map(Value::Bool),
            "INT2" => extract!(row, idx, name, row_index, i16).map(|v| Value::I64(v as i64)),
            "INT4" => extract!(row, idx, name, row_index, i32).map(|v| Value::I64(v as i64)),
            "INT8" => extract!(row, idx, name, row_index, i64).map(Value::I64),
            "FLOAT4" => extract!(row, idx, name, row_index, f32).map(|v| Value::F64(v as f64)),
            "FLOAT8" => extract!(row, idx, name, row_index, f64).map(Value::F64),
            "NUMERIC" => extract!(row, idx, name, row_index, Decimal).map(|v| Value::Decimal(v.to_string())),
            "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" => {
                extract!(row, idx, name, row_index, String).map(Value::Text)
            }
            "BYTEA" => extract!(row, idx, name, row_index, Vec<u8>).map(Value::Bytes),
            "UUID" => extract!(row, idx, name, row_index, Uuid).map(Value::Uuid),
            "DATE" => extract!(row, idx, name, row_index, NaiveDate).map(Value::Date),
            "TIMESTAMPTZ" => extract!(row, idx, name, row_index, DateTime<Utc>).map(Value::Timestamp),
            "TIMESTAMP" => extract!(row, idx, name, row_index, chrono::NaiveDateTime)
                .map(|v| Value::Timestamp(DateTime::<Utc>::from_naive_utc_and_offset(v, Utc))),
            "JSON" | "JSONB" => extract!(row, idx, name, row_index, JsonValue).map(Value::Json),
            other => {
                return Err(DbError::hydration(
                    name,
                    row_index,
                    format!("unsupported postgres column type '{other}'"),
                ))
            }
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

fn hydrate_sqlite_row(row: &sqlx::sqlite::SqliteRow, row_index: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();
        let value: Option<Value> = match type_name {
            "BOOLEAN" => extract!(row, idx, name, row_index, bool).map(Value::Bool),
            "INTEGER" => extract!(row, idx, name, row_index, i64).map(Value::I64),
            "REAL" => extract!(row, idx, name, row_index, f64).map(Value::F64),
            "TEXT" => extract!(row, idx, name, row_index, String).map(Value::Text),
            "BLOB" => extract!(row, idx, name, row_index, Vec<u8>).map(Value::Bytes),
            "DATE" => extract!(row, idx, name, row_index, NaiveDate).map(Value::Date),
            "DATETIME" => extract!(row, idx, name, row_index, DateTime<Utc>).map(Value::Timestamp),
            "NULL" => None,
            other => {
                return Err(DbError::hydration(
                    name,
                    row_index,
                    format!("unsupported sqlite column type '{other}'"),
                ))
            }
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

fn hydrate_mysql_row(row: &sqlx::mysql::MySqlRow, row_index: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();
        let value: Option<Value> = match type_name {
            "TINYINT(1)" | "BOOLEAN" => extract!(row, idx, name, row_index, bool).map(Value::Bool),
            "TINYINT" | "SMALLINT" | "INT" | "MEDIUMINT" => {
                extract!(row, idx, name, row_index, i32).map(|v| Value::I64(v as i64))
            }
            "BIGINT" => extract!(row, idx, name, row_index, i64).map(Value::I64),
            "FLOAT" => extract!(row, idx, name, row_index, f32).map(|v| Value::F64(v as f64)),
            "DOUBLE" => extract!(row, idx, name, row_index, f64).map(Value::F64),
            "DECIMAL" => extract!(row, idx, name, row_index, Decimal).map(|v| Value::Decimal(v.to_string())),
            "VARCHAR" | "TEXT" | "CHAR" => extract!(row, idx, name, row_index, String).map(Value::Text),
            "BLOB" | "VARBINARY" | "BINARY" => extract!(row, idx, name, row_index, Vec<u8>).map(Value::Bytes),
            "DATE" => extract!(row, idx, name, row_index, NaiveDate).map(Value::Date),
            "DATETIME" | "TIMESTAMP" => extract!(row, idx, name, row_index, DateTime<Utc>).map(Value::Timestamp),
            "JSON" => extract!(row, idx, name, row_index, JsonValue).map(Value::Json),
            other => {
                return Err(DbError::hydration(
                    name,
                    row_index,
                    format!("unsupported mysql column type '{other}'"),
                ))
            }
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hydration_error_carries_row_index() {
        let err = DbError::hydration("age", 3, "bad int");
        match err {
            DbError::Hydration { column, row_index, .. } => {
                assert_eq!(column, "age");
                assert_eq!(row_index, 3);
            }
            _ => panic!("expected Hydration"),
        }
    }

    #[test]
    fn empty_result_set_has_no_columns() {
        let (columns, rows) = hydrate_postgres_rows(&[]).unwrap();
        assert!(columns.is_empty());
        assert!(rows.is_empty());
    }
}

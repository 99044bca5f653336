use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;

use crate::error::SyncError;

/// The column type domain a table schema can declare. Every column has
/// exactly one of these; reads deserialize to the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Integer,
    Real,
    Boolean,
    Date,
    Object,
    Array,
}

impl ColumnType {
    /// Accepts every alias `defineTable` recognizes and maps it to a single
    /// canonical type.
    pub fn parse(token: &str) -> Result<Self, SyncError> {
        match token {
            "string" | "text" => Ok(ColumnType::String),
            "integer" | "int" => Ok(ColumnType::Integer),
            "real" | "float" => Ok(ColumnType::Real),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "object" => Ok(ColumnType::Object),
            "array" => Ok(ColumnType::Array),
            other => Err(SyncError::validation(format!(
                "unknown column type token '{other}'"
            ))),
        }
    }

    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            ColumnType::String | ColumnType::Object | ColumnType::Array => "TEXT",
            ColumnType::Integer | ColumnType::Boolean | ColumnType::Date => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// A typed scalar value. This is the only boundary the crate crosses between
/// a table's declared schema and the embedded store's untyped columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Object(serde_json::Value),
    Array(serde_json::Value),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Object(v) | Value::Array(v) => write!(f, "{v}"),
        }
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ColumnType::String),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Object(_) => Some(ColumnType::Object),
            Value::Array(_) => Some(ColumnType::Array),
        }
    }

    /// Coerce this value to match a column's declared type, the only
    /// conversion allowed being integer literals into `real` columns.
    /// Coercion only happens at this boundary; storage itself is untyped.
    pub(crate) fn coerce_to(&self, column_type: ColumnType) -> Result<Value, SyncError> {
        Ok(match (column_type, self) {
            (_, Value::Null) => Value::Null,
            (ColumnType::String, Value::String(_)) => self.clone(),
            (ColumnType::Integer, Value::Integer(_)) => self.clone(),
            (ColumnType::Real, Value::Real(_)) => self.clone(),
            (ColumnType::Real, Value::Integer(i)) => Value::Real(*i as f64),
            (ColumnType::Boolean, Value::Boolean(_)) => self.clone(),
            (ColumnType::Date, Value::Date(_)) => self.clone(),
            (ColumnType::Object, Value::Object(_)) => self.clone(),
            (ColumnType::Array, Value::Array(_)) => self.clone(),
            (expected, actual) => {
                return Err(SyncError::validation(format!(
                    "cannot encode {actual:?} into a {expected:?} column"
                )))
            }
        })
    }

    pub(crate) fn decode(column_type: ColumnType, raw: ValueRef<'_>) -> Result<Self, SyncError> {
        if matches!(raw, ValueRef::Null) {
            return Ok(Value::Null);
        }
        Ok(match column_type {
            ColumnType::String => Value::String(raw.as_str()?.to_string()),
            ColumnType::Integer => Value::Integer(raw.as_i64()?),
            ColumnType::Real => Value::Real(match raw {
                ValueRef::Integer(i) => i as f64,
                ValueRef::Real(r) => r,
                other => other.as_f64()?,
            }),
            ColumnType::Boolean => Value::Boolean(raw.as_i64()? != 0),
            ColumnType::Date => {
                let millis = raw.as_i64()?;
                Value::Date(
                    Utc.timestamp_millis_opt(millis)
                        .single()
                        .ok_or_else(|| SyncError::validation("invalid stored date"))?,
                )
            }
            ColumnType::Object => {
                Value::Object(serde_json::from_str(raw.as_str()?)?)
            }
            ColumnType::Array => Value::Array(serde_json::from_str(raw.as_str()?)?),
        })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let sql_value = match self {
            Value::Null => SqlValue::Null,
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Real(r) => SqlValue::Real(*r),
            Value::Boolean(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
            Value::Date(d) => SqlValue::Integer(d.timestamp_millis()),
            Value::Object(v) | Value::Array(v) => SqlValue::Text(v.to_string()),
        };
        Ok(ToSqlOutput::Owned(sql_value))
    }
}

/// A record is a mapping from column name to typed scalar. `BTreeMap` keeps
/// column order deterministic for serialization and logging without pulling
/// in an extra dependency.
pub type Record = BTreeMap<String, Value>;

use crate::error::SyncError;
use crate::value::{ColumnType, Value};

/// A validated primary-key value. String ids compare case-insensitively
/// (NOCASE) everywhere; integer ids do not mix with string ids within a
/// table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Id {
    String(String),
    Integer(i64),
}

impl Id {
    pub fn as_value(&self) -> Value {
        match self {
            Id::String(s) => Value::String(s.clone()),
            Id::Integer(i) => Value::Integer(*i),
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::String(s) => write!(f, "{s}"),
            Id::Integer(i) => write!(f, "{i}"),
        }
    }
}

const FORBIDDEN_CHARS: [char; 6] = ['"', '+', '?', '\\', '/', '`'];

/// Validate a candidate `id` column value per the record-identifier rules:
/// non-empty printable strings (no control characters, none of the
/// forbidden punctuation, and not literally `.` or `..`), or positive
/// integers.
pub fn validate_id(value: &Value) -> Result<Id, SyncError> {
    match value {
        Value::String(s) => {
            validate_string_id(s)?;
            Ok(Id::String(s.clone()))
        }
        Value::Integer(i) => {
            validate_integer_id(*i)?;
            Ok(Id::Integer(*i))
        }
        other => Err(SyncError::validation(format!(
            "id must be a string or integer, got {other:?}"
        ))),
    }
}

pub fn validate_string_id(id: &str) -> Result<(), SyncError> {
    if id.is_empty() {
        return Err(SyncError::validation("id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(SyncError::validation("id must not be '.' or '..'"));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(SyncError::validation("id must not contain control characters"));
    }
    if id.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(SyncError::validation(
            "id must not contain '\"', '+', '?', '\\\\', '/' or '`'",
        ));
    }
    Ok(())
}

pub fn validate_integer_id(id: i64) -> Result<(), SyncError> {
    if id <= 0 {
        return Err(SyncError::validation("integer id must be positive"));
    }
    Ok(())
}

/// Reconstruct a typed id [`Value`] from the string form the operation log
/// stores, using the column's declared type.
pub fn value_from_id_string(id: &str, column_type: ColumnType) -> Result<Value, SyncError> {
    match column_type {
        ColumnType::String => Ok(Value::String(id.to_string())),
        ColumnType::Integer => id
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| SyncError::validation(format!("stored id '{id}' is not a valid integer"))),
        other => Err(SyncError::validation(format!("id column cannot be of type {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_and_forbidden_ids() {
        assert!(validate_string_id("").is_err());
        assert!(validate_string_id(".").is_err());
        assert!(validate_string_id("..").is_err());
        assert!(validate_string_id("a/b").is_err());
        assert!(validate_string_id("a\"b").is_err());
        assert!(validate_string_id("a\u{0007}b").is_err());
        assert!(validate_string_id("perfectly-fine_id.123").is_ok());
    }

    #[test]
    fn rejects_non_positive_integer_ids() {
        assert!(validate_integer_id(0).is_err());
        assert!(validate_integer_id(-1).is_err());
        assert!(validate_integer_id(1).is_ok());
    }
}

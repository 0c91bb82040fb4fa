use std::borrow::Cow;
use std::fmt::Write as _;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_postgres::types::Type;

use crate::error::SqlMiddlewareDbError;

/// Values that can be stored in a database row or used as query parameters.
///
/// ```rust
/// use pg_middleware::prelude::*;
///
/// let params = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// The backend type a value is encoded as when no column type is supplied,
    /// e.g. by `BinaryImporter::write_row`. `None` for NULL.
    #[must_use]
    pub fn default_pg_type(&self) -> Option<Type> {
        match self {
            RowValues::Int(_) => Some(Type::INT8),
            RowValues::Float(_) => Some(Type::FLOAT8),
            RowValues::Text(_) => Some(Type::TEXT),
            RowValues::Bool(_) => Some(Type::BOOL),
            RowValues::Timestamp(_) => Some(Type::TIMESTAMP),
            RowValues::JSON(_) => Some(Type::JSONB),
            RowValues::Blob(_) => Some(Type::BYTEA),
            RowValues::Null => None,
        }
    }
}

/// The conversion "mode".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionMode {
    /// When the converted parameters will be used in a query (SELECT)
    Query,
    /// When the converted parameters will be used for statement execution (INSERT/UPDATE/etc.)
    Execute,
}

/// Convert a slice of `RowValues` into backend parameters.
pub trait ParamConverter<'a> {
    type Converted;

    /// Convert a slice of `RowValues` into the backend's parameter type.
    ///
    /// # Errors
    ///
    /// Returns `SqlMiddlewareDbError` if the conversion fails for any parameter.
    fn convert_sql_params(
        params: &'a [RowValues],
        mode: ConversionMode,
    ) -> Result<Self::Converted, SqlMiddlewareDbError>;
}

/// How the executor interprets command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
pub enum CommandMode {
    /// Command text is SQL and is sent as written.
    #[default]
    Text,
    /// Command text names a procedure or set-returning function; parameters are bound
    /// positionally.
    StoredProcedure,
}

impl CommandMode {
    /// Render command text for execution. `returns_rows` selects between
    /// `SELECT * FROM name(..)` and `CALL name(..)` in stored-procedure mode.
    #[must_use]
    pub fn render<'a>(&self, command: &'a str, param_count: usize, returns_rows: bool) -> Cow<'a, str> {
        match self {
            CommandMode::Text => Cow::Borrowed(command),
            CommandMode::StoredProcedure => {
                let mut sql = String::with_capacity(command.len() + 16 + param_count * 4);
                if returns_rows {
                    sql.push_str("SELECT * FROM ");
                } else {
                    sql.push_str("CALL ");
                }
                sql.push_str(command.trim());
                sql.push('(');
                for idx in 1..=param_count {
                    if idx > 1 {
                        sql.push_str(", ");
                    }
                    let _ = write!(sql, "${idx}");
                }
                sql.push(')');
                Cow::Owned(sql)
            }
        }
    }
}

/// Transaction isolation levels accepted by `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// The `BEGIN` statement for an optional isolation level; `None` keeps the session default.
    #[must_use]
    pub fn begin_statement(level: Option<IsolationLevel>) -> String {
        match level {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_mode_passes_command_through() {
        let sql = CommandMode::Text.render("SELECT 1", 0, true);
        assert!(matches!(sql, Cow::Borrowed("SELECT 1")));
    }

    #[test]
    fn stored_procedure_mode_binds_positionally() {
        assert_eq!(
            CommandMode::StoredProcedure.render("archive_orders", 2, false),
            "CALL archive_orders($1, $2)"
        );
        assert_eq!(
            CommandMode::StoredProcedure.render(" reports.monthly ", 1, true),
            "SELECT * FROM reports.monthly($1)"
        );
        assert_eq!(
            CommandMode::StoredProcedure.render("refresh_all", 0, false),
            "CALL refresh_all()"
        );
    }

    #[test]
    fn begin_statement_honours_isolation() {
        assert_eq!(IsolationLevel::begin_statement(None), "BEGIN");
        assert_eq!(
            IsolationLevel::begin_statement(Some(IsolationLevel::Serializable)),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(
            IsolationLevel::begin_statement(Some(IsolationLevel::RepeatableRead)),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
    }

    #[test]
    fn default_pg_types_follow_variant() {
        assert_eq!(RowValues::Int(3).default_pg_type(), Some(Type::INT8));
        assert_eq!(RowValues::Text("a".into()).default_pg_type(), Some(Type::TEXT));
        assert_eq!(RowValues::Null.default_pg_type(), None);
    }
}

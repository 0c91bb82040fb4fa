use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, Row, Statement};

use super::params::{Params as PgParams, underlying_type};
use crate::error::SqlMiddlewareDbError;
use crate::results::ResultSet;
use crate::types::{ConversionMode, ParamConverter, RowValues};

/// Decodes a column through its underlying type, so domains read like their base type.
struct Base<T>(T);

impl<'a, T: FromSql<'a>> FromSql<'a> for Base<T> {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        T::from_sql(underlying_type(ty), raw).map(Base)
    }

    fn accepts(ty: &Type) -> bool {
        T::accepts(underlying_type(ty))
    }
}

/// Text-like columns, including enums, whose binary form is the label itself.
struct Label(String);

impl<'a> FromSql<'a> for Label {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let ty = underlying_type(ty);
        if matches!(ty.kind(), Kind::Enum(_)) {
            Ok(Label(std::str::from_utf8(raw)?.to_string()))
        } else {
            String::from_sql(ty, raw).map(Label)
        }
    }

    fn accepts(ty: &Type) -> bool {
        let ty = underlying_type(ty);
        matches!(ty.kind(), Kind::Enum(_)) || <String as FromSql<'_>>::accepts(ty)
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>, SqlMiddlewareDbError> {
    Ok(row.try_get::<_, Option<Base<T>>>(idx)?.map(|Base(v)| v))
}

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
///
/// Domains decode as their base type and enums as their label.
///
/// # Errors
/// Returns `SqlMiddlewareDbError` if the column cannot be decoded.
pub fn postgres_extract_value(row: &Row, idx: usize) -> Result<RowValues, SqlMiddlewareDbError> {
    let type_info = underlying_type(row.columns()[idx].type_());

    let value = match *type_info {
        Type::INT2 => get::<i16>(row, idx)?.map(|v| RowValues::Int(i64::from(v))),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| RowValues::Int(i64::from(v))),
        Type::INT8 => get::<i64>(row, idx)?.map(RowValues::Int),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| RowValues::Float(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(RowValues::Float),
        Type::BOOL => get::<bool>(row, idx)?.map(RowValues::Bool),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(RowValues::Timestamp),
        Type::TIMESTAMPTZ => {
            get::<DateTime<Utc>>(row, idx)?.map(|v| RowValues::Timestamp(v.naive_utc()))
        }
        Type::DATE => get::<NaiveDate>(row, idx)?
            .and_then(|v| v.and_hms_opt(0, 0, 0))
            .map(RowValues::Timestamp),
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?.map(RowValues::JSON),
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(RowValues::Blob),
        // text-like types (text, varchar, bpchar, name, enums) decode as strings
        _ => row
            .try_get::<_, Option<Label>>(idx)?
            .map(|Label(v)| RowValues::Text(v)),
    };

    Ok(value.unwrap_or(RowValues::Null))
}

/// Build a result set using statement metadata for column names.
///
/// # Errors
/// Returns errors from row value extraction.
pub fn build_result_set(stmt: &Statement, rows: &[Row]) -> Result<ResultSet, SqlMiddlewareDbError> {
    let column_names: Vec<String> = stmt
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let column_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(rows.len());
    result_set.set_column_names(Arc::new(column_names));

    for row in rows {
        let mut row_values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            row_values.push(postgres_extract_value(row, idx)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

/// Execute a SELECT on a client without managing transactions.
///
/// # Errors
/// Returns backend errors unchanged, or decoding errors from result building.
pub async fn execute_select(
    client: &Client,
    query: &str,
    params: &[RowValues],
) -> Result<ResultSet, SqlMiddlewareDbError> {
    let stmt = client.prepare(query).await?;
    let converted = PgParams::convert_sql_params(params, ConversionMode::Query)?;
    let rows = client.query(&stmt, converted.as_refs()).await?;
    build_result_set(&stmt, &rows)
}

/// Execute a DML statement on a client without managing transactions.
///
/// # Errors
/// Returns backend errors unchanged.
pub async fn execute_dml(
    client: &Client,
    query: &str,
    params: &[RowValues],
) -> Result<usize, SqlMiddlewareDbError> {
    let converted = PgParams::convert_sql_params(params, ConversionMode::Execute)?;
    let rows = client.execute(query, converted.as_refs()).await?;
    usize::try_from(rows).map_err(|e| {
        SqlMiddlewareDbError::ExecutionError(format!("Invalid rows affected count: {e}"))
    })
}

/// Execute a batch of statements with the simple query protocol.
///
/// # Errors
/// Returns backend errors unchanged.
pub async fn execute_batch(client: &Client, query: &str) -> Result<(), SqlMiddlewareDbError> {
    client.batch_execute(query).await?;
    Ok(())
}

/// Run a single-row simple query and return its text columns.
pub(crate) async fn simple_row(
    client: &Client,
    query: &str,
) -> Result<Vec<Option<String>>, SqlMiddlewareDbError> {
    use tokio_postgres::SimpleQueryMessage;

    for message in client.simple_query(query).await? {
        if let SimpleQueryMessage::Row(row) = message {
            return Ok((0..row.len())
                .map(|idx| row.get(idx).map(str::to_string))
                .collect());
        }
    }
    Err(SqlMiddlewareDbError::ExecutionError(format!(
        "query returned no rows: {query}"
    )))
}

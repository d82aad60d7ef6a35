use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{Stream, TryStreamExt};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::types::Decimal;
use sqlx::{Column, Row, TypeInfo};

use crate::app::db::Backend;
use crate::app::error::DbError;
use crate::app::models::{Table, Value};

type CellDecoder<R> = fn(&R, usize) -> Result<Value, DbError>;

/// Drains at most `max_rows` rows from `rows` into a [`Table`].
pub(super) async fn collect_table<R, S>(
    backend: Backend,
    mut rows: S,
    max_rows: usize,
    decode: CellDecoder<R>,
) -> Result<Table, DbError>
where
    R: Row,
    S: Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    let mut table = Table::empty();
    while table.rows.len() < max_rows {
        let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| DbError::execute(backend, e))?
        else {
            break;
        };

        if table.columns.is_empty() {
            table.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        let values = (0..row.len())
            .map(|idx| decode(&row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        table.rows.push(values);
    }
    Ok(table)
}

fn cell<T>(
    decoded: Result<Option<T>, sqlx::Error>,
    wrap: impl FnOnce(T) -> Value,
) -> Option<Value> {
    decoded.ok().map(|v| v.map_or(Value::Null, wrap))
}

fn bytes_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::Text(text),
        Err(e) => Value::Bytes(e.into_bytes()),
    }
}

// Ordered by likelihood for information_schema and typical OLTP columns.
// `try_get` rejects incompatible types, so the first success wins.
pub(super) fn mysql_cell(row: &MySqlRow, idx: usize) -> Result<Value, DbError> {
    cell(row.try_get::<Option<String>, _>(idx), Value::Text)
        .or_else(|| cell(row.try_get::<Option<i64>, _>(idx), Value::Int))
        .or_else(|| cell(row.try_get::<Option<u64>, _>(idx), Value::UInt))
        .or_else(|| cell(row.try_get::<Option<f64>, _>(idx), Value::Float))
        .or_else(|| cell(row.try_get::<Option<f32>, _>(idx), |v| Value::Float(v.into())))
        .or_else(|| cell(row.try_get::<Option<bool>, _>(idx), Value::Bool))
        .or_else(|| {
            cell(row.try_get::<Option<Decimal>, _>(idx), |v| {
                Value::Text(v.to_string())
            })
        })
        .or_else(|| cell(row.try_get::<Option<NaiveDateTime>, _>(idx), Value::Timestamp))
        .or_else(|| cell(row.try_get::<Option<DateTime<Utc>>, _>(idx), Value::TimestampTz))
        .or_else(|| cell(row.try_get::<Option<NaiveDate>, _>(idx), Value::Date))
        .or_else(|| cell(row.try_get::<Option<NaiveTime>, _>(idx), Value::Time))
        .or_else(|| cell(row.try_get::<Option<serde_json::Value>, _>(idx), Value::Json))
        .or_else(|| cell(row.try_get::<Option<Vec<u8>>, _>(idx), bytes_value))
        .or_else(|| cell(row.try_get_unchecked::<Option<Vec<u8>>, _>(idx), bytes_value))
        .ok_or_else(|| undecodable(Backend::MySql, row, idx))
}

pub(super) fn pg_cell(row: &PgRow, idx: usize) -> Result<Value, DbError> {
    cell(row.try_get::<Option<String>, _>(idx), Value::Text)
        .or_else(|| cell(row.try_get::<Option<i64>, _>(idx), Value::Int))
        .or_else(|| cell(row.try_get::<Option<i32>, _>(idx), |v| Value::Int(v.into())))
        .or_else(|| cell(row.try_get::<Option<i16>, _>(idx), |v| Value::Int(v.into())))
        .or_else(|| cell(row.try_get::<Option<f64>, _>(idx), Value::Float))
        .or_else(|| cell(row.try_get::<Option<f32>, _>(idx), |v| Value::Float(v.into())))
        .or_else(|| cell(row.try_get::<Option<bool>, _>(idx), Value::Bool))
        .or_else(|| {
            cell(row.try_get::<Option<Decimal>, _>(idx), |v| {
                Value::Text(v.to_string())
            })
        })
        .or_else(|| cell(row.try_get::<Option<NaiveDateTime>, _>(idx), Value::Timestamp))
        .or_else(|| cell(row.try_get::<Option<DateTime<Utc>>, _>(idx), Value::TimestampTz))
        .or_else(|| cell(row.try_get::<Option<NaiveDate>, _>(idx), Value::Date))
        .or_else(|| cell(row.try_get::<Option<NaiveTime>, _>(idx), Value::Time))
        .or_else(|| cell(row.try_get::<Option<serde_json::Value>, _>(idx), Value::Json))
        .or_else(|| cell(row.try_get::<Option<Vec<u8>>, _>(idx), Value::Bytes))
        // information_schema domains (sql_identifier, yes_or_no, ...) wrap text
        .or_else(|| cell(row.try_get_unchecked::<Option<String>, _>(idx), Value::Text))
        .ok_or_else(|| undecodable(Backend::Postgres, row, idx))
}

fn undecodable<R: Row>(backend: Backend, row: &R, idx: usize) -> DbError {
    let column = &row.columns()[idx];
    DbError::materialize(
        backend,
        format!(
            "cannot decode column {} of type {}",
            column.name(),
            column.type_info().name()
        ),
    )
}

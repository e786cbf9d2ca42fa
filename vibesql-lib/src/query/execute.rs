//! Execute validated statements with bounded time and bounded rows, and
//! shape the resulting rows for the wire.

use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use serde_json::{Map, Number, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo, ValueRef};

use super::{ErrorKind, ExecutionResult, QueryError, QueryExecutor};

/// Hard wall-clock budget for a single statement.
pub const STATEMENT_DEADLINE: Duration = Duration::from_secs(5);

/// Largest result set the executor will materialise.
pub const MAX_RESULT_ROWS: usize = 1_000;

/// The engine-backed [`QueryExecutor`].
///
/// Statements run over the simple protocol so that every column arrives in
/// the engine's text rendering; common types are decoded to native JSON
/// values and anything else is surfaced as that text.
pub struct Executor {
    pool: PgPool,
}

impl Executor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Map<String, Value>>, QueryError> {
        let mut rows = Vec::new();
        let mut stream = sqlx::raw_sql(sql).fetch(&self.pool);
        while let Some(row) = stream.try_next().await.map_err(QueryError::from_sqlx)? {
            if rows.len() >= MAX_RESULT_ROWS {
                return Err(QueryError::new(
                    ErrorKind::ResultTooLarge,
                    "Result exceeds the maximum number of rows",
                )
                .with_detail(format!("results are limited to {MAX_RESULT_ROWS} rows")));
            }
            rows.push(shape_row(&row)?);
        }
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl QueryExecutor for Executor {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult, QueryError> {
        let started = Instant::now();
        let rows = match tokio::time::timeout(STATEMENT_DEADLINE, self.fetch_rows(sql)).await {
            Ok(rows) => rows?,
            Err(_) => return Err(QueryError::timeout()),
        };
        #[allow(clippy::cast_precision_loss)]
        let execution_time_ms = started.elapsed().as_micros() as f64 / 1_000.0;
        Ok(ExecutionResult { row_count: rows.len(), rows, execution_time_ms })
    }
}

/// Shape one row into a column-name → JSON-value mapping, preserving the
/// engine's column order and names.
fn shape_row(row: &PgRow) -> Result<Map<String, Value>, QueryError> {
    let mut shaped = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_value(row, column.ordinal())?;
        shaped.insert(column.name().to_owned(), value);
    }
    Ok(shaped)
}

fn decode_value(row: &PgRow, index: usize) -> Result<Value, QueryError> {
    let raw = row.try_get_raw(index).map_err(QueryError::from_sqlx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match raw.type_info().name() {
        "BOOL" => Value::Bool(decode::<bool>(row, index)?),
        "INT2" => Value::from(decode::<i16>(row, index)?),
        "INT4" => Value::from(decode::<i32>(row, index)?),
        "INT8" => Value::from(decode::<i64>(row, index)?),
        "FLOAT4" => float_value(f64::from(decode::<f32>(row, index)?)),
        "FLOAT8" => float_value(decode::<f64>(row, index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::String(decode::<String>(row, index)?),
        // Byte-valued columns are surfaced as text.
        "BYTEA" => {
            Value::String(String::from_utf8_lossy(&decode::<Vec<u8>>(row, index)?).into_owned())
        }
        "JSON" | "JSONB" => decode::<Value>(row, index)?,
        "VOID" => Value::Null,
        // Everything else keeps the engine's own text rendering.
        _ => match raw.as_str() {
            Ok(text) => Value::String(text.to_owned()),
            Err(_) => Value::String(
                String::from_utf8_lossy(
                    raw.as_bytes().map_err(|error| QueryError::internal(error.to_string()))?,
                )
                .into_owned(),
            ),
        },
    };
    Ok(value)
}

fn decode<'r, T>(row: &'r PgRow, index: usize) -> Result<T, QueryError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(index).map_err(QueryError::from_sqlx)
}

/// JSON numbers cannot carry NaN or infinities; those fall back to the text
/// rendering.
fn float_value(value: f64) -> Value {
    Number::from_f64(value).map_or_else(|| Value::String(value.to_string()), Value::Number)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::float_value;

    #[test]
    fn finite_floats_become_numbers() {
        assert_eq!(float_value(1.5), Value::from(1.5));
        assert_eq!(float_value(0.0), Value::from(0.0));
    }

    #[test]
    fn non_finite_floats_become_text() {
        assert_eq!(float_value(f64::NAN), Value::String("NaN".to_owned()));
        assert_eq!(float_value(f64::INFINITY), Value::String("inf".to_owned()));
    }
}

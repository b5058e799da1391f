use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::Pool;
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::types::{FromSql, ToSql, Type};
use uuid::Uuid;

use crate::error::ExecutionError;

/// A result row keyed by column name (or alias), in projection order.
pub type Row = Map<String, Value>;

/// Coarse SQLSTATE class of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 42601 and friends: the plan itself is malformed.
    Syntax,
    /// Unknown relation or column, ambiguous reference.
    Semantic,
    /// Bad input for a cast (`$1::text::uuid` with a non-uuid), limits.
    Execution,
    /// Statement timeout or admin cancel (57014).
    Canceled,
    Transaction,
    Connection,
    Unknown,
}

impl ErrorCategory {
    fn from_sqlstate(code: &str) -> Self {
        match code.get(..2) {
            Some("42") if code == "42601" || code == "42000" => ErrorCategory::Syntax,
            Some("42") => ErrorCategory::Semantic,
            Some("57") if code == "57014" => ErrorCategory::Canceled,
            Some("22" | "23" | "53" | "54" | "55" | "57") => ErrorCategory::Execution,
            Some("25" | "40") => ErrorCategory::Transaction,
            Some("08") => ErrorCategory::Connection,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Syntax => "syntax error",
            ErrorCategory::Semantic => "semantic error",
            ErrorCategory::Execution => "execution error",
            ErrorCategory::Canceled => "statement canceled",
            ErrorCategory::Transaction => "transaction error",
            ErrorCategory::Connection => "connection error",
            ErrorCategory::Unknown => "database error",
        };
        f.write_str(s)
    }
}

/// The parts of a PostgreSQL error response worth logging next to a
/// degraded request.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub category: ErrorCategory,
    /// SQLSTATE, empty for client-side failures.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based offset into the statement.
    pub position: Option<u32>,
}

impl StructuredError {
    pub fn from_pg_error(err: &tokio_postgres::Error) -> Self {
        let Some(db) = err.as_db_error() else {
            let category = if err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            return StructuredError {
                category,
                detail: err.source().map(|e| e.to_string()),
                ..Self::from_string(err.to_string())
            };
        };
        let code = db.code().code().to_string();
        StructuredError {
            category: ErrorCategory::from_sqlstate(&code),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            position: match db.position() {
                Some(ErrorPosition::Original(pos)) => Some(*pos),
                _ => None,
            },
            code,
        }
    }

    pub fn from_string(msg: String) -> Self {
        StructuredError {
            category: ErrorCategory::Unknown,
            code: String::new(),
            message: msg,
            detail: None,
            hint: None,
            position: None,
        }
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)?;
        if !self.code.is_empty() {
            write!(f, " (SQLSTATE {})", self.code)?;
        }
        if let Some(pos) = self.position {
            write!(f, " at {}", pos)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "; detail: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; hint: {}", hint)?;
        }
        Ok(())
    }
}

/// Decoded PostgreSQL value.
#[derive(Debug, Clone)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
}

impl CellValue {
    pub fn into_json(self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(b),
            CellValue::Int16(i) => Value::from(i),
            CellValue::Int32(i) => Value::from(i),
            CellValue::Int64(i) => Value::from(i),
            CellValue::Float32(f) => serde_json::Number::from_f64(f as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Float64(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s),
            CellValue::Uuid(u) => Value::String(u.to_string()),
            CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            CellValue::Time(t) => Value::String(t.format("%H:%M:%S").to_string()),
            CellValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            CellValue::TimestampTz(dt) => Value::String(dt.to_rfc3339()),
            CellValue::Json(j) => j,
        }
    }
}

/// Anything that can run a read-only statement and hand back rows.
///
/// Every parameter is bound as nullable text; statements carry their own
/// server-side casts (`$1::text::uuid`).
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(
        &self,
        sql: &str,
        params: &[Option<String>],
        timeout: Duration,
    ) -> Result<Vec<Row>, ExecutionError>;
}

/// [`RowSource`] backed by the bounded PostgreSQL pool.
pub struct PgRowSource {
    pool: Pool,
}

impl PgRowSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn fetch(
        &self,
        sql: &str,
        params: &[Option<String>],
        timeout: Duration,
    ) -> Result<Vec<Row>, ExecutionError> {
        let start = Instant::now();

        let client = tokio::time::timeout(timeout, self.pool.get())
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))?
            .map_err(|e| ExecutionError::Pool(e.to_string()))?;

        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let remaining = timeout.saturating_sub(start.elapsed());

        let rows = tokio::time::timeout(remaining, client.query(sql, &refs))
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))?
            .map_err(|e| ExecutionError::Database(StructuredError::from_pg_error(&e)))?;

        tracing::debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "statement executed"
        );

        Ok(rows.iter().map(decode_row).collect())
    }
}

fn decode_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| (col.name().to_string(), decode_cell(row, i, col.type_()).into_json()))
        .collect()
}

/// Unknown types are read as text; anything undecodable becomes NULL, which
/// the mapper treats as "not found".
fn decode_cell(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => cell(row, idx, CellValue::Bool),
        Type::INT2 => cell(row, idx, CellValue::Int16),
        Type::INT4 => cell(row, idx, CellValue::Int32),
        Type::INT8 => cell(row, idx, CellValue::Int64),
        Type::FLOAT4 => cell(row, idx, CellValue::Float32),
        Type::FLOAT8 => cell(row, idx, CellValue::Float64),
        Type::UUID => cell(row, idx, CellValue::Uuid),
        Type::DATE => cell(row, idx, CellValue::Date),
        Type::TIME => cell(row, idx, CellValue::Time),
        Type::TIMESTAMP => cell(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => cell(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => cell(row, idx, CellValue::Json),
        _ => cell(row, idx, CellValue::Text),
    }
}

fn cell<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> CellValue) -> CellValue {
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => wrap(v),
        _ => CellValue::Null,
    }
}

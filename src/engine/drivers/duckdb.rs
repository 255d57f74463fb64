// SPDX-License-Identifier: Apache-2.0

//! DuckDB Driver
//!
//! Embedded analytical engine, used both as a data source and as the default
//! staging store for federated joins.
//!
//! The `duckdb` crate is synchronous and `Connection` is `!Sync`, so every
//! call runs inside `spawn_blocking` behind a `std::sync::Mutex`.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use ::duckdb::types::{TimeUnit, Value as DuckValue};
use ::duckdb::Connection;
use async_trait::async_trait;

use crate::engine::dialect::Dialect;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connector, SourceDriver};
use crate::engine::types::{ColumnInfo, ConnectionConfig, QueryResult, Row as QRow, Value};

/// DuckDB driver implementation.
pub struct DuckDbDriver;

impl DuckDbDriver {
    pub fn new() -> Self {
        Self
    }

    /// Opens a DuckDB connection from a config.
    fn open_connection(config: &ConnectionConfig) -> EngineResult<Connection> {
        let path = config.host.trim();

        if config.is_memory() {
            Connection::open_in_memory().map_err(|e| {
                EngineError::connection_failed(format!("Failed to open DuckDB in-memory: {e}"))
            })
        } else if !config.create_if_missing && !std::path::Path::new(path).exists() {
            Err(EngineError::connection_failed(format!("DuckDB database '{path}' does not exist")))
        } else {
            Connection::open(path).map_err(|e| {
                EngineError::connection_failed(format!("Failed to open DuckDB file '{path}': {e}"))
            })
        }
    }

    /// Validates the DuckDB file path.
    fn validate_path(path: &str) -> EngineResult<()> {
        let path = path.trim();

        if path.is_empty() {
            return Err(EngineError::connection_failed("DuckDB path cannot be empty."));
        }

        if path.eq_ignore_ascii_case("localhost") || path.contains("://") {
            return Err(EngineError::connection_failed(format!(
                "Invalid DuckDB path: '{path}'. Expected a file path or :memory:."
            )));
        }

        Ok(())
    }
}

impl Default for DuckDbDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDriver for DuckDbDriver {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn driver_name(&self) -> &'static str {
        "DuckDB"
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<Box<dyn Connector>> {
        Self::validate_path(&config.host)?;

        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || Self::open_connection(&config))
            .await
            .map_err(|e| EngineError::internal(format!("DuckDB open task panicked: {e}")))??;

        Ok(Box::new(DuckDbConnector {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

/// Open DuckDB database handle.
pub struct DuckDbConnector {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbConnector {
    /// Runs a synchronous closure on the connection inside spawn_blocking.
    async fn with_conn<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                EngineError::internal(format!("Failed to lock DuckDB connection: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::internal(format!("DuckDB task panicked: {e}")))?
    }
}

#[async_trait]
impl Connector for DuckDbConnector {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    async fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| execute_select(conn, &sql, Instant::now()))
            .await
    }

    async fn execute(&self, sql: &str) -> EngineResult<u64> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            conn.execute(&sql, [])
                .map(|affected| affected as u64)
                .map_err(|e| EngineError::classify(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> EngineResult<()> {
        // The handle closes when the last Arc drops.
        Ok(())
    }
}

/// Extracts a value from a DuckDB row.
///
/// Matches on the stored type; the typed `get::<T>` accessors coerce across
/// numeric and text types.
fn duckdb_value(row: &::duckdb::Row<'_>, idx: usize) -> Value {
    let value = match row.get::<_, DuckValue>(idx) {
        Ok(v) => v,
        Err(_) => return Value::Null,
    };

    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i as i64),
        DuckValue::SmallInt(i) => Value::Int(i as i64),
        DuckValue::Int(i) => Value::Int(i as i64),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(u) => Value::Int(u as i64),
        DuckValue::USmallInt(u) => Value::Int(u as i64),
        DuckValue::UInt(u) => Value::Int(u as i64),
        DuckValue::UBigInt(u) => i64::try_from(u)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(u.to_string())),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        DuckValue::Float(f) => Value::Float(f as f64),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => Value::Text(d.to_string()),
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            chrono::DateTime::from_timestamp_micros(micros)
                .map(|dt| Value::Text(dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null)
        }
        other => Value::Text(format!("{other:?}")),
    }
}

/// Executes a SELECT-style query.
///
/// `column_name()` panics before the statement has run, so rows are collected
/// first and column names read afterwards.
fn execute_select(conn: &Connection, sql: &str, start: Instant) -> EngineResult<QueryResult> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngineError::classify(e.to_string()))?;

    let rows_iter = stmt
        .query_map([], |row| {
            let col_count = row.as_ref().column_count();
            let values: Vec<Value> = (0..col_count).map(|i| duckdb_value(row, i)).collect();
            Ok(QRow { values })
        })
        .map_err(|e| EngineError::classify(e.to_string()))?;

    let mut rows = Vec::new();
    for row_result in rows_iter {
        rows.push(row_result.map_err(|e| EngineError::execution_error(e.to_string()))?);
    }

    let column_count = stmt.column_count();
    let columns: Vec<ColumnInfo> = (0..column_count)
        .map(|i| ColumnInfo {
            name: stmt
                .column_name(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("col_{i}")),
            data_type: format!("{:?}", stmt.column_type(i)),
            nullable: true,
        })
        .collect();

    Ok(QueryResult {
        columns,
        rows,
        affected_rows: None,
        execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
    })
}

// SPDX-License-Identifier: Apache-2.0

//! SQLite Driver
//!
//! Implements `SourceDriver` for SQLite files using SQLx.
//! An in-memory database only exists for the lifetime of its connection, so
//! `:memory:` pools are pinned to a single connection that is never recycled.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo};

use crate::engine::dialect::Dialect;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connector, SourceDriver};
use crate::engine::types::{ColumnInfo, ConnectionConfig, QueryResult, Row as QRow, Value};

/// SQLite driver implementation
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    async fn create_pool(config: &ConnectionConfig) -> EngineResult<SqlitePool> {
        let opts = Self::build_connect_options(config);
        let acquire_timeout = config.pool_acquire_timeout_secs.unwrap_or(30);

        let options = if config.is_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.pool_max_connections.unwrap_or(2))
        };

        options
            .acquire_timeout(Duration::from_secs(acquire_timeout as u64))
            .connect_with(opts)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    fn build_connect_options(config: &ConnectionConfig) -> SqliteConnectOptions {
        if config.is_memory() {
            return SqliteConnectOptions::new().in_memory(true);
        }

        let path = config.host.trim();
        SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(path))
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(sqlite_row: &SqliteRow) -> QRow {
        let values: Vec<Value> = sqlite_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(sqlite_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a SqliteRow at the given index
    ///
    /// SQLite has dynamic typing, so we try multiple types in order of likelihood
    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        // BLOB
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Gets column info from a SqliteRow
    fn get_column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    /// Validates the SQLite connection path
    fn validate_path(path: &str) -> EngineResult<()> {
        let path = path.trim();

        if path.is_empty() {
            return Err(EngineError::connection_failed("SQLite path cannot be empty."));
        }

        if path.eq_ignore_ascii_case("localhost") {
            return Err(EngineError::connection_failed(
                "Invalid SQLite path: 'localhost'. Expected a file path or :memory:.",
            ));
        }

        if path.contains("://") {
            return Err(EngineError::connection_failed(format!(
                "Invalid SQLite path format: {path}"
            )));
        }

        Ok(())
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDriver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<Box<dyn Connector>> {
        Self::validate_path(&config.host)?;
        if !config.is_memory() && !config.create_if_missing && !Path::new(config.host.trim()).exists() {
            return Err(EngineError::connection_failed(format!(
                "SQLite database '{}' does not exist",
                config.host.trim()
            )));
        }
        let pool = Self::create_pool(config).await?;
        Ok(Box::new(SqliteConnector { pool }))
    }
}

/// Open SQLite pool
pub struct SqliteConnector {
    pool: SqlitePool,
}

#[async_trait]
impl Connector for SqliteConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        let start = Instant::now();

        let sqlite_rows: Vec<SqliteRow> = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::classify(e.to_string()))?;

        let columns = sqlite_rows.first().map(SqliteDriver::get_column_info).unwrap_or_default();
        let rows: Vec<QRow> = sqlite_rows.iter().map(SqliteDriver::convert_row).collect();

        Ok(QueryResult {
            columns,
            rows,
            affected_rows: None,
            execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
        })
    }

    async fn execute(&self, sql: &str) -> EngineResult<u64> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::classify(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn close(&self) -> EngineResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rejects_bad_paths() {
        assert!(SqliteDriver::validate_path("").is_err());
        assert!(SqliteDriver::validate_path("localhost").is_err());
        assert!(SqliteDriver::validate_path("postgres://x").is_err());
        assert!(SqliteDriver::validate_path("/tmp/data.db").is_ok());
    }

    #[tokio::test]
    async fn test_memory_database_keeps_state() {
        let driver = SqliteDriver::new();
        let conn = driver.connect(&ConnectionConfig::file(":memory:")).await.unwrap();

        conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        let inserted = conn
            .execute("INSERT INTO test (name) VALUES ('hello'), (NULL)")
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let result = conn.query("SELECT id, name FROM test ORDER BY id").await.unwrap();
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].values[1], Value::Text("hello".into()));
        assert_eq!(result.rows[1].values[1], Value::Null);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_database_roundtrip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let config = ConnectionConfig::file(db_path.to_string_lossy().to_string());

        let driver = SqliteDriver::new();
        let conn = driver.connect(&config.clone().with_create_if_missing(true)).await.unwrap();
        conn.execute("CREATE TABLE t (v REAL)").await.unwrap();
        conn.execute("INSERT INTO t VALUES (1.5)").await.unwrap();
        conn.close().await.unwrap();

        let conn = driver.connect(&config).await.unwrap();
        let result = conn.query("SELECT v FROM t").await.unwrap();
        assert_eq!(result.rows[0].values[0], Value::Float(1.5));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_not_created() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("typo.db");

        let err = SqliteDriver::new()
            .connect(&ConnectionConfig::file(db_path.to_string_lossy().to_string()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert!(!db_path.exists());
    }

    #[tokio::test]
    async fn test_syntax_errors_are_classified() {
        let conn = SqliteDriver::new()
            .connect(&ConnectionConfig::file(":memory:"))
            .await
            .unwrap();
        let err = conn.query("SELEC nope").await.unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError { .. }));
    }
}

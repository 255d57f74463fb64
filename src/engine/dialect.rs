// SPDX-License-Identifier: Apache-2.0

//! SQL dialects
//!
//! The dialect tag carried by every table reference selects both the driver
//! used to reach the source and the SQL spelling used to talk to it:
//! identifier quoting, table qualification, literal rendering and paging.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::types::Value;

/// Source / staging SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    MySql,
    Sqlite,
    DuckDb,
}

impl Dialect {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "mysql" | "mariadb" => Some(Dialect::MySql),
            "sqlite" => Some(Dialect::Sqlite),
            "duckdb" => Some(Dialect::DuckDb),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
            Dialect::DuckDb => "duckdb",
        }
    }

    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::DuckDb => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Format a qualified table name.
    ///
    /// SQLite has a single schema per file, so the schema part is dropped.
    pub fn qualified_table(&self, schema: &str, table: &str) -> String {
        match self {
            Dialect::Sqlite => self.quote_ident(table),
            _ if schema.is_empty() => self.quote_ident(table),
            _ => format!("{}.{}", self.quote_ident(schema), self.quote_ident(table)),
        }
    }

    /// Column type used for staged (permissive) columns.
    pub fn text_type(&self) -> &'static str {
        match self {
            Dialect::DuckDb => "VARCHAR",
            Dialect::Postgres | Dialect::MySql | Dialect::Sqlite => "TEXT",
        }
    }

    pub fn bool_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres | Dialect::DuckDb, true) => "TRUE",
            (Dialect::Postgres | Dialect::DuckDb, false) => "FALSE",
            (Dialect::MySql | Dialect::Sqlite, true) => "1",
            (Dialect::MySql | Dialect::Sqlite, false) => "0",
        }
    }

    /// Quote-escapes a string literal. NUL characters are stripped.
    pub fn string_literal(&self, value: &str) -> String {
        let cleaned = value.replace('\0', "");
        let escaped = match self {
            Dialect::MySql => cleaned.replace('\\', "\\\\").replace('\'', "''"),
            _ => cleaned.replace('\'', "''"),
        };
        format!("'{escaped}'")
    }

    /// Renders a value as a SQL literal.
    ///
    /// Non-finite floats render as NULL; arrays render as a parenthesized list
    /// for `IN` predicates.
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.bool_literal(*b).to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => "NULL".to_string(),
            Value::Text(s) => self.string_literal(s),
            Value::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                match self {
                    Dialect::Postgres => format!("'\\x{hex}'"),
                    _ => format!("X'{hex}'"),
                }
            }
            Value::Json(json) => self.string_literal(&json.to_string()),
            Value::Array(items) if items.is_empty() => "(NULL)".to_string(),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.literal(v)).collect();
                format!("({})", parts.join(", "))
            }
        }
    }

    /// Sorts a text column holding numbers by value.
    pub fn numeric_sort_key(&self, expr: &str) -> String {
        match self {
            Dialect::DuckDb => format!("TRY_CAST({expr} AS DOUBLE)"),
            Dialect::Postgres => format!("CAST({expr} AS DOUBLE PRECISION)"),
            Dialect::MySql => format!("CAST({expr} AS DECIMAL(65,10))"),
            Dialect::Sqlite => format!("CAST({expr} AS REAL)"),
        }
    }

    /// Sorts a text column holding dates or timestamps chronologically.
    ///
    /// SQLite keeps ISO-8601 text, which already sorts in time order.
    pub fn temporal_sort_key(&self, expr: &str) -> String {
        match self {
            Dialect::DuckDb => format!("TRY_CAST({expr} AS TIMESTAMP)"),
            Dialect::Postgres => format!("CAST({expr} AS TIMESTAMP)"),
            Dialect::MySql => format!("CAST({expr} AS DATETIME)"),
            Dialect::Sqlite => expr.to_string(),
        }
    }

    /// Renders `LIMIT` / `OFFSET` for the dialect.
    ///
    /// MySQL and SQLite cannot express OFFSET without LIMIT, so an unbounded
    /// limit is spelled out for them.
    pub fn paging_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(limit), None) => Some(format!("LIMIT {limit}")),
            (Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
            (None, Some(offset)) => Some(match self {
                Dialect::MySql => format!("LIMIT 18446744073709551615 OFFSET {offset}"),
                Dialect::Sqlite => format!("LIMIT -1 OFFSET {offset}"),
                Dialect::Postgres | Dialect::DuckDb => format!("OFFSET {offset}"),
            }),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

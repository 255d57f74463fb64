// SPDX-License-Identifier: Apache-2.0

//! Result stager.
//!
//! Materializes one sub-query's rows into a text-typed table in the staging
//! store so the final join can combine sources with plain SQL. Every column is
//! stored as text, which tolerates whatever types the sources returned and
//! keeps multi-row `VALUES` lists type-stable. The source type of each column
//! is remembered on the [`StagedTable`] so the final join can sort numbers and
//! timestamps by value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, instrument};

use crate::engine::dialect::Dialect;
use crate::engine::traits::Connector;
use crate::engine::types::{QueryResult, SourceId, Value};

use super::error::{FederationError, FederationResult};
use super::naming::ColumnNamer;
use super::types::{StagedKind, StagedTable, SubQuery};

static STAGED_TABLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<prefix>_<source>_<unix millis>_<sequence>`, unique within the process.
pub fn staged_table_name(prefix: &str, source_id: &SourceId) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = STAGED_TABLE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}_{}", prefix, sanitize(source_id.as_str()), millis, seq)
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "src".to_string()
    } else {
        cleaned
    }
}

/// Renders a source value for a text column; `None` means SQL NULL.
pub fn staged_text(value: &Value, dialect: Dialect) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) if s.is_empty() => None,
        Value::Text(s) => Some(s.clone()),
        Value::Bool(b) => Some(dialect.bool_literal(*b).to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) if f.is_finite() => Some(f.to_string()),
        Value::Float(_) => None,
        Value::Bytes(bytes) => Some(STANDARD.encode(bytes)),
        Value::Json(json) => Some(json.to_string()),
        Value::Array(_) => serde_json::to_string(value).ok(),
    }
}

/// Kind of each staged column: the driver's type name when it has one,
/// otherwise whatever the returned values look like.
fn column_kinds(positions: &[usize], result: &QueryResult) -> Vec<StagedKind> {
    positions
        .iter()
        .map(|&pos| {
            result
                .columns
                .get(pos)
                .and_then(|c| StagedKind::from_type_name(&c.data_type))
                .unwrap_or_else(|| StagedKind::from_values(result.rows.iter().filter_map(|r| r.values.get(pos))))
        })
        .collect()
}

pub struct ResultStager<'a> {
    conn: &'a dyn Connector,
    dialect: Dialect,
    batch_size: usize,
    prefix: &'a str,
}

impl<'a> ResultStager<'a> {
    pub fn new(conn: &'a dyn Connector, batch_size: usize, prefix: &'a str) -> Self {
        Self {
            conn,
            dialect: conn.dialect(),
            batch_size: batch_size.max(1),
            prefix,
        }
    }

    /// Creates the staged table for `sub_query`. Nothing is inserted yet.
    #[instrument(skip(self, sub_query, namer), fields(source_id = %sub_query.source_id))]
    pub async fn create(&self, sub_query: &SubQuery, namer: &ColumnNamer) -> FederationResult<StagedTable> {
        if sub_query.columns.is_empty() {
            return Err(FederationError::staging(format!(
                "sub-query for source {} has no columns to stage",
                sub_query.source_id
            )));
        }

        let name = staged_table_name(self.prefix, &sub_query.source_id);
        let column_defs: Vec<String> = sub_query
            .columns
            .iter()
            .map(|c| format!("{} {}", self.dialect.quote_ident(&namer.canonical(c)), self.dialect.text_type()))
            .collect();

        let sql = format!(
            "CREATE TABLE {} ({})",
            self.dialect.quote_ident(&name),
            column_defs.join(", ")
        );
        self.conn
            .execute(&sql)
            .await
            .map_err(|e| FederationError::staging(format!("failed to create staged table '{name}': {e}")))?;

        debug!(table = %name, columns = column_defs.len(), "created staged table");
        Ok(StagedTable::new(name, sub_query.source_id.clone(), sub_query.columns.clone()))
    }

    /// Inserts `result` into `table`, `batch_size` rows per statement.
    ///
    /// Values are matched to staged columns by canonical name; when a name is
    /// missing (e.g. truncated by the source) but the column counts agree, the
    /// value is taken by position. Records each column's [`StagedKind`].
    #[instrument(skip(self, table, result, namer), fields(table = %table.name, rows = result.rows.len()))]
    pub async fn populate(
        &self,
        table: &mut StagedTable,
        result: &QueryResult,
        namer: &ColumnNamer,
    ) -> FederationResult<u64> {
        if result.rows.is_empty() {
            return Ok(0);
        }

        let names: Vec<String> = table.columns.iter().map(|c| namer.canonical(c)).collect();
        let positions = self.column_positions(table, &names, result)?;
        table.kinds = column_kinds(&positions, result);

        let column_list = names
            .iter()
            .map(|n| self.dialect.quote_ident(n))
            .collect::<Vec<_>>()
            .join(", ");
        let table_ident = self.dialect.quote_ident(&table.name);

        let mut inserted = 0u64;
        for chunk in result.rows.chunks(self.batch_size) {
            let tuples: Vec<String> = chunk
                .iter()
                .map(|row| {
                    let values: Vec<String> = positions
                        .iter()
                        .map(|&pos| {
                            row.values
                                .get(pos)
                                .and_then(|v| staged_text(v, self.dialect))
                                .map(|text| self.dialect.string_literal(&text))
                                .unwrap_or_else(|| "NULL".to_string())
                        })
                        .collect();
                    format!("({})", values.join(", "))
                })
                .collect();

            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table_ident,
                column_list,
                tuples.join(", ")
            );
            self.conn.execute(&sql).await.map_err(|e| {
                FederationError::staging(format!("failed to populate staged table '{}': {e}", table.name))
            })?;
            inserted += chunk.len() as u64;
        }

        debug!(inserted, "populated staged table");
        Ok(inserted)
    }

    fn column_positions(
        &self,
        table: &StagedTable,
        names: &[String],
        result: &QueryResult,
    ) -> FederationResult<Vec<usize>> {
        let positional = result.columns.len() == names.len();
        names
            .iter()
            .enumerate()
            .map(|(i, name)| match result.column_index(name) {
                Some(pos) => Ok(pos),
                None if positional => Ok(i),
                None => Err(FederationError::staging(format!(
                    "source {} returned no column '{}' for staged table '{}'",
                    table.source_id, name, table.name
                ))),
            })
            .collect()
    }

    pub async fn drop(&self, table: &StagedTable) -> FederationResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.dialect.quote_ident(&table.name));
        self.conn
            .execute(&sql)
            .await
            .map(|_| ())
            .map_err(|e| FederationError::staging(format!("failed to drop staged table '{}': {e}", table.name)))
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Canonical column naming.
//!
//! Every place that names a column (sub-query `SELECT` aliases, staged-table
//! columns, final-join predicates, result field names) goes through
//! [`ColumnNamer::canonical`], so the same column always gets the same name.
//!
//! Flat-file schemas (spreadsheet / PDF / analytics imports) create one
//! disposable table per upload, so their columns drop the schema and keep only
//! the rightmost [`FLAT_FILE_TABLE_CHARS`] characters of the table name.

use super::types::ColumnRef;

/// Characters of a flat-file table name kept in the canonical name.
pub const FLAT_FILE_TABLE_CHARS: usize = 20;

/// Schemas treated as flat-file imports unless configured otherwise.
pub const DEFAULT_FLAT_FILE_SCHEMAS: &[&str] = &[
    "ga",
    "ga4",
    "excel",
    "csv",
    "pdf",
    "spreadsheet",
    "google_sheets",
];

pub fn default_flat_file_schemas() -> Vec<String> {
    DEFAULT_FLAT_FILE_SCHEMAS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct ColumnNamer {
    flat_file_schemas: Vec<String>,
}

impl ColumnNamer {
    pub fn new(flat_file_schemas: Vec<String>) -> Self {
        Self {
            flat_file_schemas: flat_file_schemas
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// A schema matches an entry exactly or as `<entry>_<suffix>` (e.g. `ga_123`).
    pub fn is_flat_file_schema(&self, schema: &str) -> bool {
        let schema = schema.to_lowercase();
        self.flat_file_schemas.iter().any(|entry| {
            schema == *entry
                || schema
                    .strip_prefix(entry.as_str())
                    .is_some_and(|rest| rest.starts_with('_'))
        })
    }

    pub fn canonical(&self, column: &ColumnRef) -> String {
        self.name_for(&column.schema, &column.table, &column.column, column.alias.as_deref())
    }

    pub fn name_for(&self, schema: &str, table: &str, column: &str, alias: Option<&str>) -> String {
        if let Some(alias) = alias.filter(|a| !a.is_empty()) {
            return alias.to_string();
        }

        if self.is_flat_file_schema(schema) {
            format!("{}_{}", truncate_left(table, FLAT_FILE_TABLE_CHARS), column)
        } else {
            format!("{schema}_{table}_{column}")
        }
    }
}

impl Default for ColumnNamer {
    fn default() -> Self {
        Self::new(default_flat_file_schemas())
    }
}

/// Keeps the last `max` characters; strings of `max` characters or fewer are untouched.
fn truncate_left(value: &str, max: usize) -> &str {
    let count = value.chars().count();
    if count <= max {
        return value;
    }
    match value.char_indices().nth(count - max) {
        Some((idx, _)) => &value[idx..],
        None => value,
    }
}

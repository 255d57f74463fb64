// SPDX-License-Identifier: Apache-2.0

//! Federation query parser.
//!
//! Turns the structured query description (JSON, camelCase keys) into a
//! [`ParsedQuery`]. Tables are implicit: they are discovered from the column
//! list and deduplicated by `(schema, table)`, keeping the first-seen alias and
//! source. Column order is preserved because it is the default output order.

use std::collections::HashSet;

use serde::Deserialize;

use crate::engine::dialect::Dialect;
use crate::engine::types::{SortDirection, SourceId, Value};

use super::error::{FederationError, FederationResult};
use super::naming::ColumnNamer;
use super::types::{
    ColumnPath, ColumnRef, ComparisonOperator, Connective, FilterCondition, FilterOperator,
    JoinCondition, JoinType, OrderBy, ParsedQuery, QueryModifiers, TableRef,
};

/// Limit / offset value meaning "unbounded".
pub const UNBOUNDED: i64 = -1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuery {
    columns: Vec<RawColumn>,
    #[serde(default)]
    joins: Vec<RawJoin>,
    #[serde(default)]
    options: RawOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawColumn {
    schema: String,
    table: String,
    column: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    table_alias: Option<String>,
    data_source_id: SourceId,
    data_source_type: String,
    #[serde(default)]
    transform: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJoin {
    left_table: String,
    left_column: String,
    right_table: String,
    right_column: String,
    #[serde(default)]
    join_type: Option<String>,
    #[serde(default)]
    operator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    #[serde(default, rename = "where")]
    filters: Vec<RawFilter>,
    #[serde(default, alias = "group_by")]
    group_by: Vec<String>,
    #[serde(default, alias = "order_by")]
    order_by: Vec<RawOrderBy>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    column: String,
    operator: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    connective: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOrderBy {
    Path(String),
    Detailed {
        column: String,
        #[serde(default)]
        direction: Option<String>,
    },
}

/// Parses a raw query description.
///
/// Fails with [`FederationError::Parse`] when a required field is missing or a
/// value cannot be interpreted (unknown dialect, operator, join type, or a
/// join / filter / ordering that names a table not in the column list).
pub fn parse_query(raw: &serde_json::Value, namer: &ColumnNamer) -> FederationResult<ParsedQuery> {
    let raw: RawQuery = RawQuery::deserialize(raw)
        .map_err(|e| FederationError::parse(format!("invalid query description: {e}")))?;

    if raw.columns.is_empty() {
        return Err(FederationError::parse("query selects no columns"));
    }

    let (tables, columns) = parse_columns(raw.columns)?;
    check_output_names(&columns, namer)?;

    let joins = raw
        .joins
        .into_iter()
        .enumerate()
        .map(|(i, join)| parse_join(i, join, &tables))
        .collect::<FederationResult<Vec<_>>>()?;

    let filters = raw
        .options
        .filters
        .into_iter()
        .enumerate()
        .map(|(i, filter)| parse_filter(i, filter))
        .collect::<FederationResult<Vec<_>>>()?;

    let group_by = raw
        .options
        .group_by
        .iter()
        .map(|path| resolve_path(path, "groupBy", &tables))
        .collect::<FederationResult<Vec<_>>>()?;

    let order_by = raw
        .options
        .order_by
        .into_iter()
        .map(|item| parse_order_by(item, &tables))
        .collect::<FederationResult<Vec<_>>>()?;

    Ok(ParsedQuery {
        tables,
        columns,
        joins,
        filters,
        modifiers: QueryModifiers {
            group_by,
            order_by,
            limit: parse_bound("limit", raw.options.limit)?,
            offset: parse_bound("offset", raw.options.offset)?,
        },
    })
}

fn parse_columns(raw: Vec<RawColumn>) -> FederationResult<(Vec<TableRef>, Vec<ColumnRef>)> {
    let mut tables: Vec<TableRef> = Vec::new();
    let mut columns = Vec::with_capacity(raw.len());

    for (i, col) in raw.into_iter().enumerate() {
        for (field, value) in [("schema", &col.schema), ("table", &col.table), ("column", &col.column)] {
            if value.trim().is_empty() {
                return Err(FederationError::parse(format!("columns[{i}]: '{field}' is empty")));
            }
        }

        let dialect = Dialect::from_tag(&col.data_source_type).ok_or_else(|| {
            FederationError::parse(format!(
                "columns[{i}]: unknown data source type '{}'",
                col.data_source_type
            ))
        })?;

        if let Some(transform) = col.transform.as_deref() {
            validate_transform(i, transform)?;
        }

        let table = match tables
            .iter()
            .find(|t| t.schema == col.schema && t.table == col.table)
        {
            Some(existing) => existing.clone(),
            None => {
                let table = TableRef {
                    schema: col.schema.clone(),
                    table: col.table.clone(),
                    alias: non_empty(col.table_alias),
                    source_id: col.data_source_id,
                    dialect,
                };
                tables.push(table.clone());
                table
            }
        };

        columns.push(ColumnRef {
            schema: col.schema,
            table: col.table,
            column: col.column,
            alias: non_empty(col.alias),
            table_alias: table.alias.clone(),
            source_id: table.source_id.clone(),
            dialect: table.dialect,
            transform: non_empty(col.transform),
            hidden: false,
        });
    }

    Ok((tables, columns))
}

fn check_output_names(columns: &[ColumnRef], namer: &ColumnNamer) -> FederationResult<()> {
    let mut seen = HashSet::new();
    for column in columns {
        let name = namer.canonical(column);
        if !seen.insert(name.clone()) {
            return Err(FederationError::parse(format!(
                "duplicate output column '{name}'; give one of them an alias"
            )));
        }
    }
    Ok(())
}

fn parse_join(index: usize, raw: RawJoin, tables: &[TableRef]) -> FederationResult<JoinCondition> {
    let join_type = match raw.join_type.as_deref() {
        None => JoinType::Inner,
        Some(tag) => JoinType::from_tag(tag).ok_or_else(|| {
            FederationError::parse(format!("joins[{index}]: unknown join type '{tag}'"))
        })?,
    };
    let operator = match raw.operator.as_deref() {
        None => ComparisonOperator::Eq,
        Some(tag) => ComparisonOperator::from_tag(tag).ok_or_else(|| {
            FederationError::parse(format!("joins[{index}]: unknown operator '{tag}'"))
        })?,
    };

    let context = format!("joins[{index}]");
    let left = lookup_table(tables, None, &raw.left_table, &context)?;
    let right = lookup_table(tables, None, &raw.right_table, &context)?;
    if left == right {
        return Err(FederationError::parse(format!(
            "{context}: '{}' is joined to itself",
            raw.left_table
        )));
    }

    Ok(JoinCondition {
        left_table: raw.left_table,
        left_column: raw.left_column,
        right_table: raw.right_table,
        right_column: raw.right_column,
        join_type,
        operator,
    })
}

/// The one selected table a join or path refers to.
fn lookup_table<'a>(
    tables: &'a [TableRef],
    schema: Option<&str>,
    name: &str,
    context: &str,
) -> FederationResult<&'a TableRef> {
    match super::types::tables_named(tables, schema, name).as_slice() {
        [table] => Ok(*table),
        [] => Err(FederationError::parse(format!(
            "{context}: table '{name}' is not selected by any column"
        ))),
        candidates => {
            let names: Vec<String> = candidates.iter().map(|t| format!("{}.{}", t.schema, t.table)).collect();
            Err(FederationError::parse(format!(
                "{context}: table '{name}' is ambiguous between {}; set tableAlias on their columns and join on the alias",
                names.join(" and ")
            )))
        }
    }
}

/// Filters are not resolved against the table set here; the partitioner
/// records where each one lands.
fn parse_filter(index: usize, raw: RawFilter) -> FederationResult<FilterCondition> {
    let column = ColumnPath::parse(&raw.column).ok_or_else(|| {
        FederationError::parse(format!(
            "where[{index}]: '{}' is not a table.column or schema.table.column path",
            raw.column
        ))
    })?;

    let operator = FilterOperator::from_tag(&raw.operator).ok_or_else(|| {
        FederationError::parse(format!("where[{index}]: unknown operator '{}'", raw.operator))
    })?;

    let value = Value::from_json(&raw.value);
    if operator.takes_list() && !matches!(value, Value::Array(_)) {
        return Err(FederationError::parse(format!(
            "where[{index}]: {} needs an array value",
            raw.operator.trim().to_uppercase()
        )));
    }

    let connective = match raw.connective.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(tag) => Some(Connective::from_tag(tag).ok_or_else(|| {
            FederationError::parse(format!("where[{index}]: unknown connective '{tag}'"))
        })?),
    };

    Ok(FilterCondition {
        column,
        operator,
        value,
        connective,
    })
}

fn parse_order_by(raw: RawOrderBy, tables: &[TableRef]) -> FederationResult<OrderBy> {
    let (path, direction) = match raw {
        RawOrderBy::Path(path) => (path, None),
        RawOrderBy::Detailed { column, direction } => (column, direction),
    };

    let direction = match direction.as_deref().map(|d| d.trim().to_uppercase()) {
        None => SortDirection::Asc,
        Some(d) if d.is_empty() || d == "ASC" => SortDirection::Asc,
        Some(d) if d == "DESC" => SortDirection::Desc,
        Some(d) => {
            return Err(FederationError::parse(format!("orderBy: unknown direction '{d}'")))
        }
    };

    Ok(OrderBy {
        column: resolve_path(&path, "orderBy", tables)?,
        direction,
    })
}

fn resolve_path(raw: &str, field: &str, tables: &[TableRef]) -> FederationResult<ColumnPath> {
    let path = ColumnPath::parse(raw)
        .ok_or_else(|| FederationError::parse(format!("{field}: '{raw}' is not a column path")))?;

    lookup_table(tables, path.schema.as_deref(), &path.table, field)?;
    Ok(path)
}

/// `None` and `-1` are unbounded; any other negative is rejected.
fn parse_bound(field: &str, value: Option<i64>) -> FederationResult<Option<u64>> {
    match value {
        None | Some(UNBOUNDED) => Ok(None),
        Some(v) if v < 0 => Err(FederationError::parse(format!(
            "{field} must be -1 (unbounded) or non-negative, got {v}"
        ))),
        Some(v) => Ok(Some(v as u64)),
    }
}

/// A transform is either a template with `{column}` or a bare function name.
fn validate_transform(index: usize, transform: &str) -> FederationResult<()> {
    let transform = transform.trim();
    if transform.is_empty() || transform.contains("{column}") {
        return Ok(());
    }

    let mut chars = transform.chars();
    let valid_ident = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_ident {
        Ok(())
    } else {
        Err(FederationError::parse(format!(
            "columns[{index}]: transform '{transform}' must contain {{column}} or be a function name"
        )))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

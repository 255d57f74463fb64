// SPDX-License-Identifier: Apache-2.0

//! Types for the federated query pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::dialect::Dialect;
use crate::engine::types::{SortDirection, SourceId, Value};

/// A selected column, owned by exactly one table and therefore one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub schema: String,
    pub table: String,
    pub column: String,
    /// Output name override; `None` when absent or empty in the input.
    pub alias: Option<String>,
    pub table_alias: Option<String>,
    pub source_id: SourceId,
    pub dialect: Dialect,
    /// Either a `{column}` template or a bare function name.
    pub transform: Option<String>,
    /// Added by the partitioner for join keys / final ordering; staged but not returned.
    pub hidden: bool,
}

impl ColumnRef {
    /// True when this column is read from `table`.
    pub fn is_from(&self, table: &TableRef) -> bool {
        self.schema == table.schema && self.table == table.table
    }
}

/// The untransformed column carrying `table.column`, usable as a join or sort key.
pub fn key_column<'a>(columns: &'a [ColumnRef], table: &TableRef, column: &str) -> Option<&'a ColumnRef> {
    columns
        .iter()
        .find(|c| c.is_from(table) && c.column == column && c.transform.is_none())
}

/// A table reference discovered from the column list.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
    pub alias: Option<String>,
    pub source_id: SourceId,
    pub dialect: Dialect,
}

impl TableRef {
    /// Name used to qualify columns inside the source SQL.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Whether a join / filter reference names this table.
    pub fn answers_to(&self, schema: Option<&str>, name: &str) -> bool {
        if let Some(schema) = schema {
            if schema != self.schema {
                return false;
            }
        }
        self.table == name || self.alias.as_deref() == Some(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace('_', " ");
        match normalized.as_str() {
            "inner" | "inner join" | "join" => Some(Self::Inner),
            "left" | "left outer" | "left join" | "left outer join" => Some(Self::Left),
            "right" | "right outer" | "right join" | "right outer join" => Some(Self::Right),
            "full" | "full outer" | "full join" | "full outer join" | "outer" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL OUTER JOIN",
        }
    }

    /// Join type to use when the two sides are emitted in reverse order.
    pub fn mirrored(&self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            other => *other,
        }
    }
}

/// Comparison used in a join predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOperator {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "=" | "==" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::NotEq),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::LtEq),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::GtEq),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondition {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
    pub join_type: JoinType,
    pub operator: ComparisonOperator,
}

impl fmt::Display for JoinCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} {} {}.{}",
            self.left_table,
            self.left_column,
            self.operator.as_sql(),
            self.right_table,
            self.right_column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Compare(ComparisonOperator),
    Like,
    NotLike,
    ILike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    pub fn from_tag(tag: &str) -> Option<Self> {
        if let Some(op) = ComparisonOperator::from_tag(tag) {
            return Some(Self::Compare(op));
        }
        let normalized = tag.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        match normalized.as_str() {
            "LIKE" => Some(Self::Like),
            "NOT LIKE" => Some(Self::NotLike),
            "ILIKE" => Some(Self::ILike),
            "IN" => Some(Self::In),
            "NOT IN" => Some(Self::NotIn),
            "IS NULL" => Some(Self::IsNull),
            "IS NOT NULL" => Some(Self::IsNotNull),
            _ => None,
        }
    }

    /// `IS NULL` / `IS NOT NULL` ignore the filter value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connective {
    #[default]
    And,
    Or,
}

impl Connective {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_uppercase().as_str() {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// `schema.table.column` or `table.column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPath {
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

impl ColumnPath {
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [table, column] => Some(Self {
                schema: None,
                table: table.trim().to_string(),
                column: column.trim().to_string(),
            }),
            [schema, table, column] => Some(Self {
                schema: Some(schema.trim().to_string()),
                table: table.trim().to_string(),
                column: column.trim().to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}.{}", schema, self.table, self.column),
            None => write!(f, "{}.{}", self.table, self.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub column: ColumnPath,
    pub operator: FilterOperator,
    pub value: Value,
    /// Relation to the previous condition; ignored on the first one emitted.
    pub connective: Option<Connective>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnPath,
    pub direction: SortDirection,
}

/// Grouping, ordering and paging. `None` limit / offset means unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryModifiers {
    pub group_by: Vec<ColumnPath>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryModifiers {
    pub fn is_empty(&self) -> bool {
        self.group_by.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// Distinct tables in first-seen order.
    pub tables: Vec<TableRef>,
    /// Columns in input order.
    pub columns: Vec<ColumnRef>,
    pub joins: Vec<JoinCondition>,
    pub filters: Vec<FilterCondition>,
    pub modifiers: QueryModifiers,
}

impl ParsedQuery {
    /// Resolves a join / filter table name (optionally schema-qualified).
    pub fn find_table(&self, schema: Option<&str>, name: &str) -> Option<&TableRef> {
        find_table(&self.tables, schema, name)
    }

    pub fn visible_columns(&self) -> impl Iterator<Item = &ColumnRef> {
        self.columns.iter().filter(|c| !c.hidden)
    }
}

pub(crate) fn find_table<'a>(
    tables: &'a [TableRef],
    schema: Option<&str>,
    name: &str,
) -> Option<&'a TableRef> {
    tables.iter().find(|t| t.answers_to(schema, name))
}

/// Every table a reference could mean. More than one is ambiguous.
pub(crate) fn tables_named<'a>(tables: &'a [TableRef], schema: Option<&str>, name: &str) -> Vec<&'a TableRef> {
    tables.iter().filter(|t| t.answers_to(schema, name)).collect()
}

/// The portion of a federated query routed to one source.
#[derive(Debug, Clone)]
pub struct SubQuery {
    pub source_id: SourceId,
    pub dialect: Dialect,
    pub tables: Vec<TableRef>,
    pub columns: Vec<ColumnRef>,
    pub joins: Vec<JoinCondition>,
    pub filters: Vec<FilterCondition>,
    /// Only populated when the whole query lives in this source.
    pub modifiers: QueryModifiers,
}

impl SubQuery {
    pub fn find_table(&self, schema: Option<&str>, name: &str) -> Option<&TableRef> {
        find_table(&self.tables, schema, name)
    }
}

/// Where a filter ended up after partitioning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FilterResolution {
    Resolved { index: usize, source_id: SourceId },
    Unresolved { index: usize, column: String },
}

#[derive(Debug, Clone)]
pub struct Partition {
    /// One per source, in first-seen order of the table set.
    pub sub_queries: Vec<SubQuery>,
    /// Joins spanning two sources, deferred to the final join.
    pub cross_source_joins: Vec<JoinCondition>,
    pub filter_resolutions: Vec<FilterResolution>,
    pub warnings: Vec<String>,
}

/// What a staged text column holds, as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagedKind {
    #[default]
    Text,
    Numeric,
    Temporal,
}

impl StagedKind {
    /// Classifies a driver-reported type name such as `INT8`, `DECIMAL(10,2)` or `timestamptz`.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        let upper = type_name.trim().to_uppercase();
        let base = upper.split(['(', ' ']).next().unwrap_or_default();
        if base.is_empty() || base == "NULL" {
            return None;
        }
        if base.contains("INTERVAL") || base.contains("RANGE") {
            return Some(Self::Text);
        }
        const NUMERIC: &[&str] = &[
            "INT", "INTEGER", "INT2", "INT4", "INT8", "TINYINT", "SMALLINT", "MEDIUMINT", "BIGINT",
            "HUGEINT", "UTINYINT", "USMALLINT", "UINT", "UINTEGER", "UBIGINT", "REAL", "FLOAT", "FLOAT4",
            "FLOAT8", "DOUBLE", "DECIMAL", "NUMERIC", "NUMBER",
        ];
        if NUMERIC.contains(&base) || base.ends_with("SERIAL") {
            return Some(Self::Numeric);
        }
        if base.starts_with("DATE") || base.starts_with("TIME") {
            return Some(Self::Temporal);
        }
        Some(Self::Text)
    }

    /// Classifies a column from the values it actually returned.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut seen = false;
        for value in values {
            match value {
                Value::Null => {}
                Value::Int(_) | Value::Float(_) => seen = true,
                _ => return Self::Text,
            }
        }
        if seen {
            Self::Numeric
        } else {
            Self::Text
        }
    }
}

/// A sub-query result materialized in the staging store.
#[derive(Debug, Clone)]
pub struct StagedTable {
    pub name: String,
    pub source_id: SourceId,
    /// The sub-query's columns; staged column names are their canonical names.
    pub columns: Vec<ColumnRef>,
    /// Parallel to `columns`. Every staged column is text; this keeps what it held.
    pub kinds: Vec<StagedKind>,
}

impl StagedTable {
    pub fn new(name: impl Into<String>, source_id: SourceId, columns: Vec<ColumnRef>) -> Self {
        let kinds = vec![StagedKind::Text; columns.len()];
        Self {
            name: name.into(),
            source_id,
            columns,
            kinds,
        }
    }

    /// Position and kind of the untransformed column carrying `table.column`.
    pub fn key_column(&self, table: &TableRef, column: &str) -> Option<(&ColumnRef, StagedKind)> {
        let position = self
            .columns
            .iter()
            .position(|c| c.is_from(table) && c.column == column && c.transform.is_none())?;
        let kind = self.kinds.get(position).copied().unwrap_or_default();
        Some((&self.columns[position], kind))
    }
}

/// Pipeline states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Parse,
    Partition,
    ExecuteParallel,
    Stage,
    FinalJoin,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "PARSE",
            Self::Partition => "PARTITION",
            Self::ExecuteParallel => "EXECUTE_PARALLEL",
            Self::Stage => "STAGE",
            Self::FinalJoin => "FINAL_JOIN",
            Self::Cleanup => "CLEANUP",
        };
        f.write_str(name)
    }
}

/// Per-source metadata in the result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQueryReport {
    pub data_source_id: SourceId,
    pub temp_table_name: String,
    pub row_count: u64,
    pub columns: Vec<String>,
    pub execution_time_ms: u64,
}

/// Result envelope returned for every federated query, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedQueryResult {
    pub success: bool,
    pub row_count: u64,
    pub execution_time_ms: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub sub_queries: Vec<SubQueryReport>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl FederatedQueryResult {
    pub fn failure(message: impl Into<String>, execution_time_ms: u64, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            row_count: 0,
            execution_time_ms,
            columns: Vec::new(),
            rows: Vec::new(),
            sub_queries: Vec::new(),
            warnings,
            error: Some(message.into()),
        }
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Final join over staged tables.
//!
//! Only cross-source joins are applied here; same-source joins already ran
//! inside their sub-query. Join keys are resolved to the staged column that
//! carries them and referenced by canonical name. Sort keys that held numbers
//! or timestamps at the source are cast back before ordering.

use tracing::{debug, instrument, warn};

use crate::engine::dialect::Dialect;
use crate::engine::traits::Connector;
use crate::engine::types::QueryResult;

use super::error::{FederationError, FederationResult};
use super::naming::ColumnNamer;
use super::sql_builder::{plan_joins, render_from, JoinEdge, JoinStep};
use super::types::{ColumnPath, JoinCondition, ParsedQuery, StagedKind, StagedTable, TableRef};

/// Final SQL plus anything the caller should hear about.
#[derive(Debug, Clone)]
pub struct FinalJoin {
    pub sql: String,
    pub warnings: Vec<String>,
}

pub struct FinalJoinBuilder<'a> {
    query: &'a ParsedQuery,
    staged: &'a [StagedTable],
    namer: &'a ColumnNamer,
    dialect: Dialect,
}

impl<'a> FinalJoinBuilder<'a> {
    pub fn new(query: &'a ParsedQuery, staged: &'a [StagedTable], namer: &'a ColumnNamer, dialect: Dialect) -> Self {
        Self {
            query,
            staged,
            namer,
            dialect,
        }
    }

    pub fn build(&self, cross_source_joins: &[JoinCondition]) -> FederationResult<FinalJoin> {
        match self.staged {
            [] => Err(FederationError::join("no staged tables to join")),
            [only] => Ok(FinalJoin {
                sql: format!("SELECT * FROM {}", self.dialect.quote_ident(&only.name)),
                warnings: Vec::new(),
            }),
            _ => self.build_multi(cross_source_joins),
        }
    }

    fn build_multi(&self, cross_source_joins: &[JoinCondition]) -> FederationResult<FinalJoin> {
        let d = self.dialect;
        let mut warnings = Vec::new();

        let select_list = self
            .query
            .visible_columns()
            .map(|column| {
                let idx = self.staged_index(column.source_id.as_str()).ok_or_else(|| {
                    FederationError::join(format!(
                        "column {}.{} has no staged table for source {}",
                        column.table, column.column, column.source_id
                    ))
                })?;
                let name = self.namer.canonical(column);
                Ok(format!(
                    "{}.{} AS {}",
                    d.quote_ident(&self.staged[idx].name),
                    d.quote_ident(&name),
                    d.quote_ident(&name)
                ))
            })
            .collect::<FederationResult<Vec<_>>>()?;

        let mut edges = Vec::with_capacity(cross_source_joins.len());
        for join in cross_source_joins {
            let (left, left_ref, _) = self.resolve_key(None, &join.left_table, &join.left_column)?;
            let (right, right_ref, _) = self.resolve_key(None, &join.right_table, &join.right_column)?;
            if left == right {
                debug!(join = %join, "skipping same-source join at final stage");
                continue;
            }
            edges.push(JoinEdge {
                left,
                right,
                join_type: join.join_type,
                predicate: format!("{} {} {}", left_ref, join.operator.as_sql(), right_ref),
            });
        }

        let steps = plan_joins(self.staged.len(), &edges);
        for step in &steps {
            if let JoinStep::Cross { node } = step {
                let table = &self.staged[*node];
                warn!(table = %table.name, source_id = %table.source_id, "no join condition reaches staged table");
                warnings.push(format!(
                    "no join condition connects source {}; its rows were cross joined",
                    table.source_id
                ));
            }
        }

        let mut sql = format!("SELECT {} ", select_list.join(", "));
        sql.push_str(&render_from(&steps, |idx| d.quote_ident(&self.staged[idx].name)));

        let modifiers = &self.query.modifiers;
        if !modifiers.order_by.is_empty() {
            let parts = modifiers
                .order_by
                .iter()
                .map(|o| {
                    self.resolve_path(&o.column)
                        .map(|key| format!("{} {}", key, o.direction.as_sql()))
                })
                .collect::<FederationResult<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", parts.join(", ")));
        }
        if let Some(paging) = d.paging_clause(modifiers.limit, modifiers.offset) {
            sql.push(' ');
            sql.push_str(&paging);
        }

        Ok(FinalJoin { sql, warnings })
    }

    fn staged_index(&self, source_id: &str) -> Option<usize> {
        self.staged.iter().position(|s| s.source_id.as_str() == source_id)
    }

    /// Sort expression for an ORDER BY path.
    fn resolve_path(&self, path: &ColumnPath) -> FederationResult<String> {
        let (_, key, kind) = self.resolve_key(path.schema.as_deref(), &path.table, &path.column)?;
        Ok(match kind {
            StagedKind::Text => key,
            StagedKind::Numeric => self.dialect.numeric_sort_key(&key),
            StagedKind::Temporal => self.dialect.temporal_sort_key(&key),
        })
    }

    /// `(staged table index, "staged"."canonical", kind)` for `table.column`.
    fn resolve_key(
        &self,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> FederationResult<(usize, String, StagedKind)> {
        let table_ref: &TableRef = self
            .query
            .find_table(schema, table)
            .ok_or_else(|| FederationError::join(format!("table '{table}' is not part of the query")))?;
        let idx = self
            .staged_index(table_ref.source_id.as_str())
            .ok_or_else(|| FederationError::join(format!("source {} was not staged", table_ref.source_id)))?;
        let staged = &self.staged[idx];
        let (key, kind) = staged.key_column(table_ref, column).ok_or_else(|| {
            FederationError::join(format!(
                "column {table}.{column} is not available in staged table '{}'",
                staged.name
            ))
        })?;
        Ok((
            idx,
            format!(
                "{}.{}",
                self.dialect.quote_ident(&staged.name),
                self.dialect.quote_ident(&self.namer.canonical(key))
            ),
            kind,
        ))
    }
}

/// Runs the final SQL against the staging store.
#[instrument(skip(conn, sql))]
pub async fn execute_final_join(conn: &dyn Connector, sql: &str) -> FederationResult<QueryResult> {
    debug!(sql = %sql, "executing final join");
    conn.query(sql)
        .await
        .map_err(|e| FederationError::join(format!("final join failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::SourceId;
    use crate::federation::parser::parse_query;
    use crate::federation::partitioner::partition;
    use crate::federation::types::Partition;
    use serde_json::json;

    fn plan(raw: serde_json::Value) -> (ParsedQuery, Partition, Vec<StagedTable>) {
        let namer = ColumnNamer::default();
        let query = parse_query(&raw, &namer).unwrap();
        let partition = partition(&query, &namer, true).unwrap();
        let staged = partition
            .sub_queries
            .iter()
            .enumerate()
            .map(|(i, sub)| StagedTable::new(format!("fed_{}_{}", sub.source_id, i), sub.source_id.clone(), sub.columns.clone()))
            .collect();
        (query, partition, staged)
    }

    fn sessions_and_users(join_type: &str) -> serde_json::Value {
        json!({
            "columns": [
                {"schema": "ga", "table": "sessions_42", "column": "session_count",
                 "dataSourceId": 1, "dataSourceType": "postgres"},
                {"schema": "public", "table": "users", "column": "user_id",
                 "dataSourceId": 2, "dataSourceType": "mysql"}
            ],
            "joins": [{"leftTable": "sessions_42", "leftColumn": "user_ref",
                       "rightTable": "users", "rightColumn": "id",
                       "joinType": join_type, "operator": "="}]
        })
    }

    #[test]
    fn single_staged_table_is_selected_verbatim() {
        let (query, partition, staged) = plan(json!({
            "columns": [
                {"schema": "public", "table": "users", "column": "id",
                 "dataSourceId": 1, "dataSourceType": "postgres"}
            ],
            "options": {"limit": 10}
        }));
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert_eq!(join.sql, "SELECT * FROM \"fed_1_0\"");
        assert!(!join.sql.contains("JOIN"));
    }

    #[test]
    fn cross_source_join_uses_canonical_key_names() {
        let (query, partition, staged) = plan(sessions_and_users("inner"));
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();

        assert_eq!(
            join.sql,
            "SELECT \"fed_1_0\".\"sessions_42_session_count\" AS \"sessions_42_session_count\", \
             \"fed_2_1\".\"public_users_user_id\" AS \"public_users_user_id\" \
             FROM \"fed_1_0\" INNER JOIN \"fed_2_1\" \
             ON \"fed_1_0\".\"sessions_42_user_ref\" = \"fed_2_1\".\"public_users_id\""
        );
        assert!(join.warnings.is_empty());
    }

    #[test]
    fn left_joins_mirror_when_anchor_is_the_right_side() {
        let raw = json!({
            "columns": [
                {"schema": "public", "table": "users", "column": "user_id",
                 "dataSourceId": 2, "dataSourceType": "mysql"},
                {"schema": "ga", "table": "sessions_42", "column": "session_count",
                 "dataSourceId": 1, "dataSourceType": "postgres"}
            ],
            "joins": [{"leftTable": "sessions_42", "leftColumn": "user_ref",
                       "rightTable": "users", "rightColumn": "id",
                       "joinType": "left", "operator": "="}]
        });
        let (query, partition, staged) = plan(raw);
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert!(join.sql.contains("FROM \"fed_2_0\" RIGHT JOIN \"fed_1_1\""));
    }

    #[test]
    fn second_join_between_same_tables_is_anded() {
        let raw = json!({
            "columns": [
                {"schema": "public", "table": "orders", "column": "total",
                 "dataSourceId": 1, "dataSourceType": "postgres"},
                {"schema": "public", "table": "users", "column": "name",
                 "dataSourceId": 2, "dataSourceType": "sqlite"}
            ],
            "joins": [
                {"leftTable": "orders", "leftColumn": "user_id", "rightTable": "users",
                 "rightColumn": "id", "joinType": "inner", "operator": "="},
                {"leftTable": "orders", "leftColumn": "region", "rightTable": "users",
                 "rightColumn": "region", "joinType": "inner", "operator": "="}
            ]
        });
        let (query, partition, staged) = plan(raw);
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert!(join.sql.contains(
            "ON \"fed_1_0\".\"public_orders_user_id\" = \"fed_2_1\".\"public_users_id\" \
             AND \"fed_1_0\".\"public_orders_region\" = \"fed_2_1\".\"public_users_region\""
        ));
        assert_eq!(join.sql.matches("JOIN").count(), 1);
    }

    #[test]
    fn unconnected_sources_are_cross_joined_with_warning() {
        let raw = json!({
            "columns": [
                {"schema": "public", "table": "orders", "column": "total",
                 "dataSourceId": 1, "dataSourceType": "postgres"},
                {"schema": "public", "table": "users", "column": "name",
                 "dataSourceId": 2, "dataSourceType": "sqlite"}
            ]
        });
        let (query, partition, staged) = plan(raw);
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert!(join.sql.ends_with("FROM \"fed_1_0\" CROSS JOIN \"fed_2_1\""));
        assert_eq!(join.warnings.len(), 1);
    }

    #[test]
    fn multi_source_ordering_and_paging_apply_here() {
        let mut raw = sessions_and_users("inner");
        raw["options"] = json!({
            "orderBy": [{"column": "public.users.signup_date", "direction": "DESC"}],
            "limit": 5,
            "offset": 10
        });
        let (query, partition, staged) = plan(raw);
        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert!(join
            .sql
            .ends_with("ORDER BY \"fed_2_1\".\"public_users_signup_date\" DESC LIMIT 5 OFFSET 10"));
        // Hidden sort key is staged but not projected.
        assert!(!join.sql.contains("AS \"public_users_signup_date\""));
    }

    #[test]
    fn numeric_and_temporal_sort_keys_are_cast() {
        let mut raw = sessions_and_users("inner");
        raw["options"] = json!({
            "orderBy": [
                {"column": "ga.sessions_42.session_count", "direction": "ASC"},
                {"column": "public.users.signup_date", "direction": "DESC"},
                {"column": "public.users.user_id", "direction": "ASC"}
            ],
            "limit": 1
        });
        let (query, partition, mut staged) = plan(raw);
        for table in &mut staged {
            table.kinds = table
                .columns
                .iter()
                .map(|c| match c.column.as_str() {
                    "session_count" => StagedKind::Numeric,
                    "signup_date" => StagedKind::Temporal,
                    _ => StagedKind::Text,
                })
                .collect();
        }

        let namer = ColumnNamer::default();
        let join = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap();
        assert!(join.sql.ends_with(
            "ORDER BY TRY_CAST(\"fed_1_0\".\"sessions_42_session_count\" AS DOUBLE) ASC, \
             TRY_CAST(\"fed_2_1\".\"public_users_signup_date\" AS TIMESTAMP) DESC, \
             \"fed_2_1\".\"public_users_user_id\" ASC LIMIT 1"
        ));
    }

    #[test]
    fn unresolvable_join_column_is_a_join_error() {
        let (query, partition, mut staged) = plan(sessions_and_users("inner"));
        staged[1].columns.retain(|c| !c.hidden);
        let namer = ColumnNamer::default();
        let err = FinalJoinBuilder::new(&query, &staged, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap_err();
        assert!(matches!(err, FederationError::Join { .. }));
        assert!(err.to_string().contains("users.id"));
    }

    #[test]
    fn missing_staged_table_is_a_join_error() {
        let (query, partition, staged) = plan(sessions_and_users("inner"));
        let only_first: Vec<StagedTable> = staged
            .into_iter()
            .filter(|s| s.source_id == SourceId::new("1"))
            .chain(std::iter::once(StagedTable::new("fed_9_9", SourceId::new("9"), Vec::new())))
            .collect();
        let namer = ColumnNamer::default();
        let err = FinalJoinBuilder::new(&query, &only_first, &namer, Dialect::DuckDb)
            .build(&partition.cross_source_joins)
            .unwrap_err();
        assert!(matches!(err, FederationError::Join { .. }));
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Query partitioner.
//!
//! Splits a [`ParsedQuery`] into one [`SubQuery`] per source. Joins whose two
//! tables share a source stay inside that source's sub-query; joins spanning
//! sources are deferred to the final join, and their key columns are added to
//! each side's sub-query as hidden columns so the staged tables carry them.
//!
//! Every filter gets an explicit [`FilterResolution`]. Unresolved filters fail
//! the query when `strict_filters` is on, otherwise they are dropped and
//! reported as warnings.

use tracing::{debug, warn};

use super::error::{FederationError, FederationResult};
use super::naming::ColumnNamer;
use super::types::{
    key_column, tables_named, ColumnPath, ColumnRef, Connective, FilterResolution, ParsedQuery,
    Partition, SubQuery, TableRef,
};

pub fn partition(
    query: &ParsedQuery,
    namer: &ColumnNamer,
    strict_filters: bool,
) -> FederationResult<Partition> {
    let mut sub_queries = group_by_source(query)?;
    let mut cross_source_joins = Vec::new();
    let mut warnings = Vec::new();

    for join in &query.joins {
        let left = resolve_table(query, None, &join.left_table)?;
        let right = resolve_table(query, None, &join.right_table)?;

        if left.source_id == right.source_id {
            sub_query_for(&mut sub_queries, left)?.joins.push(join.clone());
            continue;
        }

        debug!(join = %join, "deferring cross-source join");
        add_key_column(sub_query_for(&mut sub_queries, left)?, left, &join.left_column, namer);
        add_key_column(sub_query_for(&mut sub_queries, right)?, right, &join.right_column, namer);
        cross_source_joins.push(join.clone());
    }

    let mut filter_resolutions = Vec::with_capacity(query.filters.len());
    let mut previous_source = None;
    for (index, filter) in query.filters.iter().enumerate() {
        let candidates = tables_named(&query.tables, filter.column.schema.as_deref(), &filter.column.table);
        if candidates.len() > 1 {
            return Err(FederationError::partition(format!(
                "filter #{index} on '{}' is ambiguous: {} selected tables answer to '{}'; qualify it with a schema or tableAlias",
                filter.column,
                candidates.len(),
                filter.column.table
            )));
        }
        let Some(table) = candidates.first().copied() else {
            let message = format!(
                "filter #{index} on '{}' does not match any selected table",
                filter.column
            );
            if strict_filters {
                return Err(FederationError::partition(message));
            }
            warn!(filter = %filter.column, "dropping unresolved filter");
            warnings.push(format!("{message}; it was dropped"));
            filter_resolutions.push(FilterResolution::Unresolved {
                index,
                column: filter.column.to_string(),
            });
            continue;
        };

        if filter.connective == Some(Connective::Or)
            && previous_source.is_some_and(|prev| prev != &table.source_id)
        {
            let message = format!(
                "filter #{index} on '{}' is ORed with a filter on another source; each source applies its own filters independently",
                filter.column
            );
            warn!(filter = %filter.column, "OR across sources cannot be honored");
            warnings.push(message);
        }
        previous_source = Some(&table.source_id);

        sub_query_for(&mut sub_queries, table)?.filters.push(filter.clone());
        filter_resolutions.push(FilterResolution::Resolved {
            index,
            source_id: table.source_id.clone(),
        });
    }

    let modifiers = &query.modifiers;
    if sub_queries.len() == 1 {
        sub_queries[0].modifiers = modifiers.clone();
    } else {
        if !modifiers.group_by.is_empty() {
            return Err(FederationError::partition(
                "groupBy is only supported when every table lives in one source",
            ));
        }
        for order in &modifiers.order_by {
            let table = resolve_path_table(query, &order.column)?;
            add_key_column(sub_query_for(&mut sub_queries, table)?, table, &order.column.column, namer);
        }
    }

    Ok(Partition {
        sub_queries,
        cross_source_joins,
        filter_resolutions,
        warnings,
    })
}

/// One sub-query per source, in first-seen table order.
fn group_by_source(query: &ParsedQuery) -> FederationResult<Vec<SubQuery>> {
    let mut sub_queries: Vec<SubQuery> = Vec::new();

    for table in &query.tables {
        match sub_queries.iter_mut().find(|s| s.source_id == table.source_id) {
            Some(sub) if sub.dialect != table.dialect => {
                return Err(FederationError::partition(format!(
                    "source {} is tagged both {} and {}",
                    table.source_id, sub.dialect, table.dialect
                )));
            }
            Some(sub) => sub.tables.push(table.clone()),
            None => sub_queries.push(SubQuery {
                source_id: table.source_id.clone(),
                dialect: table.dialect,
                tables: vec![table.clone()],
                columns: Vec::new(),
                joins: Vec::new(),
                filters: Vec::new(),
                modifiers: Default::default(),
            }),
        }
    }

    for column in &query.columns {
        let sub = sub_queries
            .iter_mut()
            .find(|s| s.source_id == column.source_id)
            .ok_or_else(|| {
                FederationError::partition(format!(
                    "column {}.{} belongs to unknown source {}",
                    column.table, column.column, column.source_id
                ))
            })?;
        sub.columns.push(column.clone());
    }

    Ok(sub_queries)
}

fn resolve_table<'a>(query: &'a ParsedQuery, schema: Option<&str>, name: &str) -> FederationResult<&'a TableRef> {
    query
        .find_table(schema, name)
        .ok_or_else(|| FederationError::partition(format!("table '{name}' is not part of the query")))
}

fn resolve_path_table<'a>(query: &'a ParsedQuery, path: &ColumnPath) -> FederationResult<&'a TableRef> {
    resolve_table(query, path.schema.as_deref(), &path.table)
}

fn sub_query_for<'a>(sub_queries: &'a mut [SubQuery], table: &TableRef) -> FederationResult<&'a mut SubQuery> {
    sub_queries
        .iter_mut()
        .find(|s| s.source_id == table.source_id)
        .ok_or_else(|| FederationError::partition(format!("no sub-query for source {}", table.source_id)))
}

/// Makes sure the sub-query stages `table.column` untransformed.
fn add_key_column(sub: &mut SubQuery, table: &TableRef, column: &str, namer: &ColumnNamer) {
    if key_column(&sub.columns, table, column).is_some() {
        return;
    }

    let mut hidden = ColumnRef {
        schema: table.schema.clone(),
        table: table.table.clone(),
        column: column.to_string(),
        alias: None,
        table_alias: table.alias.clone(),
        source_id: table.source_id.clone(),
        dialect: table.dialect,
        transform: None,
        hidden: true,
    };

    // A transformed visible column may already own the derived name.
    let mut name = namer.canonical(&hidden);
    while sub.columns.iter().any(|c| namer.canonical(c) == name) {
        name.push_str("__key");
        hidden.alias = Some(name.clone());
    }

    debug!(source_id = %sub.source_id, column = %name, "adding hidden key column");
    sub.columns.push(hidden);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::SourceId;
    use crate::federation::parser::parse_query;
    use serde_json::json;

    fn parse(raw: serde_json::Value) -> ParsedQuery {
        parse_query(&raw, &ColumnNamer::default()).unwrap()
    }

    fn col(schema: &str, table: &str, column: &str, source: u32, kind: &str) -> serde_json::Value {
        json!({"schema": schema, "table": table, "column": column,
               "dataSourceId": source, "dataSourceType": kind})
    }

    fn three_tables_two_sources() -> serde_json::Value {
        json!({
            "columns": [
                col("public", "users", "name", 1, "postgres"),
                col("public", "orders", "total", 1, "postgres"),
                col("ga", "sessions_42", "session_count", 2, "duckdb"),
            ],
            "joins": [
                {"leftTable": "orders", "leftColumn": "user_id", "rightTable": "users", "rightColumn": "id"},
                {"leftTable": "sessions_42", "leftColumn": "user_ref", "rightTable": "users", "rightColumn": "id"}
            ]
        })
    }

    #[test]
    fn same_source_joins_stay_inside_sub_queries() {
        let query = parse(three_tables_two_sources());
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        assert_eq!(partition.sub_queries.len(), 2);
        assert_eq!(partition.sub_queries[0].source_id, SourceId::new("1"));
        assert_eq!(partition.sub_queries[0].joins.len(), 1);
        assert_eq!(partition.sub_queries[0].joins[0].left_table, "orders");
        assert!(partition.sub_queries[1].joins.is_empty());

        assert_eq!(partition.cross_source_joins.len(), 1);
        assert_eq!(partition.cross_source_joins[0].left_table, "sessions_42");
    }

    #[test]
    fn cross_source_join_keys_are_added_hidden() {
        let query = parse(three_tables_two_sources());
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        let pg = &partition.sub_queries[0];
        let hidden: Vec<&str> = pg.columns.iter().filter(|c| c.hidden).map(|c| c.column.as_str()).collect();
        assert_eq!(hidden, vec!["id"]);

        let ga = &partition.sub_queries[1];
        let hidden: Vec<&str> = ga.columns.iter().filter(|c| c.hidden).map(|c| c.column.as_str()).collect();
        assert_eq!(hidden, vec!["user_ref"]);
    }

    #[test]
    fn existing_key_columns_are_reused() {
        let mut raw = three_tables_two_sources();
        raw["columns"]
            .as_array_mut()
            .unwrap()
            .push(col("public", "users", "id", 1, "postgres"));
        let query = parse(raw);
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        assert!(partition.sub_queries[0].columns.iter().all(|c| !c.hidden));
    }

    #[test]
    fn filters_are_routed_by_table() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"where": [
            {"column": "users.name", "operator": "=", "value": "ada"},
            {"column": "ga.sessions_42.session_count", "operator": ">", "value": 3}
        ]});
        let query = parse(raw);
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        assert_eq!(partition.sub_queries[0].filters.len(), 1);
        assert_eq!(partition.sub_queries[1].filters.len(), 1);
        assert_eq!(
            partition.filter_resolutions[1],
            FilterResolution::Resolved { index: 1, source_id: SourceId::new("2") }
        );
        assert!(partition.warnings.is_empty());
    }

    #[test]
    fn unresolved_filters_fail_in_strict_mode() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"where": [{"column": "accounts.id", "operator": "=", "value": 1}]});
        let query = parse(raw);

        let err = partition(&query, &ColumnNamer::default(), true).unwrap_err();
        assert!(matches!(err, FederationError::Partition { .. }));
        assert!(err.to_string().contains("accounts.id"));
    }

    #[test]
    fn filters_on_a_shared_table_name_must_be_qualified() {
        let raw = |path: &str| {
            json!({
                "columns": [
                    col("public", "users", "name", 1, "postgres"),
                    col("crm", "users", "email", 2, "mysql"),
                ],
                "options": {"where": [{"column": path, "operator": "=", "value": "ada"}]}
            })
        };

        let err = partition(&parse(raw("users.name")), &ColumnNamer::default(), false).unwrap_err();
        assert!(matches!(err, FederationError::Partition { .. }));
        assert!(err.to_string().contains("ambiguous"), "{err}");

        let partition = partition(&parse(raw("crm.users.email")), &ColumnNamer::default(), true).unwrap();
        assert_eq!(partition.sub_queries[1].filters.len(), 1);
        assert!(partition.sub_queries[0].filters.is_empty());
    }

    #[test]
    fn unresolved_filters_are_reported_when_lenient() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"where": [{"column": "accounts.id", "operator": "=", "value": 1}]});
        let query = parse(raw);

        let partition = partition(&query, &ColumnNamer::default(), false).unwrap();
        assert!(partition.sub_queries.iter().all(|s| s.filters.is_empty()));
        assert_eq!(
            partition.filter_resolutions,
            vec![FilterResolution::Unresolved { index: 0, column: "accounts.id".into() }]
        );
        assert_eq!(partition.warnings.len(), 1);
    }

    #[test]
    fn or_across_sources_is_warned() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"where": [
            {"column": "users.name", "operator": "=", "value": "ada"},
            {"column": "sessions_42.session_count", "operator": ">", "value": 3, "connective": "OR"}
        ]});
        let query = parse(raw);
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();
        assert_eq!(partition.warnings.len(), 1);
        assert!(partition.warnings[0].contains("ORed"));
    }

    #[test]
    fn single_source_pushes_modifiers_down() {
        let query = parse(json!({
            "columns": [col("public", "users", "name", 1, "postgres")],
            "options": {"orderBy": ["users.name"], "groupBy": ["users.name"], "limit": 10}
        }));
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();
        assert_eq!(partition.sub_queries.len(), 1);
        assert_eq!(partition.sub_queries[0].modifiers, query.modifiers);
        assert!(partition.cross_source_joins.is_empty());
    }

    #[test]
    fn multi_source_group_by_is_rejected() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"groupBy": ["users.name"]});
        let query = parse(raw);
        assert!(partition(&query, &ColumnNamer::default(), true).is_err());
    }

    #[test]
    fn multi_source_order_by_stages_sort_key() {
        let mut raw = three_tables_two_sources();
        raw["options"] = json!({"orderBy": ["sessions_42.day"], "limit": 5});
        let query = parse(raw);
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        let ga = &partition.sub_queries[1];
        assert!(ga.columns.iter().any(|c| c.hidden && c.column == "day"));
        assert!(ga.modifiers.is_empty());
    }

    #[test]
    fn conflicting_dialect_tags_are_rejected() {
        let query = parse(json!({
            "columns": [
                col("public", "users", "name", 1, "postgres"),
                col("public", "orders", "total", 1, "mysql")
            ]
        }));
        assert!(partition(&query, &ColumnNamer::default(), true).is_err());
    }

    #[test]
    fn hidden_key_avoids_name_collisions() {
        let mut raw = three_tables_two_sources();
        raw["columns"]
            .as_array_mut()
            .unwrap()
            .push(json!({"schema": "public", "table": "users", "column": "id", "transform": "MD5",
                         "dataSourceId": 1, "dataSourceType": "postgres"}));
        let query = parse(raw);
        let partition = partition(&query, &ColumnNamer::default(), true).unwrap();

        let hidden = partition.sub_queries[0].columns.iter().find(|c| c.hidden).unwrap();
        assert_eq!(hidden.alias.as_deref(), Some("public_users_id__key"));
    }
}

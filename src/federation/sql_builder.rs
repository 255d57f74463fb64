// SPDX-License-Identifier: Apache-2.0

//! Sub-query SQL builder.
//!
//! Renders one [`SubQuery`] as a single `SELECT` in the source's dialect:
//!
//! ```text
//! SELECT <expr> AS "<canonical>", ...
//! FROM <first table> [AS alias]
//! [<type> JOIN <table> ON <predicate> [AND <predicate>]]...
//! [WHERE <cond> [AND|OR <cond>]...]
//! [GROUP BY ...] [ORDER BY ...] [LIMIT/OFFSET]
//! ```
//!
//! The join planner in this module is shared with the final join, which
//! arranges staged tables the same way.

use tracing::warn;

use crate::engine::dialect::Dialect;

use super::error::{FederationError, FederationResult};
use super::naming::ColumnNamer;
use super::types::{ColumnPath, ColumnRef, FilterCondition, FilterOperator, JoinType, SubQuery, TableRef};

/// A join between two nodes (tables) with its rendered predicate.
#[derive(Debug, Clone)]
pub(crate) struct JoinEdge {
    pub left: usize,
    pub right: usize,
    pub join_type: JoinType,
    pub predicate: String,
}

/// One FROM-clause step after the anchor (node 0).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JoinStep {
    Join {
        node: usize,
        join_type: JoinType,
        predicates: Vec<String>,
    },
    Cross {
        node: usize,
    },
}

/// Orders joins so every ON clause only references tables already in scope.
///
/// Edges are taken in list order; an edge whose sides are both out of scope is
/// retried after the others. When nothing connects, the left side of the first
/// pending edge is cross joined. A second edge between two tables already in
/// scope is ANDed onto the step that introduced the later of the two. Nodes no
/// edge reaches are cross joined at the end, in node order.
pub(crate) fn plan_joins(node_count: usize, edges: &[JoinEdge]) -> Vec<JoinStep> {
    if node_count == 0 {
        return Vec::new();
    }

    let mut steps: Vec<JoinStep> = Vec::new();
    let mut step_of: Vec<Option<usize>> = vec![None; node_count];
    let mut in_scope = vec![false; node_count];
    in_scope[0] = true;

    let mut pending: Vec<&JoinEdge> = edges.iter().collect();
    while !pending.is_empty() {
        let mut deferred = Vec::new();
        let mut progressed = false;

        for edge in pending {
            match (in_scope[edge.left], in_scope[edge.right]) {
                (true, false) | (false, true) => {
                    let (node, join_type) = if in_scope[edge.left] {
                        (edge.right, edge.join_type)
                    } else {
                        (edge.left, edge.join_type.mirrored())
                    };
                    step_of[node] = Some(steps.len());
                    in_scope[node] = true;
                    steps.push(JoinStep::Join {
                        node,
                        join_type,
                        predicates: vec![edge.predicate.clone()],
                    });
                    progressed = true;
                }
                (true, true) => {
                    let later = step_of[edge.left].max(step_of[edge.right]);
                    if let Some(idx) = later {
                        attach_predicate(&mut steps[idx], edge.predicate.clone());
                    }
                    progressed = true;
                }
                (false, false) => deferred.push(edge),
            }
        }

        if !progressed {
            if let Some(first) = deferred.first() {
                step_of[first.left] = Some(steps.len());
                in_scope[first.left] = true;
                steps.push(JoinStep::Cross { node: first.left });
            }
        }
        pending = deferred;
    }

    for node in 1..node_count {
        if !in_scope[node] {
            steps.push(JoinStep::Cross { node });
        }
    }

    steps
}

fn attach_predicate(step: &mut JoinStep, predicate: String) {
    match step {
        JoinStep::Join { predicates, .. } => predicates.push(predicate),
        JoinStep::Cross { node } => {
            *step = JoinStep::Join {
                node: *node,
                join_type: JoinType::Inner,
                predicates: vec![predicate],
            }
        }
    }
}

/// Renders the FROM clause for `steps`, using `render_node` for each table.
pub(crate) fn render_from(steps: &[JoinStep], render_node: impl Fn(usize) -> String) -> String {
    let mut sql = format!("FROM {}", render_node(0));
    for step in steps {
        match step {
            JoinStep::Join {
                node,
                join_type,
                predicates,
            } => {
                sql.push_str(&format!(
                    " {} {} ON {}",
                    join_type.as_sql(),
                    render_node(*node),
                    predicates.join(" AND ")
                ));
            }
            JoinStep::Cross { node } => {
                sql.push_str(&format!(" CROSS JOIN {}", render_node(*node)));
            }
        }
    }
    sql
}

/// Builds the source-dialect SQL for one sub-query.
pub fn build_sub_query_sql(sub: &SubQuery, namer: &ColumnNamer) -> FederationResult<String> {
    let dialect = sub.dialect;
    if sub.tables.is_empty() || sub.columns.is_empty() {
        return Err(FederationError::partition(format!(
            "sub-query for source {} has no tables or columns",
            sub.source_id
        )));
    }

    let select_list: Vec<String> = sub
        .columns
        .iter()
        .map(|column| {
            let qualifier = column
                .table_alias
                .as_deref()
                .unwrap_or(&column.table);
            format!(
                "{} AS {}",
                column_expression(dialect, qualifier, column),
                dialect.quote_ident(&namer.canonical(column))
            )
        })
        .collect();

    let mut edges = Vec::with_capacity(sub.joins.len());
    for join in &sub.joins {
        let left = table_index(&sub.tables, &join.left_table)?;
        let right = table_index(&sub.tables, &join.right_table)?;
        edges.push(JoinEdge {
            left,
            right,
            join_type: join.join_type,
            predicate: format!(
                "{} {} {}",
                qualified_column(dialect, &sub.tables[left], &join.left_column),
                join.operator.as_sql(),
                qualified_column(dialect, &sub.tables[right], &join.right_column)
            ),
        });
    }

    let steps = plan_joins(sub.tables.len(), &edges);
    for step in &steps {
        if let JoinStep::Cross { node } = step {
            warn!(
                source_id = %sub.source_id,
                table = %sub.tables[*node].table,
                "no join condition reaches table; emitting CROSS JOIN"
            );
        }
    }

    let mut sql = format!("SELECT {} ", select_list.join(", "));
    sql.push_str(&render_from(&steps, |idx| table_source(dialect, &sub.tables[idx])));

    if let Some(where_clause) = render_where(dialect, sub)? {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }

    let modifiers = &sub.modifiers;
    if !modifiers.group_by.is_empty() {
        let parts = modifiers
            .group_by
            .iter()
            .map(|path| path_expression(dialect, sub, path))
            .collect::<FederationResult<Vec<_>>>()?;
        sql.push_str(&format!(" GROUP BY {}", parts.join(", ")));
    }

    if !modifiers.order_by.is_empty() {
        let parts = modifiers
            .order_by
            .iter()
            .map(|o| {
                path_expression(dialect, sub, &o.column)
                    .map(|expr| format!("{} {}", expr, o.direction.as_sql()))
            })
            .collect::<FederationResult<Vec<_>>>()?;
        sql.push_str(&format!(" ORDER BY {}", parts.join(", ")));
    }

    if let Some(paging) = dialect.paging_clause(modifiers.limit, modifiers.offset) {
        sql.push(' ');
        sql.push_str(&paging);
    }

    Ok(sql)
}

/// `schema.table [AS alias]` for the FROM clause.
fn table_source(dialect: Dialect, table: &TableRef) -> String {
    let name = dialect.qualified_table(&table.schema, &table.table);
    match &table.alias {
        Some(alias) => format!("{} AS {}", name, dialect.quote_ident(alias)),
        None => name,
    }
}

fn qualified_column(dialect: Dialect, table: &TableRef, column: &str) -> String {
    format!(
        "{}.{}",
        dialect.quote_ident(table.qualifier()),
        dialect.quote_ident(column)
    )
}

fn column_expression(dialect: Dialect, qualifier: &str, column: &ColumnRef) -> String {
    let reference = format!(
        "{}.{}",
        dialect.quote_ident(qualifier),
        dialect.quote_ident(&column.column)
    );
    match column.transform.as_deref().map(str::trim) {
        Some(template) if template.contains("{column}") => template.replace("{column}", &reference),
        Some(function) if !function.is_empty() => format!("{function}({reference})"),
        _ => reference,
    }
}

fn table_index(tables: &[TableRef], name: &str) -> FederationResult<usize> {
    tables
        .iter()
        .position(|t| t.answers_to(None, name))
        .ok_or_else(|| FederationError::partition(format!("join references unknown table '{name}'")))
}

fn path_expression(dialect: Dialect, sub: &SubQuery, path: &ColumnPath) -> FederationResult<String> {
    let table = sub
        .find_table(path.schema.as_deref(), &path.table)
        .ok_or_else(|| FederationError::partition(format!("'{path}' does not belong to source {}", sub.source_id)))?;
    Ok(qualified_column(dialect, table, &path.column))
}

/// First condition has no connective; later ones use their own (AND by default).
fn render_where(dialect: Dialect, sub: &SubQuery) -> FederationResult<Option<String>> {
    if sub.filters.is_empty() {
        return Ok(None);
    }

    let mut clause = String::new();
    for (i, filter) in sub.filters.iter().enumerate() {
        if i > 0 {
            clause.push(' ');
            clause.push_str(filter.connective.unwrap_or_default().as_sql());
            clause.push(' ');
        }
        clause.push_str(&render_condition(dialect, sub, filter)?);
    }
    Ok(Some(clause))
}

fn render_condition(dialect: Dialect, sub: &SubQuery, filter: &FilterCondition) -> FederationResult<String> {
    let column = path_expression(dialect, sub, &filter.column)?;
    let value = dialect.literal(&filter.value);

    Ok(match filter.operator {
        FilterOperator::Compare(op) => format!("{column} {} {value}", op.as_sql()),
        FilterOperator::Like => format!("{column} LIKE {value}"),
        FilterOperator::NotLike => format!("{column} NOT LIKE {value}"),
        FilterOperator::ILike => match dialect {
            Dialect::Postgres | Dialect::DuckDb => format!("{column} ILIKE {value}"),
            Dialect::MySql | Dialect::Sqlite => format!("LOWER({column}) LIKE LOWER({value})"),
        },
        FilterOperator::In => format!("{column} IN {value}"),
        FilterOperator::NotIn => format!("{column} NOT IN {value}"),
        FilterOperator::IsNull => format!("{column} IS NULL"),
        FilterOperator::IsNotNull => format!("{column} IS NOT NULL"),
    })
}

// SPDX-License-Identifier: Apache-2.0

//! End-to-end federated queries over SQLite sources with DuckDB staging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use qore_federation::engine::drivers::duckdb::DuckDbDriver;
use qore_federation::engine::drivers::sqlite::SqliteDriver;
use qore_federation::engine::{
    ColumnInfo, ConnectionConfig, Connector, Dialect, DriverRegistry, EngineError, EngineResult, QueryResult,
    Row, SourceDriver, SourceId, Value,
};
use qore_federation::{FederationConfig, FederationEngine};

/// Behaviour of the fake Postgres source.
#[derive(Clone, Copy)]
enum Fake {
    Fail,
    Slow(u64),
    WrongShape,
}

struct FakeDriver(Fake);
struct FakeConnector(Fake);

#[async_trait]
impl SourceDriver for FakeDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn driver_name(&self) -> &'static str {
        "fake-postgres"
    }

    async fn connect(&self, _config: &ConnectionConfig) -> EngineResult<Box<dyn Connector>> {
        Ok(Box::new(FakeConnector(self.0)))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, _sql: &str) -> EngineResult<QueryResult> {
        match self.0 {
            Fake::Fail => Err(EngineError::execution_error("relation \"events\" does not exist")),
            Fake::Slow(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(QueryResult::empty())
            }
            Fake::WrongShape => Ok(QueryResult {
                columns: vec![ColumnInfo {
                    name: "unexpected".into(),
                    data_type: "text".into(),
                    nullable: true,
                }],
                rows: vec![Row {
                    values: vec![Value::Text("x".into())],
                }],
                affected_rows: None,
                execution_time_ms: 0.0,
            }),
        }
    }

    async fn execute(&self, _sql: &str) -> EngineResult<u64> {
        Ok(0)
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    config: FederationConfig,
}

async fn seed(path: &str, sql: &str) {
    let conn = SqliteDriver::new()
        .connect(&ConnectionConfig::file(path).with_create_if_missing(true))
        .await
        .unwrap();
    conn.execute(sql).await.unwrap();
    conn.close().await.unwrap();
}

/// Source 1: analytics sessions. Source 2: CRM users and orders. Source 3: fake Postgres.
async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let analytics = dir.path().join("analytics.sqlite").to_string_lossy().to_string();
    let crm = dir.path().join("crm.sqlite").to_string_lossy().to_string();

    seed(
        &analytics,
        "CREATE TABLE sessions_42 (user_ref INTEGER, session_count INTEGER);
         INSERT INTO sessions_42 VALUES (1, 12), (2, 3), (9, 40);",
    )
    .await;
    seed(
        &crm,
        "CREATE TABLE users (id INTEGER, user_id TEXT, name TEXT, country TEXT);
         INSERT INTO users VALUES (1, 'u-001', 'ada', 'FR'), (2, 'u-002', 'bob', 'DE'), (3, 'u-003', 'cy', 'FR');
         CREATE TABLE orders (id INTEGER, user_id INTEGER, total REAL);
         INSERT INTO orders VALUES (10, 1, 12.5), (11, 1, 7.5), (12, 2, 3.0);",
    )
    .await;

    let mut config = FederationConfig::default();
    config.sources.insert(SourceId::new("1"), ConnectionConfig::file(analytics));
    config.sources.insert(SourceId::new("2"), ConnectionConfig::file(crm));
    config
        .sources
        .insert(SourceId::new("3"), ConnectionConfig::server("pg.internal", 5432, "app", "secret", None));

    Fixture { _dir: dir, config }
}

async fn engine_with(config: FederationConfig, fake: Option<Fake>) -> (FederationEngine, Arc<dyn Connector>) {
    let mut registry = DriverRegistry::with_defaults();
    if let Some(fake) = fake {
        registry.register(Arc::new(FakeDriver(fake)));
    }
    let staging: Arc<dyn Connector> = Arc::from(
        DuckDbDriver::new()
            .connect(&ConnectionConfig::file(":memory:"))
            .await
            .unwrap(),
    );
    let engine = FederationEngine::with_parts(config, Arc::new(registry), Arc::clone(&staging));
    (engine, staging)
}

async fn leftover_staged_tables(staging: &Arc<dyn Connector>) -> usize {
    staging
        .query("SELECT table_name FROM information_schema.tables WHERE table_name LIKE 'fed_%'")
        .await
        .unwrap()
        .rows
        .len()
}

fn column(schema: &str, table: &str, name: &str, source: u32, dialect: &str) -> serde_json::Value {
    json!({"schema": schema, "table": table, "column": name,
           "dataSourceId": source, "dataSourceType": dialect})
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[tokio::test]
async fn joins_flat_file_sessions_with_users_across_sources() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("ga", "sessions_42", "session_count", 1, "sqlite"),
                column("public", "users", "user_id", 2, "sqlite")
            ],
            "joins": [{"leftTable": "sessions_42", "leftColumn": "user_ref",
                       "rightTable": "users", "rightColumn": "id",
                       "joinType": "inner", "operator": "="}],
            "options": {"orderBy": [{"column": "public.users.user_id", "direction": "ASC"}]}
        }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.columns, vec!["sessions_42_session_count", "public_users_user_id"]);
    assert_eq!(result.row_count, 2);
    assert_eq!(
        result.rows,
        vec![vec![text("12"), text("u-001")], vec![text("3"), text("u-002")]]
    );

    assert_eq!(result.sub_queries.len(), 2);
    let sessions = &result.sub_queries[0];
    assert_eq!(sessions.data_source_id, SourceId::new("1"));
    assert_eq!(sessions.row_count, 3);
    assert!(sessions.temp_table_name.starts_with("fed_1_"));
    assert!(sessions.columns.contains(&"sessions_42_user_ref".to_string()));
    assert!(result.warnings.is_empty());

    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn numeric_sort_keys_order_by_value_across_sources() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("ga", "sessions_42", "session_count", 1, "sqlite"),
                column("public", "users", "user_id", 2, "sqlite")
            ],
            "joins": [{"leftTable": "sessions_42", "leftColumn": "user_ref",
                       "rightTable": "users", "rightColumn": "id",
                       "joinType": "inner", "operator": "="}],
            "options": {
                "orderBy": [{"column": "sessions_42.session_count", "direction": "ASC"}],
                "limit": 1
            }
        }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows, vec![vec![text("3"), text("u-002")]]);
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn single_source_pushes_everything_down() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("main", "users", "name", 2, "sqlite"),
                column("main", "orders", "total", 2, "sqlite")
            ],
            "joins": [{"leftTable": "orders", "leftColumn": "user_id",
                       "rightTable": "users", "rightColumn": "id",
                       "joinType": "inner", "operator": "="}],
            "options": {
                "where": [{"column": "main.users.country", "operator": "=", "value": "FR"}],
                "orderBy": [{"column": "main.orders.total", "direction": "DESC"}],
                "limit": 1,
                "offset": -1
            }
        }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.sub_queries.len(), 1);
    assert_eq!(result.sub_queries[0].row_count, 1);
    assert_eq!(result.columns, vec!["main_users_name", "main_orders_total"]);
    assert_eq!(result.rows, vec![vec![text("ada"), text("12.5")]]);
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn left_join_keeps_unmatched_rows() {
    let fx = fixture().await;
    let (engine, _staging) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("public", "users", "name", 2, "sqlite"),
                column("ga", "sessions_42", "session_count", 1, "sqlite")
            ],
            "joins": [{"leftTable": "users", "leftColumn": "id",
                       "rightTable": "sessions_42", "rightColumn": "user_ref",
                       "joinType": "left", "operator": "="}],
            "options": {"orderBy": [{"column": "users.name", "direction": "ASC"}]}
        }))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.rows,
        vec![
            vec![text("ada"), text("12")],
            vec![text("bob"), text("3")],
            vec![text("cy"), Value::Null],
        ]
    );
}

#[tokio::test]
async fn unresolved_filters_follow_strictness() {
    let query = json!({
        "columns": [column("main", "users", "name", 2, "sqlite")],
        "options": {"where": [
            {"column": "main.users.country", "operator": "=", "value": "DE"},
            {"column": "main.payments.amount", "operator": ">", "value": 3, "connective": "AND"}
        ]}
    });

    let fx = fixture().await;
    let (strict, _) = engine_with(fx.config.clone(), None).await;
    let failed = strict.execute(&query).await;
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("main.payments.amount"));

    let mut lenient_config = fx.config;
    lenient_config.strict_filters = false;
    let (lenient, _) = engine_with(lenient_config, None).await;
    let result = lenient.execute(&query).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows, vec![vec![text("bob")]]);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("dropped"));
}

#[tokio::test]
async fn failing_source_yields_empty_failure_envelope() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, Some(Fake::Fail)).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("public", "users", "name", 2, "sqlite"),
                column("public", "events", "kind", 3, "postgres")
            ]
        }))
        .await;

    assert!(!result.success);
    assert_eq!(result.row_count, 0);
    assert!(result.rows.is_empty());
    assert!(result.sub_queries.is_empty());
    let error = result.error.unwrap();
    assert!(error.contains("Source 3 failed"), "{error}");
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn staging_failure_still_drops_created_tables() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, Some(Fake::WrongShape)).await;

    let result = engine
        .execute(&json!({
            "columns": [
                column("public", "users", "name", 2, "sqlite"),
                column("public", "events", "kind", 3, "postgres"),
                column("public", "events", "at", 3, "postgres")
            ]
        }))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Staging error"));
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn slow_source_times_out_and_cancels_siblings() {
    let mut fx = fixture().await;
    fx.config.source_timeout_ms = 100;
    let (engine, staging) = engine_with(fx.config, Some(Fake::Slow(10_000))).await;

    let start = Instant::now();
    let result = engine
        .execute(&json!({
            "columns": [
                column("public", "users", "name", 2, "sqlite"),
                column("public", "events", "kind", 3, "postgres")
            ]
        }))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out after 100ms"));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn abandoned_query_still_drops_its_staged_tables() {
    let fx = fixture().await;
    let (engine, staging) = engine_with(fx.config, Some(Fake::Slow(300))).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        engine.execute(&json!({
            "columns": [
                column("public", "users", "name", 2, "sqlite"),
                column("public", "events", "kind", 3, "postgres")
            ]
        })),
    )
    .await;
    assert!(abandoned.is_err());

    // The run keeps going in the background: stages, joins, then cleans up.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(leftover_staged_tables(&staging).await, 0);
}

#[tokio::test]
async fn unknown_source_is_reported_as_unavailable() {
    let fx = fixture().await;
    let (engine, _) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({"columns": [column("main", "users", "name", 99, "sqlite")]}))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Driver unavailable"));
}

#[tokio::test]
async fn mistyped_source_path_fails_to_connect() {
    let mut fx = fixture().await;
    let missing = fx._dir.path().join("crm.sqlit").to_string_lossy().to_string();
    fx.config.sources.insert(SourceId::new("2"), ConnectionConfig::file(missing.clone()));
    let (engine, _) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({"columns": [column("main", "users", "name", 2, "sqlite")]}))
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("does not exist"), "{error}");
    assert!(!error.contains("no such table"), "{error}");
    assert!(!std::path::Path::new(&missing).exists());
}

#[tokio::test]
async fn envelope_serializes_in_camel_case() {
    let fx = fixture().await;
    let (engine, _) = engine_with(fx.config, None).await;

    let result = engine
        .execute(&json!({"columns": [column("main", "users", "name", 2, "sqlite")],
                         "options": {"limit": 2}}))
        .await;
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["success"], true);
    assert_eq!(json["rowCount"], 2);
    assert_eq!(json["subQueries"][0]["dataSourceId"], "2");
    assert!(json["subQueries"][0]["tempTableName"].as_str().unwrap().starts_with("fed_2_"));
    assert!(json["error"].is_null());
}

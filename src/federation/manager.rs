// SPDX-License-Identifier: Apache-2.0

//! Federation execution manager.
//!
//! Drives the full pipeline:
//! parse → partition → execute per source in parallel → stage → final join →
//! cleanup. Every staged table is recorded as soon as it is created, and the
//! cleanup step drops whatever was recorded no matter how the run ended, even
//! when the caller stopped waiting for it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::FederationConfig;
use crate::engine::registry::DriverRegistry;
use crate::engine::traits::Connector;
use crate::engine::types::{SourceId, Value};
use crate::metrics;

use super::error::{FederationError, FederationResult};
use super::executor::{ExecutedSubQuery, SourceDirectory, SubQueryExecutor};
use super::final_join::{execute_final_join, FinalJoinBuilder};
use super::naming::ColumnNamer;
use super::parser::parse_query;
use super::partitioner::partition;
use super::sql_builder::build_sub_query_sql;
use super::stager::ResultStager;
use super::types::{FederatedQueryResult, Stage, StagedTable, SubQuery, SubQueryReport};

/// Per-run bookkeeping shared between the pipeline, cleanup and the caller.
#[derive(Debug, Default)]
struct RunState {
    stage: Stage,
    staged: Vec<StagedTable>,
    warnings: Vec<String>,
}

type SharedRunState = Arc<Mutex<RunState>>;

fn with_state<R>(state: &SharedRunState, f: impl FnOnce(&mut RunState) -> R) -> R {
    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

fn enter_stage(state: &SharedRunState, stage: Stage) {
    with_state(state, |s| s.stage = stage);
}

/// Error for a pipeline that died without returning, tagged with the last stage it entered.
fn pipeline_failure(state: &SharedRunState, what: String) -> FederationError {
    let stage = with_state(state, |s| s.stage);
    FederationError::internal(stage, what)
}

struct RunOutput {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    sub_queries: Vec<SubQueryReport>,
}

/// Entry point for federated queries.
///
/// Cheap to clone; clones share the driver registry and the staging connection.
#[derive(Clone)]
pub struct FederationEngine {
    config: Arc<FederationConfig>,
    namer: Arc<ColumnNamer>,
    executor: SubQueryExecutor,
    staging: Arc<dyn Connector>,
}

impl FederationEngine {
    /// Builds an engine with the built-in drivers and opens the staging store.
    pub async fn new(config: FederationConfig) -> FederationResult<Self> {
        let registry = Arc::new(DriverRegistry::with_defaults());
        let driver = registry.get(config.staging.dialect).ok_or_else(|| {
            FederationError::driver_unavailable(format!(
                "no driver registered for staging dialect '{}'",
                config.staging.dialect
            ))
        })?;
        let staging = driver
            .connect(&config.staging.connection.clone().with_create_if_missing(true))
            .await
            .map_err(|e| FederationError::staging(format!("failed to open staging store: {e}")))?;

        info!(
            staging = %config.staging.dialect,
            sources = config.sources.len(),
            "federation engine ready"
        );
        Ok(Self::with_parts(config, registry, Arc::from(staging)))
    }

    /// Builds an engine from caller-provided drivers and staging connection.
    pub fn with_parts(config: FederationConfig, registry: Arc<DriverRegistry>, staging: Arc<dyn Connector>) -> Self {
        let directory = Arc::new(SourceDirectory::new(config.sources.clone()));
        let executor = SubQueryExecutor::new(registry, directory, config.source_timeout_ms);
        let namer = Arc::new(ColumnNamer::new(config.flat_file_schemas.clone()));
        Self {
            config: Arc::new(config),
            namer,
            executor,
            staging,
        }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Runs one federated query. Never fails; errors become a failure envelope.
    ///
    /// The pipeline, cleanup and the envelope all run on a spawned task, so
    /// dropping the returned future still drops every staged table.
    #[instrument(skip(self, raw))]
    pub async fn execute(&self, raw: &serde_json::Value) -> FederatedQueryResult {
        let start = Instant::now();
        let state: SharedRunState = Arc::default();

        let task = {
            let engine = self.clone();
            let raw = raw.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move { engine.run_to_completion(&raw, &state, start).await })
        };

        match task.await {
            Ok(result) => result,
            Err(e) => {
                let what = if e.is_panic() {
                    format!("federation task panicked: {}", panic_message(e.into_panic()))
                } else {
                    format!("federation task was cancelled: {e}")
                };
                let err = pipeline_failure(&state, what);
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                metrics::record_run(elapsed_ms, false);
                warn!(kind = err.kind(), error = %err, elapsed_ms, "federated query failed");
                let warnings = with_state(&state, |s| std::mem::take(&mut s.warnings));
                FederatedQueryResult::failure(err.to_string(), elapsed_ms as u64, warnings)
            }
        }
    }

    /// Pipeline, then cleanup, then the envelope.
    async fn run_to_completion(
        &self,
        raw: &serde_json::Value,
        state: &SharedRunState,
        start: Instant,
    ) -> FederatedQueryResult {
        let outcome = AssertUnwindSafe(self.run(raw, state))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(pipeline_failure(
                    state,
                    format!("federation pipeline panicked: {}", panic_message(panic)),
                ))
            });

        self.cleanup(state).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_run(elapsed_ms, outcome.is_ok());
        let warnings = with_state(state, |s| std::mem::take(&mut s.warnings));

        match outcome {
            Ok(output) => {
                info!(rows = output.rows.len(), elapsed_ms, "federated query succeeded");
                FederatedQueryResult {
                    success: true,
                    row_count: output.rows.len() as u64,
                    execution_time_ms: elapsed_ms as u64,
                    columns: output.columns,
                    rows: output.rows,
                    sub_queries: output.sub_queries,
                    warnings,
                    error: None,
                }
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, elapsed_ms, "federated query failed");
                FederatedQueryResult::failure(e.to_string(), elapsed_ms as u64, warnings)
            }
        }
    }

    async fn run(&self, raw: &serde_json::Value, state: &SharedRunState) -> FederationResult<RunOutput> {
        enter_stage(state, Stage::Parse);
        info!(stage = %Stage::Parse, "federation stage");
        let query = parse_query(raw, &self.namer)?;

        enter_stage(state, Stage::Partition);
        info!(stage = %Stage::Partition, tables = query.tables.len(), "federation stage");
        let partition = partition(&query, &self.namer, self.config.strict_filters)?;
        with_state(state, |s| s.warnings.extend(partition.warnings.iter().cloned()));

        enter_stage(state, Stage::ExecuteParallel);
        info!(
            stage = %Stage::ExecuteParallel,
            sub_queries = partition.sub_queries.len(),
            "federation stage"
        );
        let executed = self.execute_all(&partition.sub_queries).await?;

        enter_stage(state, Stage::Stage);
        info!(stage = %Stage::Stage, "federation stage");
        let stager = ResultStager::new(
            self.staging.as_ref(),
            self.config.staging_batch_size,
            &self.config.staged_table_prefix,
        );
        let mut staged = Vec::with_capacity(executed.len());
        let mut reports = Vec::with_capacity(executed.len());
        for run in &executed {
            let mut table = stager.create(&run.sub_query, &self.namer).await?;
            metrics::record_staged_created();
            with_state(state, |s| s.staged.push(table.clone()));

            let row_count = stager.populate(&mut table, &run.result, &self.namer).await?;
            reports.push(SubQueryReport {
                data_source_id: run.sub_query.source_id.clone(),
                temp_table_name: table.name.clone(),
                row_count,
                columns: table.columns.iter().map(|c| self.namer.canonical(c)).collect(),
                execution_time_ms: run.elapsed_ms.round() as u64,
            });
            staged.push(table);
        }

        enter_stage(state, Stage::FinalJoin);
        info!(stage = %Stage::FinalJoin, staged = staged.len(), "federation stage");
        let final_join = FinalJoinBuilder::new(&query, &staged, &self.namer, self.staging.dialect())
            .build(&partition.cross_source_joins)?;
        with_state(state, |s| s.warnings.extend(final_join.warnings.iter().cloned()));

        let result = execute_final_join(self.staging.as_ref(), &final_join.sql).await?;

        Ok(RunOutput {
            columns: result.columns.into_iter().map(|c| c.name).collect(),
            rows: result.rows.into_iter().map(|r| r.values).collect(),
            sub_queries: reports,
        })
    }

    /// Runs every sub-query concurrently and returns them in partition order.
    ///
    /// The first failure wins; returning drops the `JoinSet`, which aborts the
    /// siblings still in flight.
    async fn execute_all(&self, sub_queries: &[SubQuery]) -> FederationResult<Vec<ExecutedSubQuery>> {
        let mut tasks = JoinSet::new();
        for (slot, sub_query) in sub_queries.iter().enumerate() {
            let sql = build_sub_query_sql(sub_query, &self.namer)?;
            let executor = self.executor.clone();
            let sub_query = sub_query.clone();
            let source_id = sub_query.source_id.clone();

            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(executor.execute(sub_query, sql))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(FederationError::source(
                            source_id,
                            format!("sub-query task panicked: {}", panic_message(panic)),
                        ))
                    });
                (slot, outcome)
            });
        }

        let mut slots: Vec<Option<ExecutedSubQuery>> = (0..sub_queries.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (slot, outcome) = joined.map_err(|e| {
                FederationError::source(SourceId::new("unknown"), format!("sub-query task failed: {e}"))
            })?;
            let executed = outcome?;
            debug!(
                source_id = %executed.sub_query.source_id,
                rows = executed.result.rows.len(),
                "sub-query completed"
            );
            slots[slot] = Some(executed);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    async fn cleanup(&self, state: &SharedRunState) {
        let staged = with_state(state, |s| {
            s.stage = Stage::Cleanup;
            std::mem::take(&mut s.staged)
        });
        info!(stage = %Stage::Cleanup, staged = staged.len(), "federation stage");

        let stager = ResultStager::new(
            self.staging.as_ref(),
            self.config.staging_batch_size,
            &self.config.staged_table_prefix,
        );
        for table in &staged {
            match stager.drop(table).await {
                Ok(()) => metrics::record_staged_dropped(),
                Err(e) => {
                    warn!(table = %table.name, error = %e, "failed to drop staged table");
                    metrics::record_cleanup_failure();
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown cause".to_string()
    }
}

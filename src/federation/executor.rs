// SPDX-License-Identifier: Apache-2.0

//! Sub-query executor.
//!
//! Resolves the driver for a sub-query's dialect and the connection details for
//! its source, runs the SQL under the per-source timeout, and always closes the
//! connection afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::engine::registry::DriverRegistry;
use crate::engine::types::{ConnectionConfig, QueryResult, SourceId};
use crate::metrics;

use super::error::{FederationError, FederationResult};
use super::types::SubQuery;

/// Connection details for every known source, keyed by source id.
#[derive(Debug, Clone, Default)]
pub struct SourceDirectory {
    sources: BTreeMap<SourceId, ConnectionConfig>,
}

impl SourceDirectory {
    pub fn new(sources: BTreeMap<SourceId, ConnectionConfig>) -> Self {
        Self { sources }
    }

    pub fn insert(&mut self, id: SourceId, config: ConnectionConfig) {
        self.sources.insert(id, config);
    }

    pub fn get(&self, id: &SourceId) -> Option<&ConnectionConfig> {
        self.sources.get(id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Rows returned by one source.
#[derive(Debug)]
pub struct ExecutedSubQuery {
    pub sub_query: SubQuery,
    pub sql: String,
    pub result: QueryResult,
    pub elapsed_ms: f64,
}

#[derive(Clone)]
pub struct SubQueryExecutor {
    registry: Arc<DriverRegistry>,
    directory: Arc<SourceDirectory>,
    timeout: Duration,
}

impl SubQueryExecutor {
    pub fn new(registry: Arc<DriverRegistry>, directory: Arc<SourceDirectory>, timeout_ms: u64) -> Self {
        Self {
            registry,
            directory,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Runs `sql` against the sub-query's source.
    ///
    /// A missing driver or missing connection details fail immediately with
    /// `DriverUnavailable`; everything the source reports, including the
    /// timeout, becomes `SourceExecution` tagged with the source id.
    #[instrument(skip(self, sub_query, sql), fields(source_id = %sub_query.source_id, dialect = %sub_query.dialect))]
    pub async fn execute(&self, sub_query: SubQuery, sql: String) -> FederationResult<ExecutedSubQuery> {
        let driver = self.registry.get(sub_query.dialect).ok_or_else(|| {
            FederationError::driver_unavailable(format!(
                "no driver registered for dialect '{}'",
                sub_query.dialect
            ))
        })?;
        let config = self.directory.get(&sub_query.source_id).ok_or_else(|| {
            FederationError::driver_unavailable(format!(
                "no connection details for source {}",
                sub_query.source_id
            ))
        })?;

        let start = Instant::now();
        let source_id = sub_query.source_id.clone();
        let timeout_ms = self.timeout.as_millis() as u64;
        let endpoint = config.endpoint();
        debug!(endpoint = %endpoint, sql = %sql, "executing sub-query");

        let outcome = timeout(self.timeout, async {
            let connector = driver.connect(config).await.map_err(|e| {
                warn!(endpoint = %endpoint, error = %e, "failed to connect to source");
                FederationError::source(source_id.clone(), e.to_string())
            })?;

            let result = connector.query(&sql).await;
            if let Err(e) = connector.close().await {
                warn!(error = %e, "failed to close source connection");
            }
            result.map_err(|e| FederationError::source(source_id.clone(), e.to_string()))
        })
        .await
        .unwrap_or_else(|_| {
            Err(FederationError::source(
                source_id.clone(),
                format!("sub-query timed out after {timeout_ms}ms"),
            ))
        });

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_sub_query(outcome.is_ok());

        let result = outcome?;
        debug!(rows = result.rows.len(), elapsed_ms, "sub-query finished");

        Ok(ExecutedSubQuery {
            sub_query,
            sql,
            result,
            elapsed_ms,
        })
    }
}

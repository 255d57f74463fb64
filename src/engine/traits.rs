// SPDX-License-Identifier: Apache-2.0

//! Driver and connector traits
//!
//! A `SourceDriver` is the per-dialect capability: it knows how to open a
//! connection from `ConnectionConfig`. The returned `Connector` is the opaque
//! "accepts SQL, returns rows" handle used both for data sources and for the
//! central staging store.

use async_trait::async_trait;

use crate::engine::dialect::Dialect;
use crate::engine::error::EngineResult;
use crate::engine::types::{ConnectionConfig, QueryResult};

/// Per-dialect driver capability
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// The dialect this driver speaks; used as the registry key
    fn dialect(&self) -> Dialect;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Opens a connection to the source described by `config`
    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<Box<dyn Connector>>;
}

/// An open connection that accepts SQL text
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dialect of the connected engine
    fn dialect(&self) -> Dialect;

    /// Runs a row-returning statement
    async fn query(&self, sql: &str) -> EngineResult<QueryResult>;

    /// Runs a statement that returns no rows (DDL, INSERT) and reports affected rows
    async fn execute(&self, sql: &str) -> EngineResult<u64>;

    /// Releases the underlying pool / handle
    async fn close(&self) -> EngineResult<()>;
}

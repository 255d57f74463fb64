// SPDX-License-Identifier: Apache-2.0

//! qore-federation
//!
//! Runs one logical query over tables that live in several independent data
//! sources and returns a single combined result set.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use qore_federation::{FederationConfig, FederationEngine};
//!
//! let config = FederationConfig::from_env()?;
//! qore_federation::observability::init_tracing(&config.logging);
//!
//! let engine = FederationEngine::new(config).await?;
//! let result = engine
//!     .execute(&serde_json::json!({
//!         "columns": [{"schema": "public", "table": "users", "column": "id",
//!                      "dataSourceId": 1, "dataSourceType": "postgres"}]
//!     }))
//!     .await;
//! println!("{} rows", result.row_count);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod federation;
pub mod metrics;
pub mod observability;

pub use config::{ConfigError, FederationConfig, LoggingConfig, StagingConfig};
pub use engine::{Connector, Dialect, DriverRegistry, EngineError, EngineResult, SourceDriver};
pub use federation::{FederatedQueryResult, FederationEngine, FederationError, FederationResult};

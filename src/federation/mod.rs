// SPDX-License-Identifier: Apache-2.0

//! Federated query engine
//!
//! Splits one structured query across the data sources that own its tables,
//! runs the per-source SQL concurrently, stages every result in a central
//! store and joins them there.

pub mod error;
pub mod executor;
pub mod final_join;
pub mod manager;
pub mod naming;
pub mod parser;
pub mod partitioner;
pub mod sql_builder;
pub mod stager;
pub mod types;

pub use error::{FederationError, FederationResult};
pub use executor::{SourceDirectory, SubQueryExecutor};
pub use manager::FederationEngine;
pub use naming::ColumnNamer;
pub use types::{FederatedQueryResult, SubQueryReport};

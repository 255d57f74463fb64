// SPDX-License-Identifier: Apache-2.0

// Data Engine Module
// Dialect-aware connectivity shared by sources and the staging store

pub mod dialect;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use dialect::Dialect;
pub use error::{EngineError, EngineResult};
pub use registry::DriverRegistry;
pub use traits::{Connector, SourceDriver};
pub use types::*;

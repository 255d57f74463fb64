// SPDX-License-Identifier: Apache-2.0

//! Driver Registry
//!
//! Central registry for all available source drivers, keyed by dialect.
//! Callers can register their own drivers to replace or extend the defaults.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::dialect::Dialect;
use crate::engine::drivers::duckdb::DuckDbDriver;
use crate::engine::drivers::mysql::MySqlDriver;
use crate::engine::drivers::postgres::PostgresDriver;
use crate::engine::drivers::sqlite::SqliteDriver;
use crate::engine::traits::SourceDriver;

/// Registry that holds all available drivers
pub struct DriverRegistry {
    drivers: HashMap<Dialect, Arc<dyn SourceDriver>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Creates a registry with every built-in driver registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresDriver::new()));
        registry.register(Arc::new(MySqlDriver::new()));
        registry.register(Arc::new(SqliteDriver::new()));
        registry.register(Arc::new(DuckDbDriver::new()));
        registry
    }

    /// Registers a driver
    ///
    /// The driver's `dialect()` is used as the key; a previous driver for the
    /// same dialect is replaced.
    pub fn register(&mut self, driver: Arc<dyn SourceDriver>) {
        self.drivers.insert(driver.dialect(), driver);
    }

    /// Gets a driver by dialect
    pub fn get(&self, dialect: Dialect) -> Option<Arc<dyn SourceDriver>> {
        self.drivers.get(&dialect).cloned()
    }

    /// Lists all registered dialects, sorted by tag
    pub fn list(&self) -> Vec<Dialect> {
        let mut dialects: Vec<Dialect> = self.drivers.keys().copied().collect();
        dialects.sort_by_key(|d| d.tag());
        dialects
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

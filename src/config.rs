// SPDX-License-Identifier: Apache-2.0

//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config. Values
//! can come from a JSON file or from `QORE_FED_*` environment variables (a
//! `.env` file is loaded first when present).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::dialect::Dialect;
use crate::engine::types::{ConnectionConfig, SourceId};
use crate::federation::naming::default_flat_file_schemas;

pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STAGING_BATCH_SIZE: usize = 500;
pub const DEFAULT_STAGED_TABLE_PREFIX: &str = "fed";
pub const DEFAULT_LOG_FILTER: &str = "qore_federation=info";
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 14;

const ENV_PREFIX: &str = "QORE_FED_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Upper bound for one sub-query (connect + execute).
    pub source_timeout_ms: u64,
    /// Rows per staging `INSERT` statement.
    pub staging_batch_size: usize,
    /// Fail the query when a filter cannot be routed to any source.
    pub strict_filters: bool,
    pub staged_table_prefix: String,
    pub flat_file_schemas: Vec<String>,
    pub staging: StagingConfig,
    pub sources: BTreeMap<SourceId, ConnectionConfig>,
    pub logging: LoggingConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            staging_batch_size: DEFAULT_STAGING_BATCH_SIZE,
            strict_filters: true,
            staged_table_prefix: DEFAULT_STAGED_TABLE_PREFIX.to_string(),
            flat_file_schemas: default_flat_file_schemas(),
            staging: StagingConfig::default(),
            sources: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where staged tables are created and the final join runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dialect: Dialect,
    pub connection: ConnectionConfig,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::DuckDb,
            connection: ConnectionConfig::file(":memory:"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Defaults to the platform data directory.
    pub directory: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

impl FederationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `QORE_FED_*` variables.
    ///
    /// `QORE_FED_CONFIG` names a JSON file to start from instead of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match env::var(format!("{ENV_PREFIX}CONFIG")) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides looked up by unprefixed key (e.g. `SOURCE_TIMEOUT_MS`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SOURCE_TIMEOUT_MS") {
            self.source_timeout_ms = parse_number("SOURCE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("STAGING_BATCH_SIZE") {
            self.staging_batch_size = parse_number("STAGING_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRICT_FILTERS") {
            self.strict_filters = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => return Err(ConfigError::invalid("STRICT_FILTERS", format!("'{other}' is not a boolean"))),
            };
        }
        if let Some(v) = lookup("STAGED_TABLE_PREFIX") {
            self.staged_table_prefix = v.trim().to_string();
        }
        if let Some(v) = lookup("FLAT_FILE_SCHEMAS") {
            self.flat_file_schemas = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("STAGING_DIALECT") {
            self.staging.dialect = Dialect::from_tag(&v)
                .ok_or_else(|| ConfigError::invalid("STAGING_DIALECT", format!("unknown dialect '{v}'")))?;
        }
        if let Some(v) = lookup("STAGING_PATH") {
            self.staging.connection = ConnectionConfig::file(v.trim());
        }
        if let Some(v) = lookup("LOG_FILTER") {
            self.logging.filter = v;
        }
        if let Some(v) = lookup("LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LOG_RETENTION_DAYS") {
            self.logging.retention_days = parse_number("LOG_RETENTION_DAYS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_timeout_ms == 0 {
            return Err(ConfigError::invalid("source_timeout_ms", "must be greater than zero"));
        }
        if self.staging_batch_size == 0 {
            return Err(ConfigError::invalid("staging_batch_size", "must be at least 1"));
        }
        let prefix = &self.staged_table_prefix;
        let valid_prefix = prefix.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && prefix.len() <= 32;
        if !valid_prefix {
            return Err(ConfigError::invalid(
                "staged_table_prefix",
                format!("'{prefix}' must start with a letter and contain only letters, digits and underscores"),
            ));
        }
        if self.staging.connection.host.trim().is_empty() {
            return Err(ConfigError::invalid("staging.connection.host", "cannot be empty"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{raw}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_object_uses_defaults() {
        let config = FederationConfig::from_json("{}").unwrap();
        assert_eq!(config.source_timeout_ms, 30_000);
        assert_eq!(config.staging_batch_size, 500);
        assert!(config.strict_filters);
        assert_eq!(config.staged_table_prefix, "fed");
        assert_eq!(config.staging.dialect, Dialect::DuckDb);
        assert!(config.staging.connection.is_memory());
        assert!(config.flat_file_schemas.iter().any(|s| s == "ga4"));
        assert!(config.sources.is_empty());
    }

    #[test]
    fn sources_are_keyed_by_id() {
        let config = FederationConfig::from_json(
            r#"{
                "sources": {
                    "7": {"host": "db.internal", "port": 5432, "username": "app",
                          "password": "hunter2", "database": "crm"},
                    "warehouse": {"host": "/data/warehouse.sqlite"}
                },
                "staging": {"dialect": "sqlite", "connection": {"host": ":memory:"}}
            }"#,
        )
        .unwrap();

        let crm = &config.sources[&SourceId::new("7")];
        assert_eq!(crm.port, 5432);
        assert_eq!(crm.password.expose(), "hunter2");
        assert!(!format!("{crm:?}").contains("hunter2"));
        assert!(config.sources.contains_key(&SourceId::new("warehouse")));
        assert_eq!(config.staging.dialect, Dialect::Sqlite);
    }

    #[test]
    fn overrides_replace_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SOURCE_TIMEOUT_MS", "1500"),
            ("STAGING_BATCH_SIZE", "1"),
            ("STRICT_FILTERS", "off"),
            ("FLAT_FILE_SCHEMAS", "ga, sheets ,"),
            ("STAGING_DIALECT", "postgresql"),
        ]);
        let mut config = FederationConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.source_timeout_ms, 1500);
        assert_eq!(config.staging_batch_size, 1);
        assert!(!config.strict_filters);
        assert_eq!(config.flat_file_schemas, vec!["ga", "sheets"]);
        assert_eq!(config.staging.dialect, Dialect::Postgres);
    }

    #[test]
    fn bad_overrides_name_the_key() {
        let mut config = FederationConfig::default();
        let err = config
            .apply_overrides(|key| (key == "STAGING_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STAGING_BATCH_SIZE"));
    }

    #[test]
    fn validation_rejects_unsafe_values() {
        assert!(FederationConfig::from_json(r#"{"staging_batch_size": 0}"#).is_err());
        assert!(FederationConfig::from_json(r#"{"source_timeout_ms": 0}"#).is_err());
        assert!(FederationConfig::from_json(r#"{"staged_table_prefix": "fed; DROP"}"#).is_err());
        assert!(FederationConfig::from_json(r#"{"staged_table_prefix": "1fed"}"#).is_err());
        assert!(FederationConfig::from_json(r#"{"staged_table_prefix": "tmp_fed"}"#).is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"source_timeout_ms": 250, "logging": {{"retention_days": 3}}}}"#).unwrap();
        let config = FederationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source_timeout_ms, 250);
        assert_eq!(config.logging.retention_days, 3);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);

        let err = FederationConfig::from_file("/nonexistent/qore-fed.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

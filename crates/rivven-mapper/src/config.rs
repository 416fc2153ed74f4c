//! Mapper configuration
//!
//! Loaded from YAML (or built in code) and validated before use:
//!
//! ```yaml
//! auto_commit: false
//! default_dialect: PostgreSQL
//! log_parameters: true
//! unordered_buffer_warn_rows: 50000
//! connection:
//!   url: postgres://app@localhost/app
//! ```

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};

/// Mapper-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MapperConfig {
    /// Commit after every statement (default: true).
    ///
    /// When disabled each standalone operation runs in a transaction that is
    /// committed on success and rolled back on error.
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,

    /// Dialect forced for every statement, bypassing product-name matching
    #[serde(default)]
    #[validate(length(min = 1))]
    pub default_dialect: Option<String>,

    /// Include bound parameter values in debug logs (default: true)
    #[serde(default = "default_log_parameters")]
    pub log_parameters: bool,

    /// Warn when an unordered aggregation buffers this many rows (default: 10000)
    #[serde(default = "default_unordered_buffer_warn_rows")]
    #[validate(range(min = 1))]
    pub unordered_buffer_warn_rows: Option<u64>,

    /// Connection settings for driver factories
    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_auto_commit() -> bool {
    true
}

fn default_log_parameters() -> bool {
    true
}

fn default_unordered_buffer_warn_rows() -> Option<u64> {
    Some(10_000)
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            auto_commit: default_auto_commit(),
            default_dialect: None,
            log_parameters: default_log_parameters(),
            unordered_buffer_warn_rows: default_unordered_buffer_warn_rows(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl MapperConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid mapper configuration: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Validate, reporting failures as configuration errors
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid mapper configuration: {}", e)))
    }

    /// Set auto-commit
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Force a dialect for every statement
    pub fn with_default_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.default_dialect = Some(dialect.into());
        self
    }

    /// Toggle parameter logging
    pub fn with_log_parameters(mut self, log_parameters: bool) -> Self {
        self.log_parameters = log_parameters;
        self
    }

    /// Set or clear the unordered buffering warning threshold
    pub fn with_unordered_buffer_warn_rows(mut self, rows: Option<u64>) -> Self {
        self.unordered_buffer_warn_rows = rows;
        self
    }

    /// Set connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

//! Error types for rivven-mapper
//!
//! Every failure surfaces to the caller as a failed operation:
//! - Configuration errors (missing adapter, dialect, statement or binding)
//! - Mapping errors (decode failure, unresolvable column or nested field)
//! - Generated key errors (key requested but not reported by the driver)
//! - Execution errors (driver-reported failures, wrapping the driver error)

use std::fmt;
use thiserror::Error;

/// Result type for rivven-mapper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Registry or statement configuration problem
    Configuration,
    /// Row decoding or object assembly failed
    Mapping,
    /// Generated key could not be applied
    GeneratedKey,
    /// Driver reported a failure while executing
    Execution,
    /// Connection acquisition or release failed (retriable)
    Connection,
    /// Transaction demarcation failed
    Transaction,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection)
    }
}

/// Main error type for rivven-mapper
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Missing adapter, dialect, statement or parameter binding
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A column could not be decoded into its target type
    #[error("mapping error in statement '{statement}' (column '{column}' as {target_type}): {message}")]
    Mapping {
        statement: String,
        column: String,
        target_type: String,
        message: String,
    },

    /// Generated keys were requested but are not usable
    #[error("generated key error in statement '{statement}': {message}")]
    GeneratedKey { statement: String, message: String },

    /// Driver-reported execution failure
    #[error("execution error: {message}")]
    Execution {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection could not be acquired or released
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction commit/rollback failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Mapping { .. } => ErrorCategory::Mapping,
            Self::GeneratedKey { .. } => ErrorCategory::GeneratedKey,
            Self::Execution { .. } => ErrorCategory::Execution,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a mapping error for a statement column and target type
    pub fn mapping(
        statement: impl Into<String>,
        column: impl Into<String>,
        target_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Mapping {
            statement: statement.into(),
            column: column.into(),
            target_type: target_type.into(),
            message: message.into(),
        }
    }

    /// Create a generated key error
    pub fn generated_key(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GeneratedKey {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create an execution error carrying the SQL that failed
    pub fn execution_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Wrap a driver error
    pub fn driver(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the failing SQL to an execution error (no-op for other kinds)
    pub fn with_sql(self, sql: impl Into<String>) -> Self {
        match self {
            Self::Execution {
                message,
                sql: None,
                source,
            } => Self::Execution {
                message,
                sql: Some(sql.into()),
                source,
            },
            other => other,
        }
    }

    /// SQL attached to an execution error
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Execution { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Mapping => write!(f, "mapping"),
            Self::GeneratedKey => write!(f, "generated_key"),
            Self::Execution => write!(f, "execution"),
            Self::Connection => write!(f, "connection"),
            Self::Transaction => write!(f, "transaction"),
            Self::Other => write!(f, "other"),
        }
    }
}

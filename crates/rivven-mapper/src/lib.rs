//! # rivven-mapper
//!
//! Reactive SQL statement mapping for the Rivven platform.
//!
//! Statements are registered once under an id, executed against an async
//! driver and their rows are streamed back as application objects. Joined
//! result sets are folded into nested objects on the fly.
//!
//! ## Features
//!
//! - **Dialect-aware rendering**: anonymous `?` markers become `$1`, `@p1`,
//!   `:p1` or stay `?`, depending on the database behind the connection
//! - **Type adapters**: per-type encode/decode with a pluggable registry
//! - **Streaming aggregation**: flat, ordered and unordered grouping of
//!   joined rows into parent objects with nested collections
//! - **Lease lifecycle**: every connection is released exactly once, on
//!   completion, on error and on cancellation
//! - **Transactions**: several statements on one lease with explicit or
//!   implicit commit/rollback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_mapper::prelude::*;
//!
//! let configuration = Arc::new(Configuration::default());
//! configuration.add_statement(MappedStatement::select(
//!     "department.all",
//!     StatementTemplate::new(
//!         "SELECT d.id AS dept_id, e.id AS emp_id, e.name AS emp_name \
//!          FROM dept d LEFT JOIN emp e ON e.dept_id = d.id ORDER BY d.id",
//!     ),
//!     department_map,
//! ))?;
//!
//! let executor = SqlExecutor::new(configuration, Arc::new(PgConnectionFactory::new(config)));
//! let mut departments = executor.select_many::<Department, _>("department.all", &());
//! while let Some(department) = departments.next().await {
//!     println!("{:?}", department?);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL driver via tokio-postgres
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod aggregate;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod listener;
pub mod mapping;
pub mod render;
pub mod statement;
pub mod testing;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and type system
    pub use crate::types::{ColumnMetadata, ParentKey, Row, Value};

    // Type adapters
    pub use crate::adapter::{
        AdapterModule, Blob, Clob, ConversionError, ConversionResult, EnumByName,
        EnumByOrdinal, EnumEncoding, SqlEnum, TypeAdapter, TypeAdapterRegistry,
    };

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, ConnectionMetadata, ExecuteResult,
        RowStream,
    };

    // Dialects and rendering
    pub use crate::dialect::{BindStyle, Dialect, DialectRegistry, DEFAULT_DIALECT};
    pub use crate::render::{
        bind_parameters, render, BoundParameters, BoundStatement, ParameterBinder,
        StatementTemplate, ToParameters,
    };

    // Mapping and aggregation
    pub use crate::aggregate::{aggregate, AggregationContext, Aggregator};
    pub use crate::decoder::{ColumnRef, RowDecoder};
    pub use crate::mapping::{AggregationMode, ResultMap, ResultMapBuilder};

    // Lifecycle
    pub use crate::lifecycle::{
        CloseConnection, ConnectionLease, LeaseState, LifecycleManager, ReleaseOutcome,
        ReleaseStrategy, SuppressClose, TransactionAwareRelease, TransactionResources,
    };

    // Execution
    pub use crate::config::MapperConfig;
    pub use crate::executor::{ExecutionContext, GeneratedKeyTarget, SqlExecutor, Transaction};
    pub use crate::listener::{
        AtomicExecutorStats, ExecutionListener, ExecutionOutcome, ExecutorStats, TracingListener,
    };
    pub use crate::statement::{Configuration, GeneratedKeys, MappedStatement, StatementKind};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnection, PgConnectionFactory};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use executor::SqlExecutor;
pub use statement::{Configuration, MappedStatement};
pub use types::Value;

//! Execution diagnostics
//!
//! Listeners observe every statement: the rendered SQL and parameters when
//! it is prepared, and the row or update count when it completes. The
//! default [`TracingListener`] logs in the familiar format:
//!
//! ```text
//! ==> Preparing: SELECT * FROM dept WHERE id = $1
//! ==> Parameters: 1(i64)
//! <== Total: 3
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::Error;
use crate::render::BoundStatement;
use crate::statement::StatementKind;

/// What a finished statement produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// A query, with the number of rows read from the driver
    Rows(u64),
    /// A mutation, with the number of rows affected
    Updates(u64),
}

/// Observer of statement execution
pub trait ExecutionListener: Send + Sync {
    /// The statement was rendered and is about to run
    fn on_prepared(&self, _statement_id: &str, _kind: StatementKind, _statement: &BoundStatement) {}

    /// The statement finished
    fn on_completed(&self, _statement_id: &str, _outcome: ExecutionOutcome, _elapsed: Duration) {}

    /// The statement failed
    fn on_failed(&self, _statement_id: &str, _error: &Error) {}
}

/// Logs statements through `tracing`
#[derive(Debug, Clone, Copy)]
pub struct TracingListener {
    log_parameters: bool,
}

impl TracingListener {
    /// Create a listener; `log_parameters` includes bound values
    pub fn new(log_parameters: bool) -> Self {
        Self { log_parameters }
    }
}

impl Default for TracingListener {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ExecutionListener for TracingListener {
    fn on_prepared(&self, statement_id: &str, _kind: StatementKind, statement: &BoundStatement) {
        debug!(statement = statement_id, "==> Preparing: {}", statement.sql);
        if self.log_parameters {
            debug!(
                statement = statement_id,
                "==> Parameters: {}",
                statement.parameter_summary()
            );
        }
    }

    fn on_completed(&self, statement_id: &str, outcome: ExecutionOutcome, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            ExecutionOutcome::Rows(rows) => {
                debug!(statement = statement_id, elapsed_ms, "<== Total: {}", rows)
            }
            ExecutionOutcome::Updates(rows) => {
                debug!(statement = statement_id, elapsed_ms, "<== Updates: {}", rows)
            }
        }
    }

    fn on_failed(&self, statement_id: &str, error: &Error) {
        debug!(statement = statement_id, error = %error, "<== Failed");
    }
}

/// Executor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Statements prepared
    pub statements: u64,
    /// Queries completed
    pub queries: u64,
    /// Mutations completed
    pub mutations: u64,
    /// Rows read from the driver
    pub rows_read: u64,
    /// Rows affected by mutations
    pub rows_affected: u64,
    /// Failed statements
    pub failures: u64,
    /// Total execution time (in milliseconds)
    pub total_time_ms: u64,
}

/// Atomic executor stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicExecutorStats {
    pub statements: AtomicU64,
    pub queries: AtomicU64,
    pub mutations: AtomicU64,
    pub rows_read: AtomicU64,
    pub rows_affected: AtomicU64,
    pub failures: AtomicU64,
    pub total_time_ms: AtomicU64,
}

impl AtomicExecutorStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            statements: self.statements.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_affected: self.rows_affected.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Average statement time in milliseconds
    pub fn avg_time_ms(&self) -> f64 {
        let completed =
            self.queries.load(Ordering::Relaxed) + self.mutations.load(Ordering::Relaxed);
        if completed == 0 {
            0.0
        } else {
            self.total_time_ms.load(Ordering::Relaxed) as f64 / completed as f64
        }
    }
}

impl ExecutionListener for AtomicExecutorStats {
    fn on_prepared(&self, _statement_id: &str, _kind: StatementKind, _statement: &BoundStatement) {
        self.statements.fetch_add(1, Ordering::Relaxed);
    }

    fn on_completed(&self, _statement_id: &str, outcome: ExecutionOutcome, elapsed: Duration) {
        match outcome {
            ExecutionOutcome::Rows(rows) => {
                self.queries.fetch_add(1, Ordering::Relaxed);
                self.rows_read.fetch_add(rows, Ordering::Relaxed);
            }
            ExecutionOutcome::Updates(rows) => {
                self.mutations.fetch_add(1, Ordering::Relaxed);
                self.rows_affected.fetch_add(rows, Ordering::Relaxed);
            }
        }
        self.total_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn on_failed(&self, _statement_id: &str, _error: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

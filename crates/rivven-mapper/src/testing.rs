//! Testing utilities for rivven-mapper
//!
//! A scripted in-memory driver for exercising statements, aggregation and
//! the lease lifecycle without a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_mapper::testing::*;
//!
//! #[tokio::test]
//! async fn test_reads_departments() {
//!     let factory = Arc::new(
//!         MockConnectionFactory::new("PostgreSQL").with_rows(
//!             &[("dept", "BIGINT"), ("child", "TEXT")],
//!             vec![vec![1i64.into(), "A".into()]],
//!         ),
//!     );
//!
//!     // ... run an executor against `factory` ...
//!
//!     assert_eq!(factory.stats().rows_pulled, 1);
//!     assert_eq!(factory.stats().closes, 1);
//! }
//! ```

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::connection::{
    Connection, ConnectionFactory, ConnectionMetadata, ExecuteResult, RowStream,
};
use crate::error::{Error, Result};
use crate::render::BoundStatement;
use crate::types::{ColumnMetadata, Row, Value};

/// Build rows sharing one column list
pub fn rows(columns: &[(&str, &str)], data: Vec<Vec<Value>>) -> Vec<Row> {
    let columns = ColumnMetadata::list(columns.iter().copied());
    data.into_iter()
        .map(|values| Row::new(columns.clone(), values))
        .collect()
}

/// Counters recorded by the mock driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Connections opened
    pub connects: u64,
    /// Completed connection closes
    pub closes: u64,
    /// Transactions begun
    pub begins: u64,
    /// Commits
    pub commits: u64,
    /// Rollbacks
    pub rollbacks: u64,
    /// Queries started
    pub queries: u64,
    /// Mutating statements executed
    pub executes: u64,
    /// Rows handed to the consumer
    pub rows_pulled: u64,
}

#[derive(Debug, Default)]
struct MockState {
    connects: AtomicU64,
    closes: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    queries: AtomicU64,
    executes: AtomicU64,
    rows_pulled: AtomicU64,
    fail_close: AtomicBool,
    stall_begin: AtomicBool,
    stall_commit: AtomicBool,
    stall_next_close: AtomicBool,
    executed: Mutex<Vec<BoundStatement>>,
    closed: Notify,
}

#[derive(Debug, Clone, Default)]
struct Script {
    default_rows: Vec<Row>,
    results: Vec<(String, Vec<Row>)>,
    fail_at_row: Option<usize>,
    query_error: Option<String>,
    execute_error: Option<String>,
    connect_error: Option<String>,
    rows_affected: u64,
    generated_keys: Vec<Row>,
}

impl Script {
    fn rows_for(&self, sql: &str) -> Vec<Row> {
        self.results
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_else(|| self.default_rows.clone())
    }
}

/// Connection factory producing scripted [`MockConnection`]s
#[derive(Debug)]
pub struct MockConnectionFactory {
    metadata: ConnectionMetadata,
    script: Script,
    state: Arc<MockState>,
}

impl MockConnectionFactory {
    /// Factory reporting `product_name`
    pub fn new(product_name: impl Into<String>) -> Self {
        Self {
            metadata: ConnectionMetadata::new(product_name, "mock"),
            script: Script::default(),
            state: Arc::new(MockState::default()),
        }
    }

    /// Rows returned by every query without a more specific result
    pub fn with_rows(mut self, columns: &[(&str, &str)], data: Vec<Vec<Value>>) -> Self {
        self.script.default_rows = rows(columns, data);
        self
    }

    /// Rows returned by queries whose SQL contains `fragment`
    pub fn with_query_result(mut self, fragment: impl Into<String>, result: Vec<Row>) -> Self {
        self.script.results.push((fragment.into(), result));
        self
    }

    /// Fail the stream when the row at `index` would be delivered
    pub fn fail_at_row(mut self, index: usize) -> Self {
        self.script.fail_at_row = Some(index);
        self
    }

    /// Fail every query
    pub fn fail_query(mut self, message: impl Into<String>) -> Self {
        self.script.query_error = Some(message.into());
        self
    }

    /// Fail every mutating statement
    pub fn fail_execute(mut self, message: impl Into<String>) -> Self {
        self.script.execute_error = Some(message.into());
        self
    }

    /// Fail every connection attempt
    pub fn fail_connect(mut self, message: impl Into<String>) -> Self {
        self.script.connect_error = Some(message.into());
        self
    }

    /// Fail every close (the close is still counted)
    pub fn fail_close(self) -> Self {
        self.state.fail_close.store(true, Ordering::Relaxed);
        self
    }

    /// Never complete `begin`
    pub fn stall_begin(self) -> Self {
        self.state.stall_begin.store(true, Ordering::Relaxed);
        self
    }

    /// Never complete `commit`
    pub fn stall_commit(self) -> Self {
        self.state.stall_commit.store(true, Ordering::Relaxed);
        self
    }

    /// Never complete the first close; later closes succeed
    pub fn stall_first_close(self) -> Self {
        self.state.stall_next_close.store(true, Ordering::Relaxed);
        self
    }

    /// Affected-row count reported by mutating statements
    pub fn with_rows_affected(mut self, rows_affected: u64) -> Self {
        self.script.rows_affected = rows_affected;
        self
    }

    /// Generated key rows reported by mutating statements
    pub fn with_generated_keys(mut self, keys: Vec<Row>) -> Self {
        self.script.generated_keys = keys;
        self
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MockStats {
        let s = &self.state;
        MockStats {
            connects: s.connects.load(Ordering::SeqCst),
            closes: s.closes.load(Ordering::SeqCst),
            begins: s.begins.load(Ordering::SeqCst),
            commits: s.commits.load(Ordering::SeqCst),
            rollbacks: s.rollbacks.load(Ordering::SeqCst),
            queries: s.queries.load(Ordering::SeqCst),
            executes: s.executes.load(Ordering::SeqCst),
            rows_pulled: s.rows_pulled.load(Ordering::SeqCst),
        }
    }

    /// Statements sent to the driver, in order
    pub fn executed(&self) -> Vec<BoundStatement> {
        self.state.executed.lock().clone()
    }

    /// Wait until at least `count` closes happened
    pub async fn wait_for_closes(&self, count: u64) {
        loop {
            let notified = self.state.closed.notified();
            if self.state.closes.load(Ordering::SeqCst) >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if let Some(message) = &self.script.connect_error {
            return Err(Error::connection(message.clone()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            metadata: self.metadata.clone(),
            script: self.script.clone(),
            state: self.state.clone(),
        }))
    }

    fn metadata(&self) -> ConnectionMetadata {
        self.metadata.clone()
    }
}

/// Scripted connection created by [`MockConnectionFactory`]
#[derive(Debug)]
pub struct MockConnection {
    metadata: ConnectionMetadata,
    script: Script,
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    fn metadata(&self) -> ConnectionMetadata {
        self.metadata.clone()
    }

    async fn query(&self, statement: &BoundStatement) -> Result<RowStream> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push(statement.clone());
        if let Some(message) = &self.script.query_error {
            return Err(Error::execution(message.clone()));
        }

        let state = self.state.clone();
        let fail_at = self.script.fail_at_row;
        let rows = self.script.rows_for(&statement.sql);
        let stream = stream::iter(rows.into_iter().enumerate()).map(move |(index, row)| {
            if fail_at == Some(index) {
                return Err(Error::execution(format!("cursor failed at row {}", index)));
            }
            state.rows_pulled.fetch_add(1, Ordering::SeqCst);
            Ok(row)
        });
        Ok(stream.boxed())
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<ExecuteResult> {
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        self.state.executed.lock().push(statement.clone());
        if let Some(message) = &self.script.execute_error {
            return Err(Error::execution(message.clone()));
        }
        let keys = if statement.generated_keys.is_some() {
            self.script.generated_keys.clone()
        } else {
            Vec::new()
        };
        Ok(ExecuteResult::new(self.script.rows_affected).with_generated_keys(keys))
    }

    async fn begin(&self) -> Result<()> {
        if self.state.stall_begin.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.state.stall_commit.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.state.stall_next_close.swap(false, Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.closed.notify_waiters();
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(Error::connection("close failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_are_counted_when_pulled() {
        let factory = MockConnectionFactory::new("H2").with_rows(
            &[("id", "INTEGER")],
            vec![vec![Value::Int32(1)], vec![Value::Int32(2)]],
        );
        let connection = factory.connect().await.unwrap();
        let statement = BoundStatement {
            sql: "SELECT id FROM t".into(),
            bindings: Vec::new(),
            generated_keys: None,
        };
        let mut rows = connection.query(&statement).await.unwrap();
        assert_eq!(factory.stats().rows_pulled, 0);
        rows.next().await.unwrap().unwrap();
        assert_eq!(factory.stats().rows_pulled, 1);
        assert_eq!(factory.executed().len(), 1);
    }
}

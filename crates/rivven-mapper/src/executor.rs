//! Statement execution
//!
//! [`SqlExecutor`] runs mapped statements by id:
//!
//! 1. encode the parameter object through the type adapters
//! 2. lease a connection and resolve its dialect
//! 3. render the statement and hand it to the driver
//! 4. stream the rows through the aggregation engine
//!
//! Each standalone operation gets its own lease. [`SqlExecutor::begin`]
//! opens a [`Transaction`] whose operations share one lease.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregate::{aggregate, AggregationContext};
use crate::connection::{ConnectionFactory, ExecuteResult};
use crate::decoder::RowDecoder;
use crate::error::{Error, Result};
use crate::lifecycle::{ConnectionLease, LeaseGuard, LifecycleManager, ReleaseStrategy};
use crate::listener::{ExecutionListener, ExecutionOutcome};
use crate::render::{bind_parameters, render, BoundParameters, BoundStatement, ToParameters};
use crate::statement::{Configuration, MappedStatement, StatementKind};
use crate::types::Value;

/// Context attribute forcing a dialect by name
pub const DIALECT_ATTRIBUTE: &str = "rivven.mapper.dialect";

/// Per-operation attributes
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    attributes: HashMap<String, String>,
}

impl ExecutionContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Force the dialect named `dialect`
    pub fn with_dialect(self, dialect: impl Into<String>) -> Self {
        self.with_attribute(DIALECT_ATTRIBUTE, dialect)
    }

    /// Attribute value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Forced dialect, if any
    pub fn dialect(&self) -> Option<&str> {
        self.get(DIALECT_ATTRIBUTE)
    }
}

/// Receives generated keys after an insert
pub trait GeneratedKeyTarget {
    /// Store the key found in `column` of `row` into `property`
    fn set_generated_key(&mut self, property: &str, row: &mut RowDecoder, column: &str) -> Result<()>;
}

impl GeneratedKeyTarget for HashMap<String, Value> {
    fn set_generated_key(&mut self, property: &str, row: &mut RowDecoder, column: &str) -> Result<()> {
        let value = row.raw(column)?.clone();
        self.insert(property.to_string(), value);
        Ok(())
    }
}

/// Notifies listeners about one statement
struct Probe {
    statement: Arc<str>,
    kind: StatementKind,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    started: Instant,
}

impl Probe {
    fn new(statement: &MappedStatement, configuration: &Configuration) -> Self {
        Self {
            statement: Arc::from(statement.id()),
            kind: statement.kind(),
            listeners: configuration.listeners(),
            started: Instant::now(),
        }
    }

    fn prepared(&mut self, bound: &BoundStatement) {
        for listener in &self.listeners {
            listener.on_prepared(&self.statement, self.kind, bound);
        }
        self.started = Instant::now();
    }

    fn completed(&self, outcome: ExecutionOutcome) {
        let elapsed = self.started.elapsed();
        for listener in &self.listeners {
            listener.on_completed(&self.statement, outcome, elapsed);
        }
    }

    fn failed(&self, error: &Error) {
        for listener in &self.listeners {
            listener.on_failed(&self.statement, error);
        }
    }
}

/// A statement with its parameters encoded, waiting for a connection
struct Prepared {
    statement: Arc<MappedStatement>,
    params: BoundParameters,
    dialect: Option<String>,
}

impl Prepared {
    /// Resolve the dialect for `lease` and render
    fn render(&self, configuration: &Configuration, lease: &ConnectionLease) -> Result<BoundStatement> {
        let product = lease.metadata().product_name;
        let dialect = configuration
            .dialects()
            .resolve(&product, self.dialect.as_deref())?;
        let bound = render(&dialect, self.statement.template(), &self.params)?;
        Ok(match self.statement.generated_keys() {
            Some(keys) => bound.with_generated_keys(keys.columns.clone()),
            None => bound,
        })
    }
}

/// Executes mapped statements
#[derive(Clone)]
pub struct SqlExecutor {
    configuration: Arc<Configuration>,
    lifecycle: LifecycleManager,
}

impl SqlExecutor {
    /// Executor opening a connection from `factory` per operation
    pub fn new(configuration: Arc<Configuration>, factory: Arc<dyn ConnectionFactory>) -> Self {
        let lifecycle =
            LifecycleManager::new(factory).with_auto_commit(configuration.settings().auto_commit);
        Self {
            configuration,
            lifecycle,
        }
    }

    /// Release connections with `strategy` instead of closing them
    pub fn with_release_strategy(mut self, strategy: Arc<dyn ReleaseStrategy>) -> Self {
        self.lifecycle = self.lifecycle.with_strategy(strategy);
        self
    }

    /// Shared configuration
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    fn prepare<P>(
        &self,
        id: &str,
        parameter: &P,
        context: &ExecutionContext,
        expect_query: bool,
    ) -> Result<Prepared>
    where
        P: ToParameters + ?Sized,
    {
        let statement = self.configuration.statement(id)?;
        if statement.kind().is_mutating() == expect_query {
            return Err(Error::config(format!(
                "statement '{}' is a {} statement",
                id,
                statement.kind()
            )));
        }
        let params = bind_parameters(id, self.configuration.adapters(), parameter)?;
        let dialect = context
            .dialect()
            .or(statement.dialect())
            .or(self.configuration.settings().default_dialect.as_deref())
            .map(str::to_string);
        Ok(Prepared {
            statement,
            params,
            dialect,
        })
    }

    /// Run a query, streaming mapped objects
    pub fn select_many<T, P>(&self, id: &str, parameter: &P) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        self.select_many_with(id, parameter, &ExecutionContext::default())
    }

    /// Run a query with context attributes
    pub fn select_many_with<T, P>(
        &self,
        id: &str,
        parameter: &P,
        context: &ExecutionContext,
    ) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        let prepared = self.prepare(id, parameter, context, true).and_then(|prepared| {
            let map = prepared.statement.result_map::<T>()?;
            Ok((prepared, map))
        });
        let (prepared, map) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let configuration = self.configuration.clone();
        self.lifecycle.stream(move |lease| async move {
            let mut probe = Probe::new(&prepared.statement, &configuration);
            let bound = match prepared.render(&configuration, &lease) {
                Ok(bound) => bound,
                Err(e) => {
                    probe.failed(&e);
                    return Err(e);
                }
            };
            probe.prepared(&bound);

            let rows = match lease.connection().query(&bound).await {
                Ok(rows) => rows,
                Err(e) => {
                    let e = e.with_sql(&bound.sql);
                    probe.failed(&e);
                    return Err(e);
                }
            };

            let counter = Arc::new(AtomicU64::new(0));
            let counted = counter.clone();
            let rows = rows
                .inspect(move |row| {
                    if row.is_ok() {
                        counted.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .boxed();

            let context = AggregationContext::new(prepared.statement.id(), configuration.adapters().clone())
                .with_unordered_warn_rows(
                    configuration
                        .settings()
                        .unordered_buffer_warn_rows
                        .map(|rows| rows as usize),
                );
            let mut objects = aggregate(rows, map, context);

            let instrumented = async_stream::stream! {
                while let Some(item) = objects.next().await {
                    if let Err(e) = &item {
                        probe.failed(e);
                        yield item;
                        return;
                    }
                    yield item;
                }
                probe.completed(ExecutionOutcome::Rows(counter.load(Ordering::Relaxed)));
            };
            Ok(instrumented.boxed())
        })
    }

    /// Run a query expecting at most one object
    pub async fn select_one<T, P>(&self, id: &str, parameter: &P) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        self.select_one_with(id, parameter, &ExecutionContext::default())
            .await
    }

    /// Run a query expecting at most one object, with context attributes
    pub async fn select_one_with<T, P>(
        &self,
        id: &str,
        parameter: &P,
        context: &ExecutionContext,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        let mut objects = self.select_many_with::<T, P>(id, parameter, context);
        let first = match objects.next().await {
            Some(first) => first?,
            None => return Ok(None),
        };
        match objects.next().await {
            None => Ok(Some(first)),
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => Err(Error::mapping(
                id,
                "*",
                std::any::type_name::<T>(),
                "expected one result, found more",
            )),
        }
    }

    async fn mutate<P>(
        &self,
        id: &str,
        parameter: &P,
        context: &ExecutionContext,
    ) -> Result<(Arc<MappedStatement>, ExecuteResult)>
    where
        P: ToParameters + ?Sized,
    {
        let prepared = self.prepare(id, parameter, context, false)?;
        let configuration = self.configuration.clone();
        self.lifecycle
            .run(|lease| async move {
                let result = execute_mutation(&configuration, &prepared, &lease).await?;
                Ok((prepared.statement, result))
            })
            .await
    }

    /// Run an UPDATE, returning the affected row count
    pub async fn update<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.update_with(id, parameter, &ExecutionContext::default())
            .await
    }

    /// Run a mutating statement with context attributes
    pub async fn update_with<P>(
        &self,
        id: &str,
        parameter: &P,
        context: &ExecutionContext,
    ) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        let (_, result) = self.mutate(id, parameter, context).await?;
        Ok(result.rows_affected)
    }

    /// Run an INSERT, returning the affected row count
    pub async fn insert<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.update(id, parameter).await
    }

    /// Run a DELETE, returning the affected row count
    pub async fn delete<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.update(id, parameter).await
    }

    /// Run an INSERT and store the generated keys into `parameter`
    pub async fn insert_returning<P>(&self, id: &str, parameter: &mut P) -> Result<u64>
    where
        P: ToParameters + GeneratedKeyTarget,
    {
        self.insert_returning_with(id, parameter, &ExecutionContext::default())
            .await
    }

    /// Run an INSERT with context attributes and store the generated keys
    pub async fn insert_returning_with<P>(
        &self,
        id: &str,
        parameter: &mut P,
        context: &ExecutionContext,
    ) -> Result<u64>
    where
        P: ToParameters + GeneratedKeyTarget,
    {
        let prepared = self.prepare(id, &*parameter, context, false)?;
        if prepared.statement.generated_keys().is_none() {
            return Err(Error::config(format!(
                "statement '{}' does not request generated keys",
                id
            )));
        }
        let configuration = self.configuration.clone();
        self.lifecycle
            .run(|lease| async move {
                let result = execute_mutation(&configuration, &prepared, &lease).await?;
                apply_generated_keys(&configuration, &prepared.statement, &result, parameter)?;
                Ok(result.rows_affected)
            })
            .await
    }

    /// Open a transaction; its operations share one connection
    pub async fn begin(&self) -> Result<Transaction> {
        if self.lifecycle.is_scoped() {
            return Err(Error::transaction("nested transactions are not supported"));
        }
        let lease = self.lifecycle.clone().with_auto_commit(true).acquire().await?;
        let guard = LeaseGuard::new(lease.clone(), true);
        if let Err(e) = lease.begin().await {
            return guard.settle(Err(e)).await;
        }
        tracing::debug!(lease = lease.id(), "Transaction started");
        Ok(Transaction {
            executor: SqlExecutor {
                configuration: self.configuration.clone(),
                lifecycle: LifecycleManager::scoped(lease.clone()),
            },
            lease,
            guard: Some(guard),
        })
    }
}

impl std::fmt::Debug for SqlExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlExecutor")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

async fn execute_mutation(
    configuration: &Configuration,
    prepared: &Prepared,
    lease: &ConnectionLease,
) -> Result<ExecuteResult> {
    let mut probe = Probe::new(&prepared.statement, configuration);
    let bound = prepared.render(configuration, lease).inspect_err(|e| probe.failed(e))?;
    probe.prepared(&bound);

    lease.mark_mutated();
    match lease.connection().execute(&bound).await {
        Ok(result) => {
            probe.completed(ExecutionOutcome::Updates(result.rows_affected));
            Ok(result)
        }
        Err(e) => {
            let e = e.with_sql(&bound.sql);
            probe.failed(&e);
            Err(e)
        }
    }
}

fn apply_generated_keys<P: GeneratedKeyTarget + ?Sized>(
    configuration: &Configuration,
    statement: &MappedStatement,
    result: &ExecuteResult,
    target: &mut P,
) -> Result<()> {
    let Some(keys) = statement.generated_keys() else {
        return Ok(());
    };
    let Some(row) = result.generated_keys.first() else {
        return Err(Error::generated_key(
            statement.id(),
            "driver reported no generated keys",
        ));
    };

    let mut decoder = RowDecoder::new(
        row.clone(),
        Arc::from(statement.id()),
        configuration.adapters().clone(),
    );
    for (property, column) in keys.pairs() {
        if decoder.row().index_of(column).is_none() {
            return Err(Error::generated_key(
                statement.id(),
                format!("driver did not report key column '{}'", column),
            ));
        }
        target
            .set_generated_key(property, &mut decoder, column)
            .map_err(|e| {
                Error::generated_key(
                    statement.id(),
                    format!("cannot set property '{}': {}", property, e),
                )
            })?;
    }
    Ok(())
}

/// Operations sharing one connection and transaction.
///
/// Dropping an open transaction rolls back pending changes and releases
/// the connection in the background.
pub struct Transaction {
    executor: SqlExecutor,
    lease: ConnectionLease,
    guard: Option<LeaseGuard>,
}

impl Transaction {
    /// Executor bound to this transaction
    pub fn executor(&self) -> &SqlExecutor {
        &self.executor
    }

    /// The shared lease
    pub fn lease(&self) -> &ConnectionLease {
        &self.lease
    }

    /// Run a query in this transaction
    pub fn select_many<T, P>(&self, id: &str, parameter: &P) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        self.executor.select_many(id, parameter)
    }

    /// Run a query expecting at most one object in this transaction
    pub async fn select_one<T, P>(&self, id: &str, parameter: &P) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: ToParameters + ?Sized,
    {
        self.executor.select_one(id, parameter).await
    }

    /// Run a mutating statement in this transaction
    pub async fn update<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.executor.update(id, parameter).await
    }

    /// Run an INSERT in this transaction
    pub async fn insert<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.executor.insert(id, parameter).await
    }

    /// Run a DELETE in this transaction
    pub async fn delete<P>(&self, id: &str, parameter: &P) -> Result<u64>
    where
        P: ToParameters + ?Sized,
    {
        self.executor.delete(id, parameter).await
    }

    /// Run an INSERT in this transaction and store the generated keys
    pub async fn insert_returning<P>(&self, id: &str, parameter: &mut P) -> Result<u64>
    where
        P: ToParameters + GeneratedKeyTarget,
    {
        self.executor.insert_returning(id, parameter).await
    }

    /// Commit when `force` is set or a mutating statement ran
    pub async fn commit(&self, force: bool) -> Result<()> {
        self.lease.commit(force).await
    }

    /// Roll back when `force` is set or a mutating statement ran
    pub async fn rollback(&self, force: bool) -> Result<()> {
        self.lease.rollback(force).await
    }

    /// Roll back uncommitted changes and release the connection
    pub async fn close(mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let outcome = self.lease.rollback(false).await;
        guard.settle(outcome).await
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("lease", &self.lease)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_dialect_attribute() {
        let context = ExecutionContext::new().with_dialect("Oracle");
        assert_eq!(context.dialect(), Some("Oracle"));
        assert_eq!(context.get(DIALECT_ATTRIBUTE), Some("Oracle"));
        assert_eq!(ExecutionContext::new().dialect(), None);
    }
}

//! PostgreSQL driver for rivven-mapper
//!
//! Backed by `tokio-postgres`:
//! - Rows stream from the server with `query_raw`; dropping the stream
//!   abandons the portal
//! - Generated keys are read through `RETURNING`
//! - Transactions are demarcated with `BEGIN`/`COMMIT`/`ROLLBACK`

use async_trait::async_trait;
use futures::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, ConnectionMetadata, ExecuteResult, RowStream,
};
use crate::error::{Error, Result};
use crate::render::BoundStatement;
use crate::types::{ColumnMetadata, Row, Value};

type PgParam = Box<dyn tokio_postgres::types::ToSql + Sync + Send>;

/// Convert a mapper Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> PgParam {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int8(n) => Box::new(i16::from(*n)), // PostgreSQL has no 1-byte integer
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn columns_of(pg_row: &tokio_postgres::Row) -> Arc<[ColumnMetadata]> {
    pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(ordinal, c)| ColumnMetadata {
            ordinal,
            ..ColumnMetadata::new(c.name(), c.type_().name())
        })
        .collect()
}

/// Convert a tokio-postgres row, reusing the column list of earlier rows
fn pg_row_to_row(pg_row: &tokio_postgres::Row, columns: &Arc<[ColumnMetadata]>) -> Result<Row> {
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.clone(), values))
}

fn decode_error(column: &tokio_postgres::Column, source: tokio_postgres::Error) -> Error {
    Error::driver(
        format!(
            "failed to decode column '{}' of type {}",
            column.name(),
            column.type_().name()
        ),
        source,
    )
}

macro_rules! get_as {
    ($row:expr, $idx:expr, $col:expr, $ty:ty, $variant:path) => {
        $row.try_get::<_, Option<$ty>>($idx)
            .map(|value| value.map($variant).unwrap_or(Value::Null))
            .map_err(|e| decode_error($col, e))
    };
}

/// Convert a PostgreSQL column value to a mapper Value
fn pg_value_to_value(
    row: &tokio_postgres::Row,
    idx: usize,
    col: &tokio_postgres::Column,
) -> Result<Value> {
    use tokio_postgres::types::Type;

    match *col.type_() {
        Type::BOOL => get_as!(row, idx, col, bool, Value::Bool),
        Type::INT2 => get_as!(row, idx, col, i16, Value::Int16),
        Type::INT4 => get_as!(row, idx, col, i32, Value::Int32),
        Type::INT8 => get_as!(row, idx, col, i64, Value::Int64),
        Type::FLOAT4 => get_as!(row, idx, col, f32, Value::Float32),
        Type::FLOAT8 => get_as!(row, idx, col, f64, Value::Float64),
        Type::NUMERIC => get_as!(row, idx, col, rust_decimal::Decimal, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            get_as!(row, idx, col, String, Value::String)
        }
        Type::BYTEA => get_as!(row, idx, col, Vec<u8>, Value::Bytes),
        Type::DATE => get_as!(row, idx, col, chrono::NaiveDate, Value::Date),
        Type::TIME => get_as!(row, idx, col, chrono::NaiveTime, Value::Time),
        Type::TIMESTAMP => get_as!(row, idx, col, chrono::NaiveDateTime, Value::DateTime),
        Type::TIMESTAMPTZ => {
            get_as!(row, idx, col, chrono::DateTime<chrono::Utc>, Value::DateTimeTz)
        }
        Type::UUID => get_as!(row, idx, col, uuid::Uuid, Value::Uuid),
        Type::JSON | Type::JSONB => get_as!(row, idx, col, serde_json::Value, Value::Json),
        // other types must be readable as text; anything else is a decode error
        _ => get_as!(row, idx, col, String, Value::String),
    }
}

fn returning_clause(sql: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        return sql.to_string();
    }
    format!(
        "{} RETURNING {}",
        sql.trim_end().trim_end_matches(';'),
        columns.join(", ")
    )
}

/// PostgreSQL connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    metadata: ConnectionMetadata,
    closed: AtomicBool,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: tokio_postgres::Client, server_version: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            metadata: ConnectionMetadata::new("PostgreSQL", server_version),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn simple(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        self.client.batch_execute(command).await.map_err(|e| Error::Transaction {
            message: format!("{} failed: {}", command, e),
            source: Some(Box::new(e)),
        })
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn metadata(&self) -> ConnectionMetadata {
        self.metadata.clone()
    }

    async fn query(&self, statement: &BoundStatement) -> Result<RowStream> {
        self.ensure_open()?;
        let params: Vec<PgParam> = statement.bindings.iter().map(|b| value_to_sql(&b.value)).collect();
        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|b| b.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        let pg_rows = self
            .client
            .query_raw(statement.sql.as_str(), param_refs)
            .await
            .map_err(|e| Error::driver("query failed", e).with_sql(&statement.sql))?;

        let mut columns: Option<Arc<[ColumnMetadata]>> = None;
        let rows = pg_rows.map(move |row| {
            let row = row.map_err(|e| Error::driver("failed to fetch row", e))?;
            let columns = columns.get_or_insert_with(|| columns_of(&row));
            pg_row_to_row(&row, columns)
        });
        Ok(rows.boxed())
    }

    async fn execute(&self, statement: &BoundStatement) -> Result<ExecuteResult> {
        self.ensure_open()?;
        let params: Vec<PgParam> = statement.bindings.iter().map(|b| value_to_sql(&b.value)).collect();
        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|b| b.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        match &statement.generated_keys {
            Some(key_columns) => {
                let sql = returning_clause(&statement.sql, key_columns);
                let pg_rows = self
                    .client
                    .query(sql.as_str(), &param_refs)
                    .await
                    .map_err(|e| Error::driver("statement failed", e).with_sql(&sql))?;
                let keys: Vec<Row> = match pg_rows.first() {
                    Some(first) => {
                        let columns = columns_of(first);
                        pg_rows
                            .iter()
                            .map(|r| pg_row_to_row(r, &columns))
                            .collect::<Result<_>>()
                            .map_err(|e| e.with_sql(&sql))?
                    }
                    None => Vec::new(),
                };
                Ok(ExecuteResult::new(keys.len() as u64).with_generated_keys(keys))
            }
            None => {
                let affected = self
                    .client
                    .execute(statement.sql.as_str(), &param_refs)
                    .await
                    .map_err(|e| Error::driver("statement failed", e).with_sql(&statement.sql))?;
                Ok(ExecuteResult::new(affected))
            }
        }
    }

    async fn begin(&self) -> Result<()> {
        self.simple("BEGIN").await
    }

    async fn commit(&self) -> Result<()> {
        self.simple("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.simple("ROLLBACK").await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    config: ConnectionConfig,
}

impl PgConnectionFactory {
    /// Factory connecting with `config`
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Connection settings
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = self
            .config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;
        pg_config.connect_timeout(Duration::from_millis(self.config.connect_timeout_ms));
        if let Some(name) = &self.config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        let version = client
            .query_one("SHOW server_version", &[])
            .await
            .ok()
            .and_then(|row| row.try_get::<_, String>(0).ok())
            .unwrap_or_default();

        Ok(Box::new(PgConnection::new(client, version)))
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata::new("PostgreSQL", "")
    }
}

/// Connect to a PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory::new(ConnectionConfig::new(url))
        .connect()
        .await
}

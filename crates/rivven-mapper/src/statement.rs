//! Mapped statements and the configuration that holds them
//!
//! A [`Configuration`] is built once at startup and shared by every
//! executor. It owns the dialect and type adapter registries, the statement
//! registry and the execution listeners.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::{AdapterModule, TypeAdapter, TypeAdapterRegistry};
use crate::config::MapperConfig;
use crate::dialect::{Dialect, DialectRegistry};
use crate::error::{Error, Result};
use crate::listener::{AtomicExecutorStats, ExecutionListener, TracingListener};
use crate::mapping::ResultMap;
use crate::render::StatementTemplate;

/// Kind of a mapped statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Query producing rows
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
}

impl StatementKind {
    /// Whether the statement changes data
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Select)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "select"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Generated keys requested by a mutating statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKeys {
    /// Properties of the parameter object receiving the keys
    pub properties: Vec<String>,
    /// Key columns reported by the driver, one per property
    pub columns: Vec<String>,
}

impl GeneratedKeys {
    /// Keys whose column names equal the property names
    pub fn new<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let properties: Vec<String> = properties.into_iter().map(Into::into).collect();
        Self {
            columns: properties.clone(),
            properties,
        }
    }

    /// Read the keys from differently named columns
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// (property, column) pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .zip(self.columns.iter())
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }
}

struct ErasedResultMap {
    type_name: &'static str,
    // always an `Arc<ResultMap<T>>` for the recorded `T`
    map: Arc<dyn Any + Send + Sync>,
}

/// A statement registered under an id
pub struct MappedStatement {
    id: String,
    kind: StatementKind,
    template: StatementTemplate,
    result_map: Option<ErasedResultMap>,
    generated_keys: Option<GeneratedKeys>,
    dialect: Option<String>,
}

impl MappedStatement {
    fn new(id: impl Into<String>, kind: StatementKind, template: StatementTemplate) -> Self {
        Self {
            id: id.into(),
            kind,
            template,
            result_map: None,
            generated_keys: None,
            dialect: None,
        }
    }

    /// Query whose rows are mapped by `map`
    pub fn select<T, M>(id: impl Into<String>, template: StatementTemplate, map: M) -> Self
    where
        T: Send + 'static,
        M: Into<Arc<ResultMap<T>>>,
    {
        let map: Arc<ResultMap<T>> = map.into();
        let mut statement = Self::new(id, StatementKind::Select, template);
        statement.result_map = Some(ErasedResultMap {
            type_name: std::any::type_name::<T>(),
            map: Arc::new(map),
        });
        statement
    }

    /// INSERT statement
    pub fn insert(id: impl Into<String>, template: StatementTemplate) -> Self {
        Self::new(id, StatementKind::Insert, template)
    }

    /// UPDATE statement
    pub fn update(id: impl Into<String>, template: StatementTemplate) -> Self {
        Self::new(id, StatementKind::Update, template)
    }

    /// DELETE statement
    pub fn delete(id: impl Into<String>, template: StatementTemplate) -> Self {
        Self::new(id, StatementKind::Delete, template)
    }

    /// Request generated keys
    pub fn with_generated_keys(mut self, keys: GeneratedKeys) -> Self {
        self.generated_keys = Some(keys);
        self
    }

    /// Always render with the named dialect
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    /// Statement id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Statement kind
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// SQL template
    pub fn template(&self) -> &StatementTemplate {
        &self.template
    }

    /// Requested generated keys
    pub fn generated_keys(&self) -> Option<&GeneratedKeys> {
        self.generated_keys.as_ref()
    }

    /// Dialect forced by the statement
    pub fn dialect(&self) -> Option<&str> {
        self.dialect.as_deref()
    }

    /// Result map for `T`, or a configuration error on a type mismatch
    pub fn result_map<T: Send + 'static>(&self) -> Result<Arc<ResultMap<T>>> {
        let erased = self.result_map.as_ref().ok_or_else(|| {
            Error::config(format!("statement '{}' has no result map", self.id))
        })?;
        erased
            .map
            .downcast_ref::<Arc<ResultMap<T>>>()
            .cloned()
            .ok_or_else(|| {
                Error::config(format!(
                    "statement '{}' maps rows to {}, not {}",
                    self.id,
                    erased.type_name,
                    std::any::type_name::<T>()
                ))
            })
    }
}

impl fmt::Debug for MappedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedStatement")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("sql", &self.template.sql)
            .field("result_type", &self.result_map.as_ref().map(|m| m.type_name))
            .field("generated_keys", &self.generated_keys)
            .field("dialect", &self.dialect)
            .finish()
    }
}

/// Registries, statements and listeners shared by executors
pub struct Configuration {
    settings: MapperConfig,
    dialects: Arc<DialectRegistry>,
    adapters: Arc<TypeAdapterRegistry>,
    statements: RwLock<HashMap<String, Arc<MappedStatement>>>,
    listeners: RwLock<Vec<Arc<dyn ExecutionListener>>>,
    stats: Arc<AtomicExecutorStats>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new(MapperConfig::default())
    }
}

impl Configuration {
    /// Configuration with the built-in dialects and adapters
    pub fn new(settings: MapperConfig) -> Self {
        Self::with_registries(
            settings,
            Arc::new(DialectRegistry::new()),
            Arc::new(TypeAdapterRegistry::new()),
        )
    }

    /// Configuration over existing registries
    pub fn with_registries(
        settings: MapperConfig,
        dialects: Arc<DialectRegistry>,
        adapters: Arc<TypeAdapterRegistry>,
    ) -> Self {
        let stats = Arc::new(AtomicExecutorStats::new());
        let listeners: Vec<Arc<dyn ExecutionListener>> = vec![
            Arc::new(TracingListener::new(settings.log_parameters)),
            stats.clone(),
        ];
        Self {
            settings,
            dialects,
            adapters,
            statements: RwLock::new(HashMap::new()),
            listeners: RwLock::new(listeners),
            stats,
        }
    }

    /// Mapper settings
    pub fn settings(&self) -> &MapperConfig {
        &self.settings
    }

    /// Dialect registry
    pub fn dialects(&self) -> &Arc<DialectRegistry> {
        &self.dialects
    }

    /// Type adapter registry
    pub fn adapters(&self) -> &Arc<TypeAdapterRegistry> {
        &self.adapters
    }

    /// Register a dialect
    pub fn register_dialect(&self, dialect: Dialect) {
        self.dialects.register(dialect);
    }

    /// Register a type adapter
    pub fn register_type_adapter<T, A>(&self, adapter: A)
    where
        T: 'static,
        A: TypeAdapter<T>,
    {
        self.adapters.register::<T, A>(adapter);
    }

    /// Register a module of type adapters
    pub fn register_adapter_module<M: AdapterModule + ?Sized>(&self, module: &M) {
        self.adapters.register_module(module);
    }

    /// Register a statement; ids must be unique
    pub fn add_statement(&self, statement: MappedStatement) -> Result<()> {
        let mut statements = self.statements.write();
        if statements.contains_key(&statement.id) {
            return Err(Error::config(format!(
                "statement '{}' is already registered",
                statement.id
            )));
        }
        if statement.kind == StatementKind::Select && statement.result_map.is_none() {
            return Err(Error::config(format!(
                "select statement '{}' has no result map",
                statement.id
            )));
        }
        tracing::debug!("Registered {} statement '{}'", statement.kind, statement.id);
        statements.insert(statement.id.clone(), Arc::new(statement));
        Ok(())
    }

    /// Look up a statement
    pub fn statement(&self, id: &str) -> Result<Arc<MappedStatement>> {
        self.statements
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown statement '{}'", id)))
    }

    /// Ids of all registered statements
    pub fn statement_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.statements.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Add an execution listener
    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.write().push(listener);
    }

    /// Current listeners
    pub fn listeners(&self) -> Vec<Arc<dyn ExecutionListener>> {
        self.listeners.read().clone()
    }

    /// Execution statistics across all executors
    pub fn stats(&self) -> &Arc<AtomicExecutorStats> {
        &self.stats
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("settings", &self.settings)
            .field("dialects", &self.dialects)
            .field("adapters", &self.adapters)
            .field("statements", &self.statement_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_map() -> ResultMap<i64> {
        ResultMap::from_fn("id", |row| row.get_required(0usize))
    }

    #[test]
    fn test_result_map_type_is_checked() {
        let statement = MappedStatement::select("ids", StatementTemplate::new("SELECT id FROM t"), id_map());
        assert!(statement.result_map::<i64>().is_ok());
        let err = statement.result_map::<String>().unwrap_err();
        assert!(err.to_string().contains("maps rows to i64"));
    }

    #[test]
    fn test_duplicate_statement_ids_are_rejected() {
        let configuration = Configuration::default();
        let template = StatementTemplate::new("DELETE FROM t");
        configuration
            .add_statement(MappedStatement::delete("purge", template.clone()))
            .unwrap();
        assert!(configuration
            .add_statement(MappedStatement::delete("purge", template))
            .is_err());
        assert!(configuration.statement("missing").is_err());
    }

    #[test]
    fn test_generated_key_pairs() {
        let keys = GeneratedKeys::new(["id"]).with_columns(["ID"]);
        assert_eq!(keys.pairs().collect::<Vec<_>>(), vec![("id", "ID")]);
    }
}

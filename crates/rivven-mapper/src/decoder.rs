//! Row decoding for rivven-mapper
//!
//! A [`RowDecoder`] is a lazy, cached view over one raw [`Row`]. Column
//! values are decoded through the type adapter for the requested target
//! type on first access and cached per (column, type), so a column feeding
//! several mapped fields is decoded once. The cache lives and dies with the
//! row.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::TypeAdapterRegistry;
use crate::error::{Error, Result};
use crate::types::{ParentKey, Row, Value};

/// Reference to a result column, by label or by 0-based index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnRef {
    /// Column label (case-insensitive)
    Name(String),
    /// Column position
    Index(usize),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{}", name),
            Self::Index(index) => write!(f, "#{}", index),
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for ColumnRef {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<usize> for ColumnRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&ColumnRef> for ColumnRef {
    fn from(column: &ColumnRef) -> Self {
        column.clone()
    }
}

/// Lazy, cached view over one result row
pub struct RowDecoder {
    row: Row,
    statement: Arc<str>,
    registry: Arc<TypeAdapterRegistry>,
    cache: HashMap<(usize, TypeId), Box<dyn Any + Send>>,
}

impl RowDecoder {
    /// Wrap `row` produced by `statement`
    pub fn new(row: Row, statement: Arc<str>, registry: Arc<TypeAdapterRegistry>) -> Self {
        Self {
            row,
            statement,
            registry,
            cache: HashMap::new(),
        }
    }

    /// The raw row
    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Id of the statement that produced the row
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Number of cached (column, type) entries
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn index_of(&self, column: &ColumnRef, target_type: &str) -> Result<usize> {
        let index = match column {
            ColumnRef::Name(name) => self.row.index_of(name),
            ColumnRef::Index(index) => Some(*index).filter(|i| *i < self.row.len()),
        };
        index.ok_or_else(|| {
            Error::mapping(
                self.statement.as_ref(),
                column.to_string(),
                target_type,
                "column not present in result set",
            )
        })
    }

    /// Decode a column as `T`; `None` for SQL NULL
    pub fn get<T>(&mut self, column: impl Into<ColumnRef>) -> Result<Option<T>>
    where
        T: Clone + Send + 'static,
    {
        let column = column.into();
        let target_type = std::any::type_name::<T>();
        let index = self.index_of(&column, target_type)?;
        let key = (index, TypeId::of::<T>());

        if let Some(cached) = self.cache.get(&key).and_then(|c| c.downcast_ref::<Option<T>>()) {
            return Ok(cached.clone());
        }

        let adapter = self.registry.get::<T>().ok_or_else(|| {
            Error::mapping(
                self.statement.as_ref(),
                column.to_string(),
                target_type,
                "no type adapter registered",
            )
        })?;

        let decoded = match &column {
            ColumnRef::Name(name) => adapter.decode_by_name(&self.row, name),
            ColumnRef::Index(index) => adapter.decode_by_index(&self.row, *index),
        }
        .map_err(|e| {
            Error::mapping(
                self.statement.as_ref(),
                column.to_string(),
                target_type,
                e.message(),
            )
        })?;

        self.cache.insert(key, Box::new(decoded.clone()));
        Ok(decoded)
    }

    /// Decode a non-nullable column as `T`
    pub fn get_required<T>(&mut self, column: impl Into<ColumnRef>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        let column = column.into();
        self.get::<T>(column.clone())?.ok_or_else(|| {
            Error::mapping(
                self.statement.as_ref(),
                column.to_string(),
                std::any::type_name::<T>(),
                "unexpected NULL",
            )
        })
    }

    /// Raw wire value of a column, without decoding
    pub fn raw(&self, column: impl Into<ColumnRef>) -> Result<&Value> {
        let column = column.into();
        let index = self.index_of(&column, "Value")?;
        self.row.get(index).ok_or_else(|| {
            Error::mapping(
                self.statement.as_ref(),
                column.to_string(),
                "Value",
                "column not present in result set",
            )
        })
    }

    /// Tuple of raw key column values, compared with typed equality
    pub fn key(&self, columns: &[ColumnRef]) -> Result<ParentKey> {
        let values = columns
            .iter()
            .map(|c| self.raw(c).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(ParentKey::new(values))
    }
}

impl fmt::Debug for RowDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowDecoder")
            .field("statement", &self.statement)
            .field("columns", &self.row.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

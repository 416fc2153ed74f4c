//! Bind-parameter dialects for rivven-mapper
//!
//! A dialect describes how a database vendor spells bind markers:
//! - Anonymous markers in appearance order (`?` for MySQL, MariaDB, SQLite, H2)
//! - Indexed markers (`$1`, `$2` for PostgreSQL)
//! - Named markers (`:p1` for Oracle, `@p1` for SQL Server)
//!
//! Dialects are registered once at startup in a [`DialectRegistry`] and
//! resolved per connection from the reported product name, unless the
//! operation forces one by name.

use parking_lot::RwLock;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::render::code_segments;

/// Name of the fallback dialect used when nothing matches
pub const DEFAULT_DIALECT: &str = "default";

/// How a dialect numbers or names its bind markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStyle {
    /// The marker symbol alone, bound positionally in appearance order
    Anonymous,
    /// Marker symbol followed by `start_index + position`
    Indexed {
        /// Index of the first marker
        start_index: usize,
    },
    /// Marker symbol followed by a parameter name
    Named {
        /// Index used for synthetic names (`p{start_index + position}`)
        start_index: usize,
        /// Use the declared property name when it is a plain identifier
        declared_names: bool,
    },
}

/// A database vendor's bind-parameter syntax
#[derive(Clone)]
pub struct Dialect {
    name: String,
    marker: String,
    style: BindStyle,
    product_names: Vec<String>,
    pattern: Regex,
}

impl Dialect {
    /// Create a dialect; it matches products whose name contains `name`
    pub fn new(name: impl Into<String>, marker: impl Into<String>, style: BindStyle) -> Self {
        let name = name.into();
        let marker = marker.into();
        let escaped = regex::escape(&marker);
        let pattern = match style {
            BindStyle::Anonymous => escaped,
            BindStyle::Indexed { .. } => format!(r"{}\d+", escaped),
            BindStyle::Named { .. } => format!(r"{}[A-Za-z_][A-Za-z0-9_]*", escaped),
        };
        let pattern =
            Regex::new(&pattern).expect("escaped marker pattern is invalid - this is a bug");
        Self {
            product_names: vec![name.to_lowercase()],
            name,
            marker,
            style,
            pattern,
        }
    }

    /// Replace the product-name fragments this dialect matches
    pub fn with_product_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.product_names = names.into_iter().map(|n| n.into().to_lowercase()).collect();
        self
    }

    /// Fallback dialect: anonymous `?` markers
    pub fn default_positional() -> Self {
        Self::new(DEFAULT_DIALECT, "?", BindStyle::Anonymous).with_product_names(Vec::<String>::new())
    }

    /// MySQL dialect
    pub fn mysql() -> Self {
        Self::new("MySQL", "?", BindStyle::Anonymous)
    }

    /// MariaDB dialect
    pub fn mariadb() -> Self {
        Self::new("MariaDB", "?", BindStyle::Anonymous)
    }

    /// H2 dialect
    pub fn h2() -> Self {
        Self::new("H2", "?", BindStyle::Anonymous)
    }

    /// SQLite dialect
    pub fn sqlite() -> Self {
        Self::new("SQLite", "?", BindStyle::Anonymous)
    }

    /// PostgreSQL dialect
    pub fn postgres() -> Self {
        Self::new("PostgreSQL", "$", BindStyle::Indexed { start_index: 1 })
            .with_product_names(["postgresql", "postgres"])
    }

    /// Oracle dialect
    pub fn oracle() -> Self {
        Self::new(
            "Oracle",
            ":",
            BindStyle::Named {
                start_index: 1,
                declared_names: false,
            },
        )
    }

    /// SQL Server dialect
    pub fn sqlserver() -> Self {
        Self::new(
            "SQL Server",
            "@",
            BindStyle::Named {
                start_index: 1,
                declared_names: false,
            },
        )
        .with_product_names(["microsoft sql server", "sql server", "mssql"])
    }

    /// Dialect name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marker symbol
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Binding style
    pub fn style(&self) -> BindStyle {
        self.style
    }

    /// Whether parameters are bound by name rather than position
    pub fn binds_by_name(&self) -> bool {
        matches!(self.style, BindStyle::Named { .. })
    }

    /// Whether `product_name` identifies a database of this dialect
    pub fn matches_product(&self, product_name: &str) -> bool {
        let product = product_name.to_lowercase();
        self.product_names
            .iter()
            .any(|fragment| !fragment.is_empty() && product.contains(fragment.as_str()))
    }

    /// Render the marker for the `position`-th original marker (0-based)
    pub fn placeholder(&self, position: usize, declared: Option<&str>) -> String {
        match self.style {
            BindStyle::Anonymous => self.marker.clone(),
            BindStyle::Indexed { start_index } => {
                format!("{}{}", self.marker, start_index + position)
            }
            BindStyle::Named {
                start_index,
                declared_names,
            } => match declared {
                Some(name) if declared_names && is_plain_identifier(name) => {
                    format!("{}{}", self.marker, name)
                }
                _ => format!("{}p{}", self.marker, start_index + position),
            },
        }
    }

    /// Bind name the driver expects for the `position`-th marker, if named
    pub fn bind_name(&self, position: usize, declared: Option<&str>) -> Option<String> {
        if !self.binds_by_name() {
            return None;
        }
        let placeholder = self.placeholder(position, declared);
        Some(placeholder[self.marker.len()..].to_string())
    }

    /// Find this dialect's markers in rendered SQL, in order of appearance.
    ///
    /// Quoted literals, quoted identifiers and comments are skipped.
    pub fn find_markers(&self, sql: &str) -> Vec<String> {
        code_segments(sql)
            .into_iter()
            .flat_map(|segment| {
                self.pattern
                    .find_iter(segment)
                    .map(|m| m.as_str().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect")
            .field("name", &self.name)
            .field("marker", &self.marker)
            .field("style", &self.style)
            .field("product_names", &self.product_names)
            .finish()
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registry of dialects, looked up per connection.
///
/// Safe for concurrent reads; registration takes a write lock and is meant
/// for application startup.
pub struct DialectRegistry {
    dialects: RwLock<Vec<Arc<Dialect>>>,
    fallback: Arc<Dialect>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DialectRegistry {
    /// Registry pre-populated with the built-in dialects
    pub fn new() -> Self {
        let registry = Self::empty();
        for dialect in [
            Dialect::mysql(),
            Dialect::mariadb(),
            Dialect::h2(),
            Dialect::sqlite(),
            Dialect::postgres(),
            Dialect::oracle(),
            Dialect::sqlserver(),
        ] {
            registry.register(dialect);
        }
        registry
    }

    /// Registry holding only the fallback `?` dialect
    pub fn empty() -> Self {
        Self {
            dialects: RwLock::new(Vec::new()),
            fallback: Arc::new(Dialect::default_positional()),
        }
    }

    /// Register a dialect, replacing any dialect with the same name
    pub fn register(&self, dialect: Dialect) {
        let mut dialects = self.dialects.write();
        dialects.retain(|d| !d.name.eq_ignore_ascii_case(&dialect.name));
        tracing::debug!("Registered dialect '{}'", dialect.name);
        dialects.push(Arc::new(dialect));
    }

    /// Look up a dialect by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<Arc<Dialect>> {
        if name.eq_ignore_ascii_case(DEFAULT_DIALECT) {
            return Some(self.fallback.clone());
        }
        self.dialects
            .read()
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Names of all registered dialects
    pub fn names(&self) -> Vec<String> {
        self.dialects.read().iter().map(|d| d.name.clone()).collect()
    }

    /// Resolve the dialect for a connection.
    ///
    /// An explicit override wins; otherwise the most recently registered
    /// dialect whose product fragment occurs in `product_name` is used,
    /// falling back to anonymous `?` markers.
    pub fn resolve(&self, product_name: &str, override_name: Option<&str>) -> Result<Arc<Dialect>> {
        if let Some(name) = override_name {
            return self
                .get(name)
                .ok_or_else(|| Error::config(format!("unknown dialect '{}'", name)));
        }

        let found = self
            .dialects
            .read()
            .iter()
            .rev()
            .find(|d| d.matches_product(product_name))
            .cloned();

        Ok(found.unwrap_or_else(|| self.fallback.clone()))
    }
}

impl fmt::Debug for DialectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialectRegistry")
            .field("dialects", &self.names())
            .finish()
    }
}

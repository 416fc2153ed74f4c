//! Statement rendering for rivven-mapper
//!
//! Turns a [`StatementTemplate`] written with anonymous `?` markers into the
//! SQL a specific [`Dialect`] expects, together with an ordered binding plan:
//!
//! ```text
//! SELECT * FROM emp WHERE dept = ? AND name = ?
//!   MySQL       → ... dept = ?  AND name = ?
//!   PostgreSQL  → ... dept = $1 AND name = $2
//!   Oracle      → ... dept = :p1 AND name = :p2
//!   SQL Server  → ... dept = @p1 AND name = @p2
//! ```
//!
//! Binding `i` always belongs to the i-th marker of the template. Quoted
//! literals, quoted identifiers and comments pass through untouched.

use std::collections::HashMap;
use std::fmt;

use crate::adapter::TypeAdapterRegistry;
use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::types::Value;

// ============================================================================
// Scanner
// ============================================================================

/// A slice of SQL text, either code or a quoted/comment region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment<'a> {
    pub text: &'a str,
    pub code: bool,
}

/// Split SQL into code and non-code (literal, quoted identifier, comment) regions
pub(crate) fn scan(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let end = match bytes[i] {
            b'\'' => Some(skip_quoted(bytes, i, b'\'')),
            b'"' => Some(skip_quoted(bytes, i, b'"')),
            b'-' if bytes.get(i + 1) == Some(&b'-') => Some(skip_line_comment(bytes, i)),
            b'/' if bytes.get(i + 1) == Some(&b'*') => Some(skip_block_comment(bytes, i)),
            _ => None,
        };

        match end {
            Some(end) => {
                if start < i {
                    segments.push(Segment {
                        text: &sql[start..i],
                        code: true,
                    });
                }
                segments.push(Segment {
                    text: &sql[i..end],
                    code: false,
                });
                start = end;
                i = end;
            }
            None => i += 1,
        }
    }

    if start < bytes.len() {
        segments.push(Segment {
            text: &sql[start..],
            code: true,
        });
    }
    segments
}

/// Code regions of `sql`, in order
pub(crate) fn code_segments(sql: &str) -> Vec<&str> {
    scan(sql)
        .into_iter()
        .filter(|s| s.code)
        .map(|s| s.text)
        .collect()
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| start + pos + 1)
        .unwrap_or(bytes.len())
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map(|pos| start + 2 + pos + 2)
        .unwrap_or(bytes.len())
}

fn count_markers(sql: &str) -> usize {
    code_segments(sql)
        .iter()
        .map(|s| s.bytes().filter(|&b| b == b'?').count())
        .sum()
}

// ============================================================================
// Templates and parameters
// ============================================================================

/// Property bound to one `?` marker of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMapping {
    /// Property name looked up in the bound parameters
    pub property: String,
}

impl ParameterMapping {
    /// Create a mapping for `property`
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }
}

/// Resolved SQL text with anonymous `?` markers and their property mappings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTemplate {
    /// SQL text
    pub sql: String,
    /// One mapping per marker, in marker order; empty for purely positional use
    pub parameters: Vec<ParameterMapping>,
}

impl StatementTemplate {
    /// Template without property mappings
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    /// Map the next marker to `property`
    pub fn with_parameter(mut self, property: impl Into<String>) -> Self {
        self.parameters.push(ParameterMapping::new(property));
        self
    }

    /// Number of bind markers outside literals and comments
    pub fn marker_count(&self) -> usize {
        count_markers(&self.sql)
    }
}

/// An encoded parameter value plus its diagnostic rendering
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    /// Wire value
    pub value: Value,
    /// Text shown in logs (non-primitive values show the adapter's name)
    pub display: String,
}

impl BoundValue {
    fn new(value: Value, type_name: &str) -> Self {
        let display = if value.is_null() {
            "null".to_string()
        } else if value.is_primitive() {
            format!("{}({})", value, type_name)
        } else {
            format!("<{}>", type_name)
        };
        Self { value, display }
    }
}

/// Parameter values encoded through the type adapters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParameters {
    named: HashMap<String, BoundValue>,
    positional: Vec<BoundValue>,
}

impl BoundParameters {
    /// No parameters
    pub fn empty() -> Self {
        Self::default()
    }

    /// Value bound to `property`
    pub fn get(&self, property: &str) -> Option<&BoundValue> {
        self.named.get(property)
    }

    /// Positional values in bind order
    pub fn positional(&self) -> &[BoundValue] {
        &self.positional
    }

    /// Whether nothing was bound
    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    fn resolve(&self, position: usize, property: Option<&str>) -> Option<&BoundValue> {
        if let Some(found) = property.and_then(|p| self.named.get(p)) {
            return Some(found);
        }
        // a lone scalar parameter satisfies any property name
        if property.is_some() && self.named.is_empty() && self.positional.len() == 1 {
            return self.positional.first();
        }
        self.positional.get(position)
    }
}

/// Collects parameter values, encoding each with its type adapter
pub struct ParameterBinder<'a> {
    statement: &'a str,
    registry: &'a TypeAdapterRegistry,
    params: BoundParameters,
}

impl<'a> ParameterBinder<'a> {
    /// Create a binder for `statement`
    pub fn new(statement: &'a str, registry: &'a TypeAdapterRegistry) -> Self {
        Self {
            statement,
            registry,
            params: BoundParameters::default(),
        }
    }

    fn encode<T: 'static>(&self, property: &str, value: &T) -> Result<BoundValue> {
        let adapter = self.registry.require::<T>()?;
        let encoded = adapter.encode(value).map_err(|e| {
            Error::mapping(
                self.statement,
                property,
                adapter.display_name(),
                e.message(),
            )
        })?;
        Ok(BoundValue::new(encoded, adapter.display_name()))
    }

    /// Bind `value` to `property`
    pub fn bind<T: 'static>(&mut self, property: &str, value: &T) -> Result<&mut Self> {
        let bound = self.encode(property, value)?;
        self.params.named.insert(property.to_string(), bound);
        Ok(self)
    }

    /// Bind an optional value; `None` binds SQL NULL
    pub fn bind_opt<T: 'static>(&mut self, property: &str, value: Option<&T>) -> Result<&mut Self> {
        match value {
            Some(v) => self.bind(property, v),
            None => Ok(self.bind_value(property, Value::Null)),
        }
    }

    /// Bind an already-encoded wire value
    pub fn bind_value(&mut self, property: &str, value: Value) -> &mut Self {
        let type_name = value.sql_type();
        self.params
            .named
            .insert(property.to_string(), BoundValue::new(value, type_name));
        self
    }

    /// Append a positional value
    pub fn push<T: 'static>(&mut self, value: &T) -> Result<&mut Self> {
        let position = self.params.positional.len().to_string();
        let bound = self.encode(&position, value)?;
        self.params.positional.push(bound);
        Ok(self)
    }

    /// Append an already-encoded positional value
    pub fn push_value(&mut self, value: Value) -> &mut Self {
        let type_name = value.sql_type();
        self.params
            .positional
            .push(BoundValue::new(value, type_name));
        self
    }

    /// Finish binding
    pub fn finish(self) -> BoundParameters {
        self.params
    }
}

/// A parameter object that can bind itself
pub trait ToParameters: Send + Sync {
    /// Bind this object's properties
    fn to_parameters(&self, binder: &mut ParameterBinder<'_>) -> Result<()>;
}

impl ToParameters for () {
    fn to_parameters(&self, _binder: &mut ParameterBinder<'_>) -> Result<()> {
        Ok(())
    }
}

impl ToParameters for Vec<Value> {
    fn to_parameters(&self, binder: &mut ParameterBinder<'_>) -> Result<()> {
        for value in self {
            binder.push_value(value.clone());
        }
        Ok(())
    }
}

impl ToParameters for HashMap<String, Value> {
    fn to_parameters(&self, binder: &mut ParameterBinder<'_>) -> Result<()> {
        for (property, value) in self {
            binder.bind_value(property, value.clone());
        }
        Ok(())
    }
}

impl<T: ToParameters + ?Sized> ToParameters for &T {
    fn to_parameters(&self, binder: &mut ParameterBinder<'_>) -> Result<()> {
        (**self).to_parameters(binder)
    }
}

macro_rules! scalar_parameter {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ToParameters for $ty {
                fn to_parameters(&self, binder: &mut ParameterBinder<'_>) -> Result<()> {
                    binder.push(self)?;
                    Ok(())
                }
            }
        )+
    };
}

scalar_parameter!(
    bool,
    i16,
    i32,
    i64,
    f64,
    String,
    rust_decimal::Decimal,
    uuid::Uuid,
    chrono::NaiveDate,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>,
);

/// Encode a parameter object into bound parameters
pub fn bind_parameters<P: ToParameters + ?Sized>(
    statement: &str,
    registry: &TypeAdapterRegistry,
    parameter: &P,
) -> Result<BoundParameters> {
    let mut binder = ParameterBinder::new(statement, registry);
    parameter.to_parameters(&mut binder)?;
    Ok(binder.finish())
}

// ============================================================================
// Rendering
// ============================================================================

/// One entry of the binding plan
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Index of the original `?` marker (0-based)
    pub position: usize,
    /// Marker text rendered for the dialect
    pub placeholder: String,
    /// Bind name for named dialects
    pub name: Option<String>,
    /// Property the value came from
    pub property: Option<String>,
    /// Wire value
    pub value: Value,
    /// Text shown in logs
    pub display: String,
}

/// SQL ready for the driver, with its binding plan
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    /// Rendered SQL text
    pub sql: String,
    /// Bindings in original marker order
    pub bindings: Vec<Binding>,
    /// Columns to return as generated keys, if requested
    pub generated_keys: Option<Vec<String>>,
}

impl BoundStatement {
    /// Bound values in marker order
    pub fn values(&self) -> Vec<Value> {
        self.bindings.iter().map(|b| b.value.clone()).collect()
    }

    /// Diagnostic rendering of the parameters (`1(i64), abc(String)`)
    pub fn parameter_summary(&self) -> String {
        self.bindings
            .iter()
            .map(|b| b.display.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Request generated keys for `columns`
    pub fn with_generated_keys(mut self, columns: Vec<String>) -> Self {
        self.generated_keys = Some(columns);
        self
    }
}

impl fmt::Display for BoundStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Render `template` for `dialect`, binding values from `params`
pub fn render(
    dialect: &Dialect,
    template: &StatementTemplate,
    params: &BoundParameters,
) -> Result<BoundStatement> {
    let markers = template.marker_count();
    if !template.parameters.is_empty() && template.parameters.len() != markers {
        return Err(Error::config(format!(
            "statement has {} bind markers but {} parameter mappings",
            markers,
            template.parameters.len()
        )));
    }

    let mut sql = String::with_capacity(template.sql.len() + markers * 3);
    let mut bindings = Vec::with_capacity(markers);

    for segment in scan(&template.sql) {
        if !segment.code {
            sql.push_str(segment.text);
            continue;
        }
        for ch in segment.text.chars() {
            if ch != '?' {
                sql.push(ch);
                continue;
            }

            let position = bindings.len();
            let property = template
                .parameters
                .get(position)
                .map(|p| p.property.as_str());
            let bound = params.resolve(position, property).ok_or_else(|| {
                Error::config(match property {
                    Some(p) => format!("no value bound for property '{}'", p),
                    None => format!("no value bound for parameter {}", position + 1),
                })
            })?;

            let placeholder = dialect.placeholder(position, property);
            sql.push_str(&placeholder);
            bindings.push(Binding {
                position,
                name: dialect.bind_name(position, property),
                placeholder,
                property: property.map(str::to_string),
                value: bound.value.clone(),
                display: bound.display.clone(),
            });
        }
    }

    Ok(BoundStatement {
        sql,
        bindings,
        generated_keys: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_separates_literals_and_comments() {
        let segments = scan("SELECT '?' , ? -- ?\n/* ? */ \"a?\"");
        let code: Vec<_> = segments.iter().filter(|s| s.code).map(|s| s.text).collect();
        assert_eq!(code, vec!["SELECT ", " , ? ", " "]);
        let joined: String = segments.iter().map(|s| s.text).collect();
        assert_eq!(joined, "SELECT '?' , ? -- ?\n/* ? */ \"a?\"");
    }

    #[test]
    fn test_escaped_quote_stays_in_literal() {
        let template = StatementTemplate::new("SELECT 'it''s ?' WHERE a = ?");
        assert_eq!(template.marker_count(), 1);
    }

    #[test]
    fn test_unterminated_literal_runs_to_end() {
        assert_eq!(count_markers("SELECT 'abc ?"), 0);
    }

    #[test]
    fn test_bound_value_display() {
        assert_eq!(BoundValue::new(Value::Int64(5), "i64").display, "5(i64)");
        assert_eq!(BoundValue::new(Value::Bytes(vec![1]), "BLOB").display, "<BLOB>");
        assert_eq!(BoundValue::new(Value::Null, "i64").display, "null");
    }

    #[test]
    fn test_lone_scalar_satisfies_any_property() {
        let registry = TypeAdapterRegistry::new();
        let params = bind_parameters("s", &registry, &7_i64).unwrap();
        let template = StatementTemplate::new("SELECT * FROM t WHERE id = ?").with_parameter("id");
        let bound = render(&Dialect::postgres(), &template, &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE id = $1");
        assert_eq!(bound.values(), vec![Value::Int64(7)]);
    }
}

//! Type adapters for rivven-mapper
//!
//! A [`TypeAdapter<T>`] bridges a domain type `T` and the wire-level
//! [`Value`]: it encodes parameters before binding and decodes result
//! columns, by name or by index.
//!
//! Adapters live in a [`TypeAdapterRegistry`] keyed by the adapted type.
//! Registering a second adapter for the same type replaces the first, so
//! applications can override the built-ins. A missing adapter is reported
//! when the type is first used, not at registration.
//!
//! Enums are declared explicitly through [`SqlEnum`] and registered with an
//! [`EnumEncoding`]; no runtime reflection is involved.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Row, Value};

/// Failure to convert between a domain value and a wire value.
///
/// The decoder adds statement, column and target type when it turns this
/// into a mapping error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConversionError(String);

impl ConversionError {
    /// Create a conversion error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The wire value has a type the adapter does not accept
    pub fn unexpected(value: &Value, target: &str) -> Self {
        Self(format!("cannot convert {} to {}", value.sql_type(), target))
    }

    /// The message
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Result of a single conversion
pub type ConversionResult<T> = std::result::Result<T, ConversionError>;

/// Encode/decode strategy for one domain type
pub trait TypeAdapter<T>: Send + Sync + 'static {
    /// Encode a parameter value for binding
    fn encode(&self, value: &T) -> ConversionResult<Value>;

    /// Decode a raw column value; `Ok(None)` for SQL NULL
    fn decode(&self, raw: &Value, column: &ColumnMetadata) -> ConversionResult<Option<T>>;

    /// Decode the column labelled `name`
    fn decode_by_name(&self, row: &Row, name: &str) -> ConversionResult<Option<T>> {
        let index = row
            .index_of(name)
            .ok_or_else(|| ConversionError::new(format!("no column named '{}'", name)))?;
        self.decode_by_index(row, index)
    }

    /// Decode the column at `index`
    fn decode_by_index(&self, row: &Row, index: usize) -> ConversionResult<Option<T>> {
        match (row.get(index), row.column(index)) {
            (Some(raw), Some(column)) => self.decode(raw, column),
            _ => Err(ConversionError::new(format!(
                "column index {} out of range ({} columns)",
                index,
                row.len()
            ))),
        }
    }

    /// Name shown in diagnostics in place of non-primitive values
    fn display_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A set of adapters registered together at startup
pub trait AdapterModule {
    /// Register this module's adapters
    fn register(&self, registry: &TypeAdapterRegistry);
}

impl<F> AdapterModule for F
where
    F: Fn(&TypeAdapterRegistry),
{
    fn register(&self, registry: &TypeAdapterRegistry) {
        self(registry)
    }
}

struct Registered {
    type_name: &'static str,
    // always an `Arc<dyn TypeAdapter<T>>` for the keyed `T`
    adapter: Arc<dyn Any + Send + Sync>,
}

/// Registry of type adapters keyed by adapted type
pub struct TypeAdapterRegistry {
    adapters: RwLock<HashMap<TypeId, Registered>>,
}

impl Default for TypeAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeAdapterRegistry {
    /// Registry pre-populated with the built-in adapters
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_module(&builtin_adapters);
        registry
    }

    /// Registry without any adapters
    pub fn empty() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter for `T`, replacing any previous one
    pub fn register<T, A>(&self, adapter: A)
    where
        T: 'static,
        A: TypeAdapter<T>,
    {
        let adapter: Arc<dyn TypeAdapter<T>> = Arc::new(adapter);
        let previous = self.adapters.write().insert(
            TypeId::of::<T>(),
            Registered {
                type_name: std::any::type_name::<T>(),
                adapter: Arc::new(adapter),
            },
        );
        if previous.is_some() {
            tracing::debug!(
                "Replaced type adapter for {}",
                std::any::type_name::<T>()
            );
        }
    }

    /// Register every adapter of a module
    pub fn register_module<M: AdapterModule + ?Sized>(&self, module: &M) {
        module.register(self);
    }

    /// Register an enum with the given wire encoding
    pub fn register_enum<E: SqlEnum>(&self, encoding: EnumEncoding) {
        match encoding {
            EnumEncoding::ByName => self.register::<E, _>(EnumByName::<E>::new()),
            EnumEncoding::ByOrdinal => self.register::<E, _>(EnumByOrdinal::<E>::new()),
        }
    }

    /// Adapter for `T`, if registered
    pub fn get<T: 'static>(&self) -> Option<Arc<dyn TypeAdapter<T>>> {
        self.adapters
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|r| r.adapter.downcast_ref::<Arc<dyn TypeAdapter<T>>>())
            .cloned()
    }

    /// Adapter for `T`, or a configuration error
    pub fn require<T: 'static>(&self) -> Result<Arc<dyn TypeAdapter<T>>> {
        self.get::<T>().ok_or_else(|| {
            Error::config(format!(
                "no type adapter registered for {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Whether an adapter for `T` is registered
    pub fn contains<T: 'static>(&self) -> bool {
        self.adapters.read().contains_key(&TypeId::of::<T>())
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

impl fmt::Debug for TypeAdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.adapters.read().values().map(|r| r.type_name).collect();
        types.sort_unstable();
        f.debug_struct("TypeAdapterRegistry")
            .field("types", &types)
            .finish()
    }
}

// ============================================================================
// Built-in adapters
// ============================================================================

fn narrow<T: TryFrom<i64>>(raw: &Value, target: &str) -> ConversionResult<T> {
    let n = raw
        .as_i64()
        .ok_or_else(|| ConversionError::unexpected(raw, target))?;
    T::try_from(n).map_err(|_| ConversionError::new(format!("{} out of range for {}", n, target)))
}

fn is_integer(raw: &Value) -> bool {
    raw.as_i64().is_some()
}

macro_rules! builtin_adapter {
    (
        $(#[$doc:meta])*
        $adapter:ident, $ty:ty, $display:expr,
        encode = |$v:ident| $encode:expr,
        decode = { $($pat:pat $(if $guard:expr)? => $out:expr),+ $(,)? }
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $adapter;

        impl TypeAdapter<$ty> for $adapter {
            fn encode(&self, $v: &$ty) -> ConversionResult<Value> {
                Ok($encode)
            }

            fn decode(&self, raw: &Value, _column: &ColumnMetadata) -> ConversionResult<Option<$ty>> {
                let decoded: ConversionResult<$ty> = match raw {
                    Value::Null => return Ok(None),
                    $($pat $(if $guard)? => $out,)+
                    other => Err(ConversionError::unexpected(other, $display)),
                };
                decoded.map(Some)
            }

            fn display_name(&self) -> &'static str {
                $display
            }
        }
    };
}

builtin_adapter!(
    /// `bool` ⇄ BOOLEAN (integers decode as `!= 0`)
    BoolAdapter, bool, "bool",
    encode = |v| Value::Bool(*v),
    decode = {
        Value::Bool(b) => Ok(*b),
        v if is_integer(v) => Ok(v.as_i64() != Some(0)),
    }
);

builtin_adapter!(
    /// `i8` ⇄ TINYINT
    I8Adapter, i8, "i8",
    encode = |v| Value::Int8(*v),
    decode = { v if is_integer(v) => narrow(v, "i8") }
);

builtin_adapter!(
    /// `i16` ⇄ SMALLINT
    I16Adapter, i16, "i16",
    encode = |v| Value::Int16(*v),
    decode = { v if is_integer(v) => narrow(v, "i16") }
);

builtin_adapter!(
    /// `i32` ⇄ INTEGER
    I32Adapter, i32, "i32",
    encode = |v| Value::Int32(*v),
    decode = { v if is_integer(v) => narrow(v, "i32") }
);

builtin_adapter!(
    /// `i64` ⇄ BIGINT
    I64Adapter, i64, "i64",
    encode = |v| Value::Int64(*v),
    decode = { v if is_integer(v) => narrow(v, "i64") }
);

builtin_adapter!(
    /// `f32` ⇄ REAL
    F32Adapter, f32, "f32",
    encode = |v| Value::Float32(*v),
    decode = {
        Value::Float32(n) => Ok(*n),
        Value::Int8(n) => Ok(f32::from(*n)),
        Value::Int16(n) => Ok(f32::from(*n)),
    }
);

builtin_adapter!(
    /// `f64` ⇄ DOUBLE PRECISION
    F64Adapter, f64, "f64",
    encode = |v| Value::Float64(*v),
    decode = { v if v.as_f64().is_some() => v.as_f64().ok_or_else(|| ConversionError::unexpected(v, "f64")) }
);

builtin_adapter!(
    /// `Decimal` ⇄ NUMERIC
    DecimalAdapter, Decimal, "Decimal",
    encode = |v| Value::Decimal(*v),
    decode = {
        Value::Decimal(d) => Ok(*d),
        v if is_integer(v) => Ok(Decimal::from(v.as_i64().unwrap_or_default())),
        Value::String(s) => s
            .parse::<Decimal>()
            .map_err(|e| ConversionError::new(format!("invalid decimal '{}': {}", s, e))),
    }
);

builtin_adapter!(
    /// `String` ⇄ VARCHAR/TEXT
    StringAdapter, String, "String",
    encode = |v| Value::String(v.clone()),
    decode = { Value::String(s) => Ok(s.clone()) }
);

builtin_adapter!(
    /// `Vec<u8>` ⇄ BYTEA/VARBINARY
    BytesAdapter, Vec<u8>, "bytes",
    encode = |v| Value::Bytes(v.clone()),
    decode = { Value::Bytes(b) => Ok(b.clone()) }
);

builtin_adapter!(
    /// `Uuid` ⇄ UUID (also accepts text and 16-byte binary)
    UuidAdapter, Uuid, "Uuid",
    encode = |v| Value::Uuid(*v),
    decode = {
        Value::Uuid(u) => Ok(*u),
        Value::String(s) => Uuid::parse_str(s)
            .map_err(|e| ConversionError::new(format!("invalid uuid '{}': {}", s, e))),
        Value::Bytes(b) if b.len() == 16 => Uuid::from_slice(b)
            .map_err(|e| ConversionError::new(e.to_string())),
    }
);

builtin_adapter!(
    /// `serde_json::Value` ⇄ JSON/JSONB (also accepts JSON text)
    JsonAdapter, serde_json::Value, "json",
    encode = |v| Value::Json(v.clone()),
    decode = {
        Value::Json(j) => Ok(j.clone()),
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| ConversionError::new(format!("invalid json: {}", e))),
    }
);

builtin_adapter!(
    /// `NaiveDate` ⇄ DATE
    DateAdapter, NaiveDate, "NaiveDate",
    encode = |v| Value::Date(*v),
    decode = { Value::Date(d) => Ok(*d) }
);

builtin_adapter!(
    /// `NaiveTime` ⇄ TIME
    TimeAdapter, NaiveTime, "NaiveTime",
    encode = |v| Value::Time(*v),
    decode = { Value::Time(t) => Ok(*t) }
);

builtin_adapter!(
    /// `NaiveDateTime` ⇄ TIMESTAMP
    DateTimeAdapter, NaiveDateTime, "NaiveDateTime",
    encode = |v| Value::DateTime(*v),
    decode = { Value::DateTime(dt) => Ok(*dt) }
);

builtin_adapter!(
    /// `DateTime<Utc>` ⇄ TIMESTAMPTZ (plain timestamps are read as UTC)
    DateTimeUtcAdapter, DateTime<Utc>, "DateTime<Utc>",
    encode = |v| Value::DateTimeTz(*v),
    decode = {
        Value::DateTimeTz(dt) => Ok(*dt),
        Value::DateTime(dt) => Ok(dt.and_utc()),
    }
);

/// Binary large object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

/// Character large object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Clob(pub String);

builtin_adapter!(
    /// `Blob` ⇄ BLOB
    BlobAdapter, Blob, "BLOB",
    encode = |v| Value::Bytes(v.0.clone()),
    decode = { Value::Bytes(b) => Ok(Blob(b.clone())) }
);

builtin_adapter!(
    /// `Clob` ⇄ CLOB
    ClobAdapter, Clob, "CLOB",
    encode = |v| Value::String(v.0.clone()),
    decode = { Value::String(s) => Ok(Clob(s.clone())) }
);

/// Module registering the built-in adapters
pub fn builtin_adapters(registry: &TypeAdapterRegistry) {
    registry.register::<bool, _>(BoolAdapter);
    registry.register::<i8, _>(I8Adapter);
    registry.register::<i16, _>(I16Adapter);
    registry.register::<i32, _>(I32Adapter);
    registry.register::<i64, _>(I64Adapter);
    registry.register::<f32, _>(F32Adapter);
    registry.register::<f64, _>(F64Adapter);
    registry.register::<Decimal, _>(DecimalAdapter);
    registry.register::<String, _>(StringAdapter);
    registry.register::<Vec<u8>, _>(BytesAdapter);
    registry.register::<Uuid, _>(UuidAdapter);
    registry.register::<serde_json::Value, _>(JsonAdapter);
    registry.register::<NaiveDate, _>(DateAdapter);
    registry.register::<NaiveTime, _>(TimeAdapter);
    registry.register::<NaiveDateTime, _>(DateTimeAdapter);
    registry.register::<DateTime<Utc>, _>(DateTimeUtcAdapter);
    registry.register::<Blob, _>(BlobAdapter);
    registry.register::<Clob, _>(ClobAdapter);
}

// ============================================================================
// Enums
// ============================================================================

/// An enum mapped to a column, declared explicitly
///
/// ```rust
/// use rivven_mapper::adapter::SqlEnum;
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Status { Active, Retired }
///
/// impl SqlEnum for Status {
///     const VARIANTS: &'static [Self] = &[Status::Active, Status::Retired];
///
///     fn name(&self) -> &'static str {
///         match self {
///             Status::Active => "ACTIVE",
///             Status::Retired => "RETIRED",
///         }
///     }
/// }
///
/// assert_eq!(Status::Retired.ordinal(), 1);
/// ```
pub trait SqlEnum: Sized + Copy + PartialEq + Send + Sync + 'static {
    /// All variants in ordinal order
    const VARIANTS: &'static [Self];

    /// Wire name of this variant
    fn name(&self) -> &'static str;

    /// Position of this variant in [`SqlEnum::VARIANTS`]
    fn ordinal(&self) -> usize {
        Self::VARIANTS
            .iter()
            .position(|v| v == self)
            .unwrap_or_default()
    }
}

/// Wire encoding of an enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumEncoding {
    /// Variant name as text
    #[default]
    ByName,
    /// Variant ordinal as integer
    ByOrdinal,
}

/// Enum encoded as its variant name
pub struct EnumByName<E>(PhantomData<fn() -> E>);

impl<E> EnumByName<E> {
    /// Create the adapter
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for EnumByName<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SqlEnum> TypeAdapter<E> for EnumByName<E> {
    fn encode(&self, value: &E) -> ConversionResult<Value> {
        Ok(Value::String(value.name().to_string()))
    }

    fn decode(&self, raw: &Value, _column: &ColumnMetadata) -> ConversionResult<Option<E>> {
        match raw {
            Value::Null => Ok(None),
            Value::String(s) => E::VARIANTS
                .iter()
                .find(|v| v.name() == s)
                .copied()
                .map(Some)
                .ok_or_else(|| {
                    ConversionError::new(format!(
                        "unknown {} variant '{}'",
                        std::any::type_name::<E>(),
                        s
                    ))
                }),
            other => Err(ConversionError::unexpected(other, std::any::type_name::<E>())),
        }
    }
}

/// Enum encoded as its ordinal
pub struct EnumByOrdinal<E>(PhantomData<fn() -> E>);

impl<E> EnumByOrdinal<E> {
    /// Create the adapter
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for EnumByOrdinal<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SqlEnum> TypeAdapter<E> for EnumByOrdinal<E> {
    fn encode(&self, value: &E) -> ConversionResult<Value> {
        i32::try_from(value.ordinal())
            .map(Value::Int32)
            .map_err(|_| ConversionError::new("enum ordinal out of range"))
    }

    fn decode(&self, raw: &Value, _column: &ColumnMetadata) -> ConversionResult<Option<E>> {
        if raw.is_null() {
            return Ok(None);
        }
        let ordinal: usize = narrow(raw, "enum ordinal")?;
        E::VARIANTS.get(ordinal).copied().map(Some).ok_or_else(|| {
            ConversionError::new(format!(
                "ordinal {} out of range for {}",
                ordinal,
                std::any::type_name::<E>()
            ))
        })
    }
}

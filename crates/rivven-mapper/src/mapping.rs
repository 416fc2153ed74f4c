//! Result mapping descriptors for rivven-mapper
//!
//! A [`ResultMap<T>`] describes how rows become `T`:
//! - a constructor reading the scalar columns of `T` from a [`RowDecoder`]
//! - association slots, each filling one nested object from the same row
//! - collection slots, each gathering children across the rows of a parent
//!
//! Maps without collection slots are flat: one row, one object. Maps with
//! collections are grouped by their key columns, either assuming contiguous
//! parent rows (ordered) or buffering the whole result (unordered).
//!
//! # Example
//!
//! ```rust
//! use rivven_mapper::mapping::ResultMap;
//!
//! #[derive(Debug, Clone)]
//! struct Employee { name: String }
//!
//! #[derive(Debug, Clone)]
//! struct Department { id: i64, employees: Vec<Employee> }
//!
//! let employee = ResultMap::builder("employee", |row| {
//!     Ok(Employee { name: row.get_required("emp_name")? })
//! })
//! .key("emp_id")
//! .build()
//! .unwrap();
//!
//! let department = ResultMap::builder("department", |row| {
//!     Ok(Department { id: row.get_required("dept_id")?, employees: Vec::new() })
//! })
//! .key("dept_id")
//! .ordered(true)
//! .collection("employees", employee, |d: &mut Department, e: Vec<Employee>| d.employees = e)
//! .build()
//! .unwrap();
//!
//! assert!(!department.is_flat());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::decoder::{ColumnRef, RowDecoder};
use crate::error::{Error, Result};
use crate::types::ParentKey;

/// Builds the scalar part of a mapped object from one row
pub type Constructor<T> = Arc<dyn Fn(&mut RowDecoder) -> Result<T> + Send + Sync>;

/// How rows of a map with collections are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    /// No collections: each row is one object
    Flat,
    /// Rows of one parent are contiguous
    Ordered,
    /// Rows of one parent may be interleaved with others
    Unordered,
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Ordered => write!(f, "ordered"),
            Self::Unordered => write!(f, "unordered"),
        }
    }
}

/// Row-to-object mapping for `T`
pub struct ResultMap<T> {
    id: String,
    key_columns: Vec<ColumnRef>,
    ordered: bool,
    constructor: Constructor<T>,
    associations: Vec<Arc<dyn AssociationSlot<T>>>,
    collections: Vec<Arc<dyn CollectionSlot<T>>>,
}

impl<T: Send + 'static> ResultMap<T> {
    /// Start building a map whose objects are created by `constructor`
    pub fn builder<F>(id: impl Into<String>, constructor: F) -> ResultMapBuilder<T>
    where
        F: Fn(&mut RowDecoder) -> Result<T> + Send + Sync + 'static,
    {
        ResultMapBuilder {
            map: ResultMap {
                id: id.into(),
                key_columns: Vec::new(),
                ordered: false,
                constructor: Arc::new(constructor),
                associations: Vec::new(),
                collections: Vec::new(),
            },
        }
    }

    /// Flat map from a constructor alone
    pub fn from_fn<F>(id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&mut RowDecoder) -> Result<T> + Send + Sync + 'static,
    {
        Self::builder(id, constructor).map
    }

    /// Map id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Columns identifying one object of this map
    pub fn key_columns(&self) -> &[ColumnRef] {
        &self.key_columns
    }

    /// Whether rows of one parent are declared contiguous
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Whether the map has no collection slots
    pub fn is_flat(&self) -> bool {
        self.collections.is_empty()
    }

    /// Grouping strategy for this map
    pub fn mode(&self) -> AggregationMode {
        match (self.is_flat(), self.ordered) {
            (true, _) => AggregationMode::Flat,
            (false, true) => AggregationMode::Ordered,
            (false, false) => AggregationMode::Unordered,
        }
    }

    /// Build one object from one row, with its associations but no collections
    pub fn map_row(&self, row: &mut RowDecoder) -> Result<T> {
        let mut object = (self.constructor)(row)?;
        for association in &self.associations {
            association.apply(&mut object, row)?;
        }
        Ok(object)
    }

    /// Open a group for a new object; collections are fed by [`Group::accept`]
    pub(crate) fn open(&self, key: Option<ParentKey>, row: &mut RowDecoder) -> Result<Group<T>> {
        let object = self.map_row(row)?;
        let collections = self.collections.iter().map(|c| c.start()).collect();
        let mut group = Group {
            key,
            object,
            collections,
        };
        group.accept(row)?;
        Ok(group)
    }
}

impl<T> fmt::Debug for ResultMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultMap")
            .field("id", &self.id)
            .field("key_columns", &self.key_columns)
            .field("ordered", &self.ordered)
            .field(
                "associations",
                &self.associations.iter().map(|a| a.property()).collect::<Vec<_>>(),
            )
            .field(
                "collections",
                &self.collections.iter().map(|c| c.property()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`ResultMap`]
pub struct ResultMapBuilder<T> {
    map: ResultMap<T>,
}

impl<T: Send + 'static> ResultMapBuilder<T> {
    /// Add a key column
    pub fn key(mut self, column: impl Into<ColumnRef>) -> Self {
        self.map.key_columns.push(column.into());
        self
    }

    /// Add several key columns
    pub fn keys<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ColumnRef>,
    {
        self.map.key_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Declare parent rows contiguous (sorted by key)
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.map.ordered = ordered;
        self
    }

    /// Fill a single nested object from the same row.
    ///
    /// When the child map has key columns and any of them is NULL, the
    /// setter receives `None`.
    pub fn association<A, M, S>(mut self, property: impl Into<String>, map: M, setter: S) -> Self
    where
        A: Send + 'static,
        M: Into<Arc<ResultMap<A>>>,
        S: Fn(&mut T, Option<A>) + Send + Sync + 'static,
    {
        self.map.associations.push(Arc::new(Association {
            property: property.into(),
            map: map.into(),
            setter: Box::new(setter),
        }));
        self
    }

    /// Gather children across the rows of one object
    pub fn collection<C, M, S>(mut self, property: impl Into<String>, map: M, setter: S) -> Self
    where
        C: Send + 'static,
        M: Into<Arc<ResultMap<C>>>,
        S: Fn(&mut T, Vec<C>) + Send + Sync + 'static,
    {
        self.map.collections.push(Arc::new(Collection {
            property: property.into(),
            map: map.into(),
            setter: Arc::new(setter),
        }));
        self
    }

    /// Validate and finish the map
    pub fn build(self) -> Result<ResultMap<T>> {
        let map = self.map;
        if map.id.trim().is_empty() {
            return Err(Error::config("result map id must not be empty"));
        }
        if !map.is_flat() && map.key_columns.is_empty() {
            return Err(Error::config(format!(
                "result map '{}' has collections but no key columns",
                map.id
            )));
        }
        if let Some(a) = map.associations.iter().find(|a| !a.is_flat()) {
            return Err(Error::config(format!(
                "association '{}' of result map '{}' must not contain collections",
                a.property(),
                map.id
            )));
        }
        Ok(map)
    }
}

// ============================================================================
// Slots
// ============================================================================

trait AssociationSlot<T>: Send + Sync {
    fn property(&self) -> &str;
    fn is_flat(&self) -> bool;
    fn apply(&self, target: &mut T, row: &mut RowDecoder) -> Result<()>;
}

type AssociationSetter<T, A> = Box<dyn Fn(&mut T, Option<A>) + Send + Sync>;

struct Association<T, A> {
    property: String,
    map: Arc<ResultMap<A>>,
    setter: AssociationSetter<T, A>,
}

impl<T, A: Send + 'static> AssociationSlot<T> for Association<T, A> {
    fn property(&self) -> &str {
        &self.property
    }

    fn is_flat(&self) -> bool {
        self.map.is_flat()
    }

    fn apply(&self, target: &mut T, row: &mut RowDecoder) -> Result<()> {
        let keys = self.map.key_columns();
        if !keys.is_empty() && row.key(keys)?.has_null() {
            (self.setter)(target, None);
            return Ok(());
        }
        let value = self.map.map_row(row)?;
        (self.setter)(target, Some(value));
        Ok(())
    }
}

trait CollectionSlot<T>: Send + Sync {
    fn property(&self) -> &str;
    fn start(&self) -> Box<dyn CollectionState<T>>;
}

/// Per-group accumulator of one collection
pub(crate) trait CollectionState<T>: Send {
    fn accept(&mut self, row: &mut RowDecoder) -> Result<()>;
    fn finish(self: Box<Self>, target: &mut T);
}

type CollectionSetter<T, C> = Arc<dyn Fn(&mut T, Vec<C>) + Send + Sync>;

struct Collection<T, C> {
    property: String,
    map: Arc<ResultMap<C>>,
    setter: CollectionSetter<T, C>,
}

impl<T: 'static, C: Send + 'static> CollectionSlot<T> for Collection<T, C> {
    fn property(&self) -> &str {
        &self.property
    }

    fn start(&self) -> Box<dyn CollectionState<T>> {
        Box::new(Children {
            map: self.map.clone(),
            setter: self.setter.clone(),
            seen: HashMap::new(),
            groups: Vec::new(),
        })
    }
}

/// Children of one parent, de-duplicated by key in first-seen order
struct Children<T, C> {
    map: Arc<ResultMap<C>>,
    setter: CollectionSetter<T, C>,
    seen: HashMap<ParentKey, usize>,
    groups: Vec<Group<C>>,
}

impl<T: 'static, C: Send + 'static> CollectionState<T> for Children<T, C> {
    fn accept(&mut self, row: &mut RowDecoder) -> Result<()> {
        let keys = self.map.key_columns();
        if keys.is_empty() {
            let group = self.map.open(None, row)?;
            self.groups.push(group);
            return Ok(());
        }

        let key = row.key(keys)?;
        if key.has_null() {
            return Ok(());
        }
        match self.seen.get(&key) {
            Some(&index) => self.groups[index].accept(row),
            None => {
                let group = self.map.open(Some(key.clone()), row)?;
                self.seen.insert(key, self.groups.len());
                self.groups.push(group);
                Ok(())
            }
        }
    }

    fn finish(self: Box<Self>, target: &mut T) {
        let children = self.groups.into_iter().map(Group::finish).collect();
        (self.setter)(target, children);
    }
}

/// One object under construction together with its open collections
pub(crate) struct Group<T> {
    key: Option<ParentKey>,
    object: T,
    collections: Vec<Box<dyn CollectionState<T>>>,
}

impl<T> Group<T> {
    /// Key of the object, `None` for keyless children
    pub(crate) fn key(&self) -> Option<&ParentKey> {
        self.key.as_ref()
    }

    /// Feed one more row of this object to its collections
    pub(crate) fn accept(&mut self, row: &mut RowDecoder) -> Result<()> {
        for collection in &mut self.collections {
            collection.accept(row)?;
        }
        Ok(())
    }

    /// Close every collection and hand out the finished object
    pub(crate) fn finish(self) -> T {
        let mut object = self.object;
        for collection in self.collections {
            collection.finish(&mut object);
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TypeAdapterRegistry;
    use crate::types::{ColumnMetadata, Row, Value};

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(String);

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        id: i64,
        tags: Vec<Tag>,
    }

    fn decoder(values: Vec<Value>) -> RowDecoder {
        let columns = ColumnMetadata::list([("post_id", "BIGINT"), ("tag", "TEXT")]);
        RowDecoder::new(
            Row::new(columns, values),
            Arc::from("posts"),
            Arc::new(TypeAdapterRegistry::new()),
        )
    }

    fn tag_map() -> ResultMap<Tag> {
        ResultMap::builder("tag", |row| Ok(Tag(row.get_required("tag")?)))
            .key("tag")
            .build()
            .unwrap()
    }

    fn post_map() -> ResultMap<Post> {
        ResultMap::builder("post", |row| {
            Ok(Post {
                id: row.get_required("post_id")?,
                tags: Vec::new(),
            })
        })
        .key("post_id")
        .collection("tags", tag_map(), |p: &mut Post, tags: Vec<Tag>| p.tags = tags)
        .build()
        .unwrap()
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(tag_map().mode(), AggregationMode::Flat);
        assert_eq!(post_map().mode(), AggregationMode::Unordered);
    }

    #[test]
    fn test_collections_require_keys() {
        let err = ResultMap::builder("post", |_| Ok(Post { id: 0, tags: vec![] }))
            .collection("tags", tag_map(), |p: &mut Post, tags: Vec<Tag>| p.tags = tags)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no key columns"));
    }

    #[test]
    fn test_group_dedupes_children() {
        let map = post_map();
        let mut first = decoder(vec![Value::Int64(1), Value::String("rust".into())]);
        let mut group = map.open(Some(first.key(map.key_columns()).unwrap()), &mut first).unwrap();
        for tag in [Some("sql"), Some("rust"), None] {
            let value = tag.map(|t| Value::String(t.into())).unwrap_or(Value::Null);
            group.accept(&mut decoder(vec![Value::Int64(1), value])).unwrap();
        }
        let post = group.finish();
        assert_eq!(post.id, 1);
        assert_eq!(post.tags, vec![Tag("rust".into()), Tag("sql".into())]);
    }
}

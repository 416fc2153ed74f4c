//! Row-to-object aggregation engine
//!
//! Turns a single-pass [`RowStream`] into a lazy stream of mapped objects
//! according to the map's [`AggregationMode`]:
//!
//! | Mode      | Buffering                    | Emission                        |
//! |-----------|------------------------------|---------------------------------|
//! | Flat      | none                         | one object per row              |
//! | Ordered   | one open group + one row     | when the next key differs / EOF |
//! | Unordered | every group                  | after EOF, in first-seen order  |
//!
//! Rows whose key contains a NULL belong to no parent and are skipped.
//! Dropping the returned stream drops the row stream, which cancels the
//! driver cursor.

use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::adapter::TypeAdapterRegistry;
use crate::connection::RowStream;
use crate::decoder::RowDecoder;
use crate::error::Result;
use crate::mapping::{AggregationMode, Group, ResultMap};
use crate::types::{ParentKey, Row};

/// Per-statement settings shared by every row of one aggregation
#[derive(Debug, Clone)]
pub struct AggregationContext {
    /// Id of the statement producing the rows
    pub statement: Arc<str>,
    /// Adapters used to decode columns
    pub registry: Arc<TypeAdapterRegistry>,
    /// Warn once when an unordered aggregation has buffered this many rows
    pub unordered_warn_rows: Option<usize>,
}

impl AggregationContext {
    /// Create a context
    pub fn new(statement: impl Into<Arc<str>>, registry: Arc<TypeAdapterRegistry>) -> Self {
        Self {
            statement: statement.into(),
            registry,
            unordered_warn_rows: None,
        }
    }

    /// Set the unordered buffering warning threshold
    pub fn with_unordered_warn_rows(mut self, rows: Option<usize>) -> Self {
        self.unordered_warn_rows = rows;
        self
    }

    fn decoder(&self, row: Row) -> RowDecoder {
        RowDecoder::new(row, self.statement.clone(), self.registry.clone())
    }
}

/// Synchronous aggregation state machine.
///
/// Feed rows with [`Aggregator::push`], then drain with
/// [`Aggregator::finish`]. `push` emits at most one object per row.
pub struct Aggregator<T> {
    map: Arc<ResultMap<T>>,
    context: AggregationContext,
    mode: AggregationMode,
    // ordered
    open: Option<Group<T>>,
    lookahead: Option<(ParentKey, RowDecoder)>,
    // unordered
    positions: HashMap<ParentKey, usize>,
    groups: Vec<Group<T>>,
    rows: u64,
    skipped: u64,
    emitted: u64,
    warned: bool,
}

impl<T: Send + 'static> Aggregator<T> {
    /// Create an aggregator for `map`
    pub fn new(map: Arc<ResultMap<T>>, context: AggregationContext) -> Self {
        let mode = map.mode();
        Self {
            map,
            context,
            mode,
            open: None,
            lookahead: None,
            positions: HashMap::new(),
            groups: Vec::new(),
            rows: 0,
            skipped: 0,
            emitted: 0,
            warned: false,
        }
    }

    /// Grouping strategy in use
    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Rows pushed so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Rows skipped for a NULL key component
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Feed the next row; returns an object when one is complete
    pub fn push(&mut self, row: Row) -> Result<Option<T>> {
        self.rows += 1;
        let mut decoder = self.context.decoder(row);

        let emitted = match self.mode {
            AggregationMode::Flat => Some(self.map.map_row(&mut decoder)?),
            AggregationMode::Ordered => self.push_ordered(decoder)?,
            AggregationMode::Unordered => {
                self.push_unordered(decoder)?;
                None
            }
        };
        if emitted.is_some() {
            self.emitted += 1;
        }
        Ok(emitted)
    }

    /// Drain everything still held once the rows are exhausted
    pub fn finish(mut self) -> Result<Vec<T>> {
        let remaining: Vec<T> = match self.mode {
            AggregationMode::Flat => Vec::new(),
            AggregationMode::Ordered => {
                self.open_lookahead()?;
                self.open.take().map(Group::finish).into_iter().collect()
            }
            AggregationMode::Unordered => std::mem::take(&mut self.groups)
                .into_iter()
                .map(Group::finish)
                .collect(),
        };

        debug!(
            statement = %self.context.statement,
            mode = %self.mode,
            rows = self.rows,
            skipped = self.skipped,
            objects = self.emitted + remaining.len() as u64,
            "Aggregation complete"
        );
        Ok(remaining)
    }

    fn key_of(&mut self, decoder: &RowDecoder) -> Result<Option<ParentKey>> {
        let key = decoder.key(self.map.key_columns())?;
        if key.has_null() {
            self.skipped += 1;
            trace!(statement = %self.context.statement, "Skipping row with NULL key");
            return Ok(None);
        }
        Ok(Some(key))
    }

    fn open_lookahead(&mut self) -> Result<()> {
        if let Some((key, mut decoder)) = self.lookahead.take() {
            self.open = Some(self.map.open(Some(key), &mut decoder)?);
        }
        Ok(())
    }

    fn push_ordered(&mut self, mut decoder: RowDecoder) -> Result<Option<T>> {
        // a row parked on the previous push starts the next group
        self.open_lookahead()?;

        let Some(key) = self.key_of(&decoder)? else {
            return Ok(None);
        };

        if let Some(group) = self.open.as_mut() {
            if group.key() == Some(&key) {
                group.accept(&mut decoder)?;
                return Ok(None);
            }
        }

        match self.open.take() {
            Some(closed) => {
                self.lookahead = Some((key, decoder));
                Ok(Some(closed.finish()))
            }
            None => {
                self.open = Some(self.map.open(Some(key), &mut decoder)?);
                Ok(None)
            }
        }
    }

    fn push_unordered(&mut self, mut decoder: RowDecoder) -> Result<()> {
        let Some(key) = self.key_of(&decoder)? else {
            return Ok(());
        };

        match self.positions.get(&key) {
            Some(&index) => self.groups[index].accept(&mut decoder)?,
            None => {
                let group = self.map.open(Some(key.clone()), &mut decoder)?;
                self.positions.insert(key, self.groups.len());
                self.groups.push(group);
            }
        }

        if let Some(limit) = self.context.unordered_warn_rows {
            if !self.warned && self.rows >= limit as u64 {
                self.warned = true;
                warn!(
                    statement = %self.context.statement,
                    rows = self.rows,
                    groups = self.groups.len(),
                    "Unordered aggregation is buffering a large result; consider an ordered result map"
                );
            }
        }
        Ok(())
    }
}

/// Aggregate `rows` into a lazy stream of objects mapped by `map`.
///
/// The first error ends the stream; objects already yielded stay valid.
pub fn aggregate<T>(
    rows: RowStream,
    map: Arc<ResultMap<T>>,
    context: AggregationContext,
) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
{
    let stream = async_stream::stream! {
        let mut rows = rows;
        let mut aggregator = Aggregator::new(map, context);

        while let Some(row) = rows.next().await {
            match row.and_then(|row| aggregator.push(row)) {
                Ok(Some(object)) => yield Ok(object),
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        drop(rows);

        match aggregator.finish() {
            Ok(objects) => {
                for object in objects {
                    yield Ok(object);
                }
            }
            Err(e) => yield Err(e),
        }
    };
    Box::pin(stream)
}

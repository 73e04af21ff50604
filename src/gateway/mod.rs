//! The narrow interface through which the workload talks to a wide-column store.
//!
//! A store holds tables; a table holds rows identified by a string key and
//! sorted by it; a row holds cells grouped in column families. Every cell
//! is versioned by its write timestamp.

pub mod cql;
pub mod memory;

use anyhow::Result;
use futures::stream::{self, BoxStream, Stream, StreamExt};

/// A single versioned value of a column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub family: String,
    pub qualifier: String,
    /// Microseconds since the Unix epoch.
    pub timestamp_micros: i64,
    pub value: Vec<u8>,
}

/// A set of cell writes applied together to one row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutation {
    cells: Vec<Cell>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a write of `value` to `family:qualifier` at `timestamp_micros`.
    pub fn set(
        &mut self,
        family: impl Into<String>,
        qualifier: impl Into<String>,
        timestamp_micros: i64,
        value: Vec<u8>,
    ) {
        self.cells.push(Cell {
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp_micros,
            value,
        });
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// A row returned by a scan, with its cells in (family, qualifier,
/// newest timestamp first) order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowView {
    pub key: String,
    pub cells: Vec<Cell>,
}

impl RowView {
    /// Iterates over the cells belonging to `family`.
    pub fn family_cells<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |cell| cell.family == family)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub families: Vec<String>,
}

/// Rows produced by a prefix scan, in key order. The stream is finite
/// and cannot be restarted.
pub type RowStream = BoxStream<'static, Result<RowView>>;

/// Administrative and data operations of a wide-column store.
///
/// Implementations must be safe to share between concurrently running
/// write tasks.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Lists the names of all tables.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Creates an empty table with no column families.
    /// Fails if the table already exists.
    async fn create_table(&self, table: &str) -> Result<()>;

    /// Describes an existing table.
    async fn table_info(&self, table: &str) -> Result<TableInfo>;

    /// Adds a column family to an existing table.
    /// Fails if the family already exists.
    async fn create_column_family(&self, table: &str, family: &str) -> Result<()>;

    /// Writes all cells of the mutation to the row `row_key`.
    /// Every family referenced by the mutation must exist.
    async fn apply_mutation(&self, table: &str, row_key: &str, mutation: Mutation) -> Result<()>;

    /// Reads at most `limit` rows whose keys start with `prefix`.
    async fn scan_prefix(&self, table: &str, prefix: &str, limit: usize) -> Result<RowStream>;
}

/// Returns the smallest string which is greater than every string
/// starting with `prefix`, or `None` if there is no such string
/// (the prefix is empty or made of `char::MAX` only).
pub fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            // Skip over the surrogate range, which is not valid in strings
            '\u{D7FF}' => Some('\u{E000}'),
            c => char::from_u32(c as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Returns the entity class of a row key, i.e. the part before the first `/`.
/// Rows of one entity class are stored next to each other.
pub fn entity_class(row_key: &str) -> &str {
    match row_key.split_once('/') {
        Some((class, _)) => class,
        None => row_key,
    }
}

// Folds a key-ordered stream of cells into rows, stopping after `limit` rows.
// Cells of one row must be adjacent in the input.
pub(crate) fn group_cells_into_rows<S>(cells: S, limit: usize) -> RowStream
where
    S: Stream<Item = Result<(String, Cell)>> + Send + 'static,
{
    struct State<S> {
        cells: S,
        pending: Option<RowView>,
        remaining: usize,
        done: bool,
    }

    let state = State {
        cells: Box::pin(cells),
        pending: None,
        remaining: limit,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done || state.remaining == 0 {
            return None;
        }

        loop {
            match state.cells.next().await {
                Some(Ok((key, cell))) => match &mut state.pending {
                    Some(row) if row.key == key => row.cells.push(cell),
                    _ => {
                        let next = RowView {
                            key,
                            cells: vec![cell],
                        };
                        if let Some(finished) = state.pending.replace(next) {
                            state.remaining -= 1;
                            return Some((Ok(finished), state));
                        }
                    }
                },
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.done = true;
                    let last = state.pending.take()?;
                    return Some((Ok(last), state));
                }
            }
        }
    })
    .boxed()
}

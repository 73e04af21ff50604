use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;

use super::{prefix_successor, Cell, Mutation, RowStream, RowView, StorageGateway, TableInfo};

// Cells of a row, ordered by family, qualifier and then newest version first.
type CellKey = (String, String, Reverse<i64>);
type Row = BTreeMap<CellKey, Vec<u8>>;

#[derive(Default)]
struct MemTable {
    families: BTreeSet<String>,
    rows: BTreeMap<String, Row>,
}

/// A wide-column store kept in process memory.
///
/// Behaves like a remote store as far as the gateway contract goes: creating
/// an existing table or family fails and so does writing to an unknown family.
/// Writing the same cell at the same timestamp twice keeps the last value.
#[derive(Default)]
pub struct InMemoryGateway {
    tables: RwLock<BTreeMap<String, MemTable>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows stored in `table`, or zero if it does not exist.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map_or(0, |table| table.rows.len())
    }

    fn read_rows(&self, table: &str, prefix: &str, limit: usize) -> Result<Vec<RowView>> {
        let tables = self.tables.read();
        let mtable = tables
            .get(table)
            .ok_or_else(|| anyhow::anyhow!("Table {} does not exist", table))?;

        let upper = match prefix_successor(prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        let range = mtable
            .rows
            .range::<String, _>((Bound::Included(prefix.to_string()), upper));

        let rows = range
            .take(limit)
            .map(|(key, row)| RowView {
                key: key.clone(),
                cells: row
                    .iter()
                    .map(|((family, qualifier, Reverse(ts)), value)| Cell {
                        family: family.clone(),
                        qualifier: qualifier.clone(),
                        timestamp_micros: *ts,
                        value: value.clone(),
                    })
                    .collect(),
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl StorageGateway for InMemoryGateway {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.read().keys().cloned().collect())
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        let mut tables = self.tables.write();
        anyhow::ensure!(
            !tables.contains_key(table),
            "Table {} already exists",
            table
        );
        tables.insert(table.to_string(), MemTable::default());
        Ok(())
    }

    async fn table_info(&self, table: &str) -> Result<TableInfo> {
        let tables = self.tables.read();
        let mtable = tables
            .get(table)
            .ok_or_else(|| anyhow::anyhow!("Table {} does not exist", table))?;
        Ok(TableInfo {
            families: mtable.families.iter().cloned().collect(),
        })
    }

    async fn create_column_family(&self, table: &str, family: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let mtable = tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("Table {} does not exist", table))?;
        anyhow::ensure!(
            mtable.families.insert(family.to_string()),
            "Column family {} already exists in table {}",
            family,
            table,
        );
        Ok(())
    }

    async fn apply_mutation(&self, table: &str, row_key: &str, mutation: Mutation) -> Result<()> {
        let mut tables = self.tables.write();
        let mtable = tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("Table {} does not exist", table))?;

        // Validate everything first, the mutation is applied as a whole or not at all
        for cell in mutation.cells() {
            anyhow::ensure!(
                mtable.families.contains(&cell.family),
                "Column family {} does not exist in table {}",
                cell.family,
                table,
            );
        }
        if mutation.is_empty() {
            return Ok(());
        }

        let row = mtable.rows.entry(row_key.to_string()).or_default();
        for cell in mutation.into_cells() {
            row.insert(
                (cell.family, cell.qualifier, Reverse(cell.timestamp_micros)),
                cell.value,
            );
        }
        Ok(())
    }

    async fn scan_prefix(&self, table: &str, prefix: &str, limit: usize) -> Result<RowStream> {
        // The scan works on a snapshot, later writes are not visible to it
        let rows = self.read_rows(table, prefix, limit)?;
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}

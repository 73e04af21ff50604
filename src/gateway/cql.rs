//! Wide-column tables laid out on top of a Scylla/Cassandra cluster.
//!
//! Each table is a CQL table with one CQL row per cell:
//!
//!   bucket text, row_key text, family text, qualifier text, ts bigint, value blob
//!   PRIMARY KEY ((bucket), row_key, family, qualifier, ts)
//!
//! The partition key `bucket` is the entity class of the row key, so all rows
//! of one entity class live in one partition sorted by key, which is what
//! makes prefix scans cheap. Column families are recorded in a registry table
//! in the same keyspace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::batch::{Batch, BatchStatement, BatchType};
use scylla::statement::prepared::PreparedStatement;
use scylla::statement::Consistency;

use super::{
    entity_class, group_cells_into_rows, prefix_successor, Cell, Mutation, RowStream,
    StorageGateway, TableInfo,
};
use crate::configuration::RESERVED_TABLE_NAME;

/// Connection settings of the CQL backend.
#[derive(Clone, Debug)]
pub struct CqlOptions {
    pub nodes: Vec<String>,
    pub replication_factor: i64,
    pub consistency: Consistency,
    pub timeout: Duration,
}

// row_key, family, qualifier, ts, value
type CellRow = (String, String, String, i64, Vec<u8>);

#[derive(Clone)]
struct TableStatements {
    insert: PreparedStatement,
    scan_bounded: PreparedStatement,
    scan_unbounded: PreparedStatement,
}

pub struct CqlGateway {
    session: Arc<Session>,
    keyspace: String,
    consistency: Consistency,
    timeout: Duration,

    statements: Mutex<HashMap<String, TableStatements>>,
    known_families: Mutex<HashMap<String, HashSet<String>>>,
}

/// Derives the keyspace holding the tables of an instance.
pub fn keyspace_name(project: &str, instance: &str) -> String {
    format!("{project}_{instance}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_identifier(kind: &str, name: &str) -> Result<()> {
    let valid = name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    anyhow::ensure!(valid, "Invalid {} name for a CQL store: {:?}", kind, name);
    Ok(())
}

impl CqlGateway {
    /// Connects to the cluster and makes sure the keyspace of the instance
    /// and the column family registry exist.
    pub async fn connect(project: &str, instance: &str, options: &CqlOptions) -> Result<Self> {
        let session = SessionBuilder::new()
            .known_nodes(&options.nodes)
            .build()
            .await
            .with_context(|| format!("Failed to connect to {}", options.nodes.join(",")))?;
        let session = Arc::new(session);

        let keyspace = keyspace_name(project, instance);
        ensure_identifier("keyspace", &keyspace)?;

        let create_keyspace_query_str = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
            {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            keyspace, options.replication_factor,
        );
        session.query_unpaged(create_keyspace_query_str, ()).await?;

        let create_registry_query_str = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} \
            (table_name text, family text, PRIMARY KEY (table_name, family))",
            keyspace, RESERVED_TABLE_NAME,
        );
        session.query_unpaged(create_registry_query_str, ()).await?;
        session.await_schema_agreement().await?;

        tracing::debug!(keyspace = %keyspace, "connected to the cluster");

        Ok(Self {
            session,
            keyspace,
            consistency: options.consistency,
            timeout: options.timeout,
            statements: Mutex::new(HashMap::new()),
            known_families: Mutex::new(HashMap::new()),
        })
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.list_tables().await?.iter().any(|t| t == table))
    }

    async fn ensure_table_exists(&self, table: &str) -> Result<()> {
        ensure_identifier("table", table)?;
        anyhow::ensure!(
            self.table_exists(table).await?,
            "Table {} does not exist in keyspace {}",
            table,
            self.keyspace,
        );
        Ok(())
    }

    async fn registered_families(&self, table: &str) -> Result<Vec<String>> {
        let query_str = format!(
            "SELECT family FROM {}.{} WHERE table_name = ?",
            self.keyspace, RESERVED_TABLE_NAME,
        );
        let result = self
            .session
            .query_unpaged(query_str, (table,))
            .await?
            .into_rows_result()?;
        let families = result
            .rows::<(String,)>()?
            .map(|row| row.map(|(family,)| family))
            .collect::<Result<Vec<_>, _>>()?;

        self.known_families
            .lock()
            .insert(table.to_string(), families.iter().cloned().collect());
        Ok(families)
    }

    // Checks that every family used by the mutation is registered,
    // consulting the registry only when the cache does not know a family.
    async fn check_families(&self, table: &str, mutation: &Mutation) -> Result<()> {
        let is_known = |families: &HashMap<String, HashSet<String>>, family: &str| {
            families
                .get(table)
                .is_some_and(|known| known.contains(family))
        };

        let all_known = {
            let families = self.known_families.lock();
            mutation
                .cells()
                .iter()
                .all(|cell| is_known(&families, &cell.family))
        };
        if all_known {
            return Ok(());
        }

        self.ensure_table_exists(table).await?;
        self.registered_families(table).await?;

        let families = self.known_families.lock();
        for cell in mutation.cells() {
            anyhow::ensure!(
                is_known(&families, &cell.family),
                "Column family {} does not exist in table {}",
                cell.family,
                table,
            );
        }
        Ok(())
    }

    async fn statements_for(&self, table: &str) -> Result<TableStatements> {
        let cached = self.statements.lock().get(table).cloned();
        if let Some(statements) = cached {
            return Ok(statements);
        }

        let columns = "row_key, family, qualifier, ts, value";
        let insert_str = format!(
            "INSERT INTO {}.{} (bucket, {}) VALUES (?, ?, ?, ?, ?, ?) USING TIMESTAMP ?",
            self.keyspace, table, columns,
        );
        let scan_bounded_str = format!(
            "SELECT {} FROM {}.{} WHERE bucket = ? AND row_key >= ? AND row_key < ?",
            columns, self.keyspace, table,
        );
        let scan_unbounded_str = format!(
            "SELECT {} FROM {}.{} WHERE bucket = ? AND row_key >= ?",
            columns, self.keyspace, table,
        );

        let (mut insert, mut scan_bounded, mut scan_unbounded) = futures::try_join!(
            self.session.prepare(insert_str),
            self.session.prepare(scan_bounded_str),
            self.session.prepare(scan_unbounded_str),
        )?;

        insert.set_is_idempotent(true);
        for statement in [&mut insert, &mut scan_bounded, &mut scan_unbounded] {
            statement.set_consistency(self.consistency);
            statement.set_request_timeout(Some(self.timeout));
        }

        let statements = TableStatements {
            insert,
            scan_bounded,
            scan_unbounded,
        };
        self.statements
            .lock()
            .insert(table.to_string(), statements.clone());
        Ok(statements)
    }

    // Lists the partitions which may contain keys starting with `prefix`,
    // in the order in which they should be scanned.
    async fn buckets_for_prefix(&self, table: &str, prefix: &str) -> Result<Vec<String>> {
        if prefix.contains('/') {
            return Ok(vec![entity_class(prefix).to_string()]);
        }

        let query_str = format!("SELECT DISTINCT bucket FROM {}.{}", self.keyspace, table);
        let pager = self.session.query_iter(query_str, ()).await?;
        let buckets: Vec<String> = pager
            .rows_stream::<(String,)>()?
            .map_ok(|(bucket,)| bucket)
            .try_filter(|bucket| futures::future::ready(bucket.starts_with(prefix)))
            .try_collect()
            .await?;
        Ok(scan_order(buckets))
    }
}

// Orders buckets the way their `class/...` keys sort: `device-x/1` comes
// before `device/1`, although `device` comes before `device-x`.
fn scan_order(mut buckets: Vec<String>) -> Vec<String> {
    buckets.sort_by_cached_key(|bucket| format!("{bucket}/"));
    buckets
}

// One unlogged batch writing `count` cells of a row with `insert`.
fn write_batch(
    insert: impl Into<BatchStatement> + Clone,
    count: usize,
    consistency: Consistency,
    timeout: Duration,
) -> Batch {
    let mut batch = Batch::new(BatchType::Unlogged);
    batch.set_is_idempotent(true);
    batch.set_consistency(consistency);
    batch.set_request_timeout(Some(timeout));
    for _ in 0..count {
        batch.append_statement(insert.clone());
    }
    batch
}

#[async_trait]
impl StorageGateway for CqlGateway {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?",
                (&self.keyspace,),
            )
            .await?
            .into_rows_result()?;

        let mut tables = Vec::new();
        for row in result.rows::<(String,)>()? {
            let (table,) = row?;
            if table != RESERVED_TABLE_NAME {
                tables.push(table);
            }
        }
        tables.sort_unstable();
        Ok(tables)
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        ensure_identifier("table", table)?;
        anyhow::ensure!(
            table != RESERVED_TABLE_NAME,
            "Table name {} is reserved",
            table
        );

        let create_table_query_str = format!(
            "CREATE TABLE {}.{} \
            (bucket text, row_key text, family text, qualifier text, ts bigint, value blob, \
            PRIMARY KEY ((bucket), row_key, family, qualifier, ts)) \
            WITH CLUSTERING ORDER BY (row_key ASC, family ASC, qualifier ASC, ts DESC)",
            self.keyspace, table,
        );
        self.session
            .query_unpaged(create_table_query_str, ())
            .await?;
        self.session.await_schema_agreement().await?;
        Ok(())
    }

    async fn table_info(&self, table: &str) -> Result<TableInfo> {
        self.ensure_table_exists(table).await?;
        let families = self.registered_families(table).await?;
        Ok(TableInfo { families })
    }

    async fn create_column_family(&self, table: &str, family: &str) -> Result<()> {
        self.ensure_table_exists(table).await?;
        let families = self.registered_families(table).await?;
        anyhow::ensure!(
            !families.iter().any(|f| f == family),
            "Column family {} already exists in table {}",
            family,
            table,
        );

        let insert_str = format!(
            "INSERT INTO {}.{} (table_name, family) VALUES (?, ?)",
            self.keyspace, RESERVED_TABLE_NAME,
        );
        self.session
            .query_unpaged(insert_str, (table, family))
            .await?;

        self.known_families
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(family.to_string());
        Ok(())
    }

    async fn apply_mutation(&self, table: &str, row_key: &str, mutation: Mutation) -> Result<()> {
        ensure_identifier("table", table)?;
        self.check_families(table, &mutation).await?;
        if mutation.is_empty() {
            return Ok(());
        }

        let statements = self.statements_for(table).await?;
        let bucket = entity_class(row_key);
        let mut values: Vec<_> = mutation
            .into_cells()
            .into_iter()
            .map(|cell| {
                (
                    bucket,
                    row_key,
                    cell.family,
                    cell.qualifier,
                    cell.timestamp_micros,
                    cell.value,
                    cell.timestamp_micros,
                )
            })
            .collect();

        if values.len() == 1 {
            let value = values.swap_remove(0);
            self.session
                .execute_unpaged(&statements.insert, value)
                .await?;
            return Ok(());
        }

        // All cells belong to one partition, so the batch is applied atomically
        let batch = write_batch(
            statements.insert,
            values.len(),
            self.consistency,
            self.timeout,
        );
        self.session.batch(&batch, values).await?;
        Ok(())
    }

    async fn scan_prefix(&self, table: &str, prefix: &str, limit: usize) -> Result<RowStream> {
        self.ensure_table_exists(table).await?;
        let statements = self.statements_for(table).await?;
        let buckets = self.buckets_for_prefix(table, prefix).await?;

        let session = Arc::clone(&self.session);
        let lower = prefix.to_string();
        let upper = prefix_successor(prefix);

        let cells = stream::iter(buckets)
            .then(move |bucket| {
                let session = Arc::clone(&session);
                let statements = statements.clone();
                let lower = lower.clone();
                let upper = upper.clone();
                async move {
                    let pager = match upper {
                        Some(upper) => {
                            session
                                .execute_iter(statements.scan_bounded, (bucket, lower, upper))
                                .await?
                        }
                        None => {
                            session
                                .execute_iter(statements.scan_unbounded, (bucket, lower))
                                .await?
                        }
                    };
                    let rows = pager
                        .rows_stream::<CellRow>()?
                        .map_err(anyhow::Error::from)
                        .map_ok(|(row_key, family, qualifier, ts, value)| {
                            let cell = Cell {
                                family,
                                qualifier,
                                timestamp_micros: ts,
                                value,
                            };
                            (row_key, cell)
                        });
                    Ok::<_, anyhow::Error>(rows)
                }
            })
            .try_flatten();

        Ok(group_cells_into_rows(cells, limit))
    }
}

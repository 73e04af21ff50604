use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use scylla::statement::Consistency;

use crate::gateway::cql::{CqlGateway, CqlOptions};
use crate::gateway::memory::InMemoryGateway;
use crate::gateway::{Mutation, RowStream, StorageGateway, TableInfo};

pub fn get_contact_node_uri() -> String {
    std::env::var("SCYLLA_URI").unwrap_or_else(|_| "127.0.0.1:9042".to_string())
}

pub async fn new_test_gateway() -> CqlGateway {
    let options = CqlOptions {
        nodes: vec![get_contact_node_uri()],
        replication_factor: 1,
        consistency: Consistency::One,
        timeout: Duration::from_secs(5),
    };
    CqlGateway::connect("device_bench", "test", &options)
        .await
        .unwrap()
}

/// An in-memory gateway which counts the calls made to it.
#[derive(Default)]
pub struct CountingGateway {
    pub inner: InMemoryGateway,
    pub list_tables_calls: AtomicUsize,
    pub create_table_calls: AtomicUsize,
    pub table_info_calls: AtomicUsize,
    pub create_column_family_calls: AtomicUsize,
    pub apply_calls: AtomicUsize,
    pub scan_calls: AtomicUsize,
}

impl CountingGateway {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

#[async_trait]
impl StorageGateway for CountingGateway {
    async fn list_tables(&self) -> Result<Vec<String>> {
        bump(&self.list_tables_calls);
        self.inner.list_tables().await
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        bump(&self.create_table_calls);
        self.inner.create_table(table).await
    }

    async fn table_info(&self, table: &str) -> Result<TableInfo> {
        bump(&self.table_info_calls);
        self.inner.table_info(table).await
    }

    async fn create_column_family(&self, table: &str, family: &str) -> Result<()> {
        bump(&self.create_column_family_calls);
        self.inner.create_column_family(table, family).await
    }

    async fn apply_mutation(&self, table: &str, row_key: &str, mutation: Mutation) -> Result<()> {
        bump(&self.apply_calls);
        self.inner.apply_mutation(table, row_key, mutation).await
    }

    async fn scan_prefix(&self, table: &str, prefix: &str, limit: usize) -> Result<RowStream> {
        bump(&self.scan_calls);
        self.inner.scan_prefix(table, prefix, limit).await
    }
}
